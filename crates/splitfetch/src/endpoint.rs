// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::ResultExt;
use tokio::fs;
use tracing::debug;

use crate::{
    content::ContentObject,
    error::{EndpointSeedSnafu, FetchError, SplitError},
    name::Name,
};

/// A transport endpoint split requests can be sent through.
///
/// The orchestrator only holds endpoints; requests are issued by the
/// retrieval strategy.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Requests the object published under `name`. The returned object
    /// carries the requested name.
    async fn fetch(&self, name: &Name) -> Result<ContentObject, FetchError>;
}

/// Endpoint answering from an in-memory repository.
///
/// Objects are stored under their name without the trailing sequence
/// component, so any split number requesting the same chunk is served.
#[derive(Debug, Default)]
pub struct MemoryEndpoint {
    name:          String,
    objects:       RwLock<HashMap<Name, Bytes>>,
    failures_left: AtomicUsize,
    served:        AtomicUsize,
}

impl MemoryEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Seeds an endpoint from `dir/<branch>/<chunk>` files. Each file becomes
    /// the payload of `/<branch>/<target...>/<chunk>`; entries whose file
    /// name is not a chunk number are skipped.
    pub async fn from_dir(
        name: impl Into<String>,
        dir: impl AsRef<Path>,
        target: &Name,
    ) -> Result<Self, SplitError> {
        let endpoint = Self::new(name);
        let dir = dir.as_ref();

        let mut branches = fs::read_dir(dir).await.context(EndpointSeedSnafu { path: dir })?;
        while let Some(branch) = branches
            .next_entry()
            .await
            .context(EndpointSeedSnafu { path: dir })?
        {
            let branch_path = branch.path();
            if !branch_path.is_dir() {
                continue;
            }
            let branch_id = branch.file_name().to_string_lossy().into_owned();

            let mut chunks = fs::read_dir(&branch_path)
                .await
                .context(EndpointSeedSnafu { path: &branch_path })?;
            while let Some(chunk) = chunks
                .next_entry()
                .await
                .context(EndpointSeedSnafu { path: &branch_path })?
            {
                let Ok(chunk_no) = chunk.file_name().to_string_lossy().parse::<u64>() else {
                    continue;
                };
                let chunk_path = chunk.path();
                let payload = fs::read(&chunk_path)
                    .await
                    .context(EndpointSeedSnafu { path: &chunk_path })?;
                let object_name = Name::from(format!("/{branch_id}").as_str())
                    .join(target)
                    .append(chunk_no.to_string());
                endpoint.insert(object_name, payload);
            }
        }

        debug!(endpoint = %endpoint.name, objects = endpoint.len(), "seeded endpoint");
        Ok(endpoint)
    }

    pub fn insert(&self, name: Name, payload: impl Into<Bytes>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, payload.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Makes the next `count` fetches fail with a transport error.
    pub fn fail_next(&self, count: usize) { self.failures_left.store(count, Ordering::SeqCst); }

    /// Number of fetches answered with content.
    #[must_use]
    pub fn served(&self) -> usize { self.served.load(Ordering::SeqCst) }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn name(&self) -> &str { &self.name }

    async fn fetch(&self, name: &Name) -> Result<ContentObject, FetchError> {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FetchError::Transport {
                endpoint: self.name.clone(),
                message:  "injected failure".to_string(),
            });
        }

        let payload = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.without_sequence())
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                name: name.to_uri(),
            })?;
        self.served.fetch_add(1, Ordering::SeqCst);
        Ok(ContentObject::new(name.clone(), payload))
    }
}
