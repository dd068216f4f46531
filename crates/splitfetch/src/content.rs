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

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;

use crate::name::Name;

/// An immutable unit of payload together with the name it was published
/// under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentObject {
    name:    Name,
    payload: Bytes,
}

impl ContentObject {
    pub fn new(name: Name, payload: impl Into<Bytes>) -> Self {
        Self {
            name,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &Name { &self.name }

    #[must_use]
    pub const fn payload(&self) -> &Bytes { &self.payload }
}

/// Content objects delivered together, keyed by split sequence number.
///
/// The map is ordered, so the "first" object of a batch is the one with the
/// lowest sequence number.
pub type Batch = BTreeMap<u64, Arc<ContentObject>>;

/// Total payload bytes carried by a batch.
#[must_use]
pub fn batch_payload_len(batch: &Batch) -> usize {
    batch.values().map(|object| object.payload().len()).sum()
}
