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

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

const VERSION_MARKER: &str = "v=";
const SEQUENCE_MARKER: &str = "seq=";

/// One opaque component of a [`Name`].
///
/// Version and sequence numbers are ordinary components carrying the
/// `v=` and `seq=` markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Component(String);

impl Component {
    pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }

    #[must_use]
    pub fn version(version: u64) -> Self { Self(format!("{VERSION_MARKER}{version}")) }

    #[must_use]
    pub fn sequence(seq: u64) -> Self { Self(format!("{SEQUENCE_MARKER}{seq}")) }

    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }

    #[must_use]
    pub fn as_version(&self) -> Option<u64> { marked_number(&self.0, VERSION_MARKER) }

    #[must_use]
    pub fn as_sequence(&self) -> Option<u64> { marked_number(&self.0, SEQUENCE_MARKER) }

    #[must_use]
    pub fn is_version(&self) -> bool { self.as_version().is_some() }

    #[must_use]
    pub fn is_sequence(&self) -> bool { self.as_sequence().is_some() }
}

fn marked_number(value: &str, marker: &str) -> Option<u64> {
    value.strip_prefix(marker)?.parse().ok()
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Component {
    fn from(value: &str) -> Self { Self::new(value) }
}

impl From<String> for Component {
    fn from(value: String) -> Self { Self(value) }
}

/// Hierarchical content identifier, written as `/a/b/v=3`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Name(Vec<Component>);

impl Name {
    #[must_use]
    pub const fn new() -> Self { Self(Vec::new()) }

    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    #[must_use]
    pub fn first(&self) -> Option<&Component> { self.0.first() }

    #[must_use]
    pub fn last(&self) -> Option<&Component> { self.0.last() }

    /// Component at `index`; negative indices count from the end, so `-1` is
    /// the last component.
    #[must_use]
    pub fn get(&self, index: isize) -> Option<&Component> {
        let idx = if index < 0 {
            self.0.len().checked_sub(index.unsigned_abs())?
        } else {
            index.unsigned_abs()
        };
        self.0.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> { self.0.iter() }

    #[must_use]
    pub fn append(mut self, component: impl Into<Component>) -> Self {
        self.0.push(component.into());
        self
    }

    #[must_use]
    pub fn append_version(self, version: u64) -> Self { self.append(Component::version(version)) }

    #[must_use]
    pub fn append_sequence(self, seq: u64) -> Self { self.append(Component::sequence(seq)) }

    /// Appends every component of `other`.
    #[must_use]
    pub fn join(mut self, other: &Self) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    /// The first `len` components, or the whole name if it is shorter.
    #[must_use]
    pub fn prefix(&self, len: usize) -> Self { Self(self.0.iter().take(len).cloned().collect()) }

    #[must_use]
    pub fn starts_with(&self, other: &Self) -> bool { self.0.starts_with(&other.0) }

    /// The name without a trailing sequence component, if it has one.
    #[must_use]
    pub fn without_sequence(&self) -> Self {
        match self.last() {
            Some(last) if last.is_sequence() => self.prefix(self.len() - 1),
            _ => self.clone(),
        }
    }

    #[must_use]
    pub fn to_uri(&self) -> String { self.to_string() }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for component in &self.0 {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

impl FromStr for Name {
    type Err = std::convert::Infallible;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            uri.split('/')
                .filter(|part| !part.is_empty())
                .map(Component::from)
                .collect(),
        ))
    }
}

impl From<&str> for Name {
    fn from(uri: &str) -> Self {
        let Ok(name) = uri.parse::<Self>();
        name
    }
}

impl FromIterator<Component> for Name {
    fn from_iter<T: IntoIterator<Item = Component>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
