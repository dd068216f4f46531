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

//! Aggregation tree topology.
//!
//! The file is TOML with a single `nodes` table mapping each inner node to
//! its children:
//!
//! ```toml
//! [nodes]
//! con0 = ["agg1", "agg2"]
//! agg1 = ["p1", "p2"]
//! agg2 = ["p3"]
//! ```
//!
//! Nodes that never appear as a key are leaves.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};

use serde::Deserialize;
use snafu::{OptionExt, ResultExt, ensure};

use crate::error::{
    InvalidTopologySnafu, SplitError, TopologyParseSnafu, TopologyReadSnafu, UnknownRootSnafu,
};

#[derive(Debug, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    nodes: BTreeMap<String, Vec<String>>,
}

/// The subtree of an aggregation topology below one root node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationTree {
    root:      String,
    children:  HashMap<String, Vec<String>>,
    /// Every node below the root mapped to the first-level child it hangs off.
    branch_of: HashMap<String, String>,
}

impl AggregationTree {
    pub fn load(path: impl AsRef<Path>, root_id: &str) -> Result<Self, SplitError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(TopologyReadSnafu { path })?;
        let file: TopologyFile = toml::from_str(&contents).context(TopologyParseSnafu { path })?;
        Self::from_edges(file.nodes, root_id)
    }

    /// Builds the tree below `root_id` from a node → children mapping.
    pub fn from_edges<I, C>(edges: I, root_id: &str) -> Result<Self, SplitError>
    where
        I: IntoIterator<Item = (String, C)>,
        C: IntoIterator<Item = String>,
    {
        let all: HashMap<String, Vec<String>> = edges
            .into_iter()
            .map(|(node, children)| (node, children.into_iter().collect()))
            .collect();

        let root_children = all
            .get(root_id)
            .context(UnknownRootSnafu { root: root_id })?;
        ensure!(
            !root_children.is_empty(),
            InvalidTopologySnafu {
                message: format!("root {root_id} has no children"),
            }
        );

        let mut children = HashMap::new();
        let mut branch_of = HashMap::new();
        children.insert(root_id.to_string(), root_children.clone());

        for branch in root_children {
            let mut stack = vec![branch.clone()];
            while let Some(node) = stack.pop() {
                ensure!(
                    node != root_id && !branch_of.contains_key(&node),
                    InvalidTopologySnafu {
                        message: format!("node {node} is reachable more than once from {root_id}"),
                    }
                );
                branch_of.insert(node.clone(), branch.clone());
                if let Some(kids) = all.get(&node) {
                    children.insert(node.clone(), kids.clone());
                    stack.extend(kids.iter().cloned());
                }
            }
        }

        Ok(Self {
            root: root_id.to_string(),
            children,
            branch_of,
        })
    }

    #[must_use]
    pub fn root(&self) -> &str { &self.root }

    /// First-level children of the root, in file order.
    #[must_use]
    pub fn root_children(&self) -> &[String] {
        self.children.get(&self.root).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn root_child_count(&self) -> usize { self.root_children().len() }

    /// The first-level branch `node` belongs to. A first-level child is its
    /// own branch; the root and unknown nodes have none.
    #[must_use]
    pub fn branch_of(&self, node: &str) -> Option<&str> {
        self.branch_of.get(node).map(String::as_str)
    }

    #[must_use]
    pub fn children_of(&self, node: &str) -> &[String] {
        self.children.get(node).map_or(&[], Vec::as_slice)
    }

    /// Leaves of the subtree rooted at `node`, depth first.
    #[must_use]
    pub fn leaves_under<'a>(&'a self, node: &'a str) -> Vec<&'a str> {
        let mut leaves = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let kids = self.children_of(current);
            if kids.is_empty() {
                leaves.push(current);
            } else {
                stack.extend(kids.iter().rev().map(String::as_str));
            }
        }
        leaves
    }

    #[must_use]
    pub fn node_count(&self) -> usize { self.branch_of.len() + 1 }
}
