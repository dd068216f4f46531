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
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use bytes::Bytes;
use snafu::{OptionExt, ResultExt, ensure};
use strum_macros::{Display, EnumString};
use tracing::debug;

use crate::{
    config::FlowConfig,
    content::Batch,
    error::{
        BufferFullSnafu, ChunkOutOfRangeSnafu, FlowError, InvalidConfigurationSnafu,
        SinkWriteSnafu, SplitError, UnknownNodeSnafu,
    },
    topology::AggregationTree,
};

/// What the controller did with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Intake {
    /// Accepted; the branch still has chunks outstanding.
    Buffered,
    /// Already seen, ignored.
    Duplicate,
    /// Accepted, and it was the last missing chunk of its first-level branch.
    /// Reported once per branch.
    BranchComplete,
}

/// Downstream stage that receives the chunks extracted from arrivals.
pub trait FlowController: Send {
    fn add_chunk(&mut self, node_id: &str, chunk_no: u64, batch: &Batch)
    -> Result<Intake, FlowError>;
}

#[derive(Debug)]
struct BranchState {
    id:            String,
    /// Chunks received but not yet written.
    pending:       BTreeMap<u64, Vec<Bytes>>,
    /// Lowest chunk number not yet received contiguously from zero.
    next_received: u64,
    /// Lowest chunk number not yet written to the sink.
    next_emitted:  u64,
}

impl BranchState {
    const fn is_received(&self, limit: u64) -> bool { self.next_received >= limit }

    const fn is_emitted(&self, limit: u64) -> bool { self.next_emitted >= limit }
}

/// Writes chunks to the sink branch by branch in topology order and, within
/// a branch, in chunk order. Chunks that arrive early wait in a per-branch
/// reorder buffer.
#[derive(Debug)]
pub struct ReorderingFlowController<W: Write + Send> {
    sink:          W,
    config:        FlowConfig,
    branches:      Vec<BranchState>,
    branch_index:  HashMap<String, usize>,
    tree:          AggregationTree,
    /// Branch currently being written.
    cursor:        usize,
    buffered:      usize,
    bytes_written: u64,
}

impl ReorderingFlowController<BufWriter<File>> {
    /// Reads the controller settings from `config_path` and binds the
    /// controller to `sink` and to the branches below `root_id`.
    pub fn from_tree(
        config_path: impl AsRef<Path>,
        sink: File,
        tree: &AggregationTree,
        root_id: &str,
    ) -> Result<Self, SplitError> {
        let config = FlowConfig::load(config_path)?;
        Self::new(config, BufWriter::new(sink), tree, root_id)
    }
}

impl<W: Write + Send> ReorderingFlowController<W> {
    pub fn new(
        config: FlowConfig,
        sink: W,
        tree: &AggregationTree,
        root_id: &str,
    ) -> Result<Self, SplitError> {
        ensure!(
            tree.root() == root_id,
            InvalidConfigurationSnafu {
                message: format!(
                    "flow controller rooted at {root_id} but topology is rooted at {}",
                    tree.root()
                ),
            }
        );
        ensure!(
            config.chunks_per_branch > 0,
            InvalidConfigurationSnafu {
                message: "chunks_per_branch must be positive".to_string(),
            }
        );

        let branches: Vec<BranchState> = tree
            .root_children()
            .iter()
            .map(|id| BranchState {
                id:            id.clone(),
                pending:       BTreeMap::new(),
                next_received: 0,
                next_emitted:  0,
            })
            .collect();
        let branch_index = branches
            .iter()
            .enumerate()
            .map(|(idx, branch)| (branch.id.clone(), idx))
            .collect();

        Ok(Self {
            sink,
            config,
            branches,
            branch_index,
            tree: tree.clone(),
            cursor: 0,
            buffered: 0,
            bytes_written: 0,
        })
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 { self.bytes_written }

    #[must_use]
    pub const fn buffered_chunks(&self) -> usize { self.buffered }

    /// True once every branch has been written out.
    #[must_use]
    pub fn is_finished(&self) -> bool { self.cursor >= self.branches.len() }

    pub fn into_sink(self) -> W { self.sink }

    /// Writes every chunk that is next in line, moving the cursor past
    /// branches that are fully written.
    fn drain(&mut self) -> Result<(), FlowError> {
        let limit = self.config.chunks_per_branch;
        let mut wrote = false;

        while let Some(branch) = self.branches.get_mut(self.cursor) {
            while let Some(parts) = branch.pending.remove(&branch.next_emitted) {
                for part in parts {
                    self.sink.write_all(&part).context(SinkWriteSnafu)?;
                    self.bytes_written += part.len() as u64;
                }
                branch.next_emitted += 1;
                self.buffered -= 1;
                wrote = true;
            }
            if !branch.is_emitted(limit) {
                break;
            }
            debug!(branch = %branch.id, "branch written to sink");
            self.cursor += 1;
        }

        if wrote {
            self.sink.flush().context(SinkWriteSnafu)?;
        }
        Ok(())
    }
}

impl<W: Write + Send> FlowController for ReorderingFlowController<W> {
    fn add_chunk(
        &mut self,
        node_id: &str,
        chunk_no: u64,
        batch: &Batch,
    ) -> Result<Intake, FlowError> {
        let limit = self.config.chunks_per_branch;
        let branch_id = self
            .tree
            .branch_of(node_id)
            .context(UnknownNodeSnafu { node: node_id })?;
        let idx = *self
            .branch_index
            .get(branch_id)
            .context(UnknownNodeSnafu { node: node_id })?;
        ensure!(
            chunk_no < limit,
            ChunkOutOfRangeSnafu {
                node: node_id,
                chunk: chunk_no,
                limit,
            }
        );

        let cursor = self.cursor;
        let branch = &mut self.branches[idx];
        if chunk_no < branch.next_emitted || branch.pending.contains_key(&chunk_no) {
            return Ok(Intake::Duplicate);
        }
        // The chunk the sink waits for is written at once and must always get in,
        // otherwise a full buffer can never drain.
        let writable_now = idx == cursor && chunk_no == branch.next_emitted;
        ensure!(
            writable_now || self.buffered < self.config.max_buffered_chunks,
            BufferFullSnafu {
                limit: self.config.max_buffered_chunks,
            }
        );

        let was_received = branch.is_received(limit);
        branch
            .pending
            .insert(chunk_no, batch.values().map(|o| o.payload().clone()).collect());
        self.buffered += 1;
        while branch.next_received < limit && branch.pending.contains_key(&branch.next_received) {
            branch.next_received += 1;
        }
        let completed = !was_received && branch.is_received(limit);

        self.drain()?;

        Ok(if completed {
            Intake::BranchComplete
        } else {
            Intake::Buffered
        })
    }
}
