// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Memory-bounded merge-sort processor.
//!
//! Responsibilities:
//! - Accumulate individually sorted input chunks until input ends.
//! - When a row limit is set and the buffer crosses the remerge threshold,
//!   compact it in memory; back off once compaction stops paying.
//! - When the buffer crosses the external-sort threshold, sort it into a
//!   run and spill the run to disk.
//! - On finish, stream globally sorted output from a k-way merge over the
//!   spilled runs plus the in-memory remainder.

use std::sync::Arc;

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;
use crate::exec::operators::merge_sort::accumulator::ChunkAccumulator;
use crate::exec::operators::merge_sort::merge::KWayMergeStream;
use crate::exec::operators::merge_sort::remerge::{RemergeState, merge_into_run};
use crate::exec::operators::merge_sort::run::SortedRun;
use crate::exec::operators::merge_sort::snapshot::SortProgressView;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::sort_key::{SortColumnDesc, SortKeyCodec};
use crate::exec::spill::{SpillConfig, SpillFile, Spiller};
use crate::riffle_logging::{debug, info};
use crate::runtime::runtime_state::{DEFAULT_CHUNK_SIZE, RuntimeState};

#[derive(Debug, Clone)]
pub struct MergeSortConfig {
    pub sort_keys: Vec<SortColumnDesc>,
    /// Row cap of each emitted output chunk.
    pub max_merged_chunk_size: usize,
    /// Emit at most this many rows in total. 0 means unbounded.
    pub limit: usize,
    /// Buffered-byte threshold above which a limited sort compacts its
    /// buffer in memory. 0 disables remerging.
    pub max_bytes_before_remerge: usize,
    /// A remerge counts as productive when it shrinks the buffer to at most
    /// this fraction of its prior size.
    pub remerge_lowered_memory_ratio: f64,
    /// Buffered-byte threshold above which the buffer is spilled to disk.
    /// 0 disables spilling; the sort is then purely in-memory.
    pub max_bytes_before_external_sort: usize,
    /// Reject any single input chunk larger than this many bytes. 0
    /// disables the check.
    pub max_chunk_bytes: usize,
    pub spill: Option<SpillConfig>,
}

impl Default for MergeSortConfig {
    fn default() -> Self {
        Self {
            sort_keys: Vec::new(),
            max_merged_chunk_size: DEFAULT_CHUNK_SIZE,
            limit: 0,
            max_bytes_before_remerge: 0,
            remerge_lowered_memory_ratio: 0.5,
            max_bytes_before_external_sort: 0,
            max_chunk_bytes: 0,
            spill: None,
        }
    }
}

impl MergeSortConfig {
    fn limit(&self) -> Option<usize> {
        if self.limit == 0 { None } else { Some(self.limit) }
    }

    fn validate(&self) -> Result<(), SortError> {
        if self.sort_keys.is_empty() {
            return Err(SortError::internal("sort_keys must not be empty"));
        }
        if self.max_merged_chunk_size == 0 {
            return Err(SortError::internal("max_merged_chunk_size must be positive"));
        }
        if self.max_bytes_before_external_sort > 0 && self.spill.is_none() {
            return Err(SortError::internal(
                "external sort requires spill storage to be configured",
            ));
        }
        Ok(())
    }
}

pub struct MergeSortProcessorFactory {
    name: String,
    config: MergeSortConfig,
    spiller: Option<Arc<Spiller>>,
}

impl MergeSortProcessorFactory {
    pub fn new(node_id: i32, config: MergeSortConfig) -> Result<Self, SortError> {
        config.validate()?;
        let spiller = config
            .spill
            .clone()
            .map(Spiller::new)
            .transpose()?
            .map(Arc::new);
        Ok(Self {
            name: format!("MERGE_SORT (id={node_id})"),
            config,
            spiller,
        })
    }
}

impl OperatorFactory for MergeSortProcessorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, _dop: i32, _driver_id: i32) -> Box<dyn Operator> {
        Box::new(MergeSortOperator::with_spiller(
            self.name.clone(),
            self.config.clone(),
            self.spiller.clone(),
        ))
    }
}

#[derive(Debug)]
pub struct MergeSortOperator {
    name: String,
    config: MergeSortConfig,
    sort_keys: Arc<Vec<SortColumnDesc>>,
    spiller: Option<Arc<Spiller>>,
    accumulator: ChunkAccumulator,
    remerge_state: RemergeState,
    spilled_runs: Vec<SpillFile>,
    finale: Option<KWayMergeStream>,
    progress: SortProgressView,
    finishing: bool,
    finished: bool,
    canceled: bool,
}

impl MergeSortOperator {
    pub fn new(config: MergeSortConfig) -> Result<Self, SortError> {
        config.validate()?;
        let spiller = config
            .spill
            .clone()
            .map(Spiller::new)
            .transpose()?
            .map(Arc::new);
        Ok(Self::with_spiller("MERGE_SORT".to_string(), config, spiller))
    }

    fn with_spiller(
        name: String,
        config: MergeSortConfig,
        spiller: Option<Arc<Spiller>>,
    ) -> Self {
        let sort_keys = Arc::new(config.sort_keys.clone());
        let accumulator = ChunkAccumulator::new(config.max_chunk_bytes);
        let progress = SortProgressView::new(sort_keys.clone());
        Self {
            name,
            config,
            sort_keys,
            spiller,
            accumulator,
            remerge_state: RemergeState::default(),
            spilled_runs: Vec::new(),
            finale: None,
            progress,
            finishing: false,
            finished: false,
            canceled: false,
        }
    }

    /// Shared handle for observing partial results while the sort runs.
    pub fn progress_view(&self) -> SortProgressView {
        self.progress.clone()
    }

    /// Buffer one individually sorted chunk, then apply the memory policy.
    pub fn accept_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<(), SortError> {
        self.check_canceled(state)?;
        if self.finishing || self.finished {
            return Err(SortError::internal("input arrived after finish"));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.accumulator.accept(chunk.clone())?;
        self.progress.push(&chunk);

        let remerge_threshold = self.config.max_bytes_before_remerge;
        let limit = self.config.limit();
        if remerge_threshold > 0
            && self.accumulator.sum_bytes() >= remerge_threshold
            && self.remerge_state.is_active()
            && let Some(limit) = limit
        {
            self.remerge(limit)?;
        }
        // Spill at the external threshold, or when the limited sort is still
        // over the remerge threshold (remerge disabled or unproductive).
        let spill_enabled = self.config.max_bytes_before_external_sort > 0;
        let must_spill = spill_enabled
            && (self.accumulator.sum_bytes() >= self.config.max_bytes_before_external_sort
                || (remerge_threshold > 0
                    && limit.is_some()
                    && self.accumulator.sum_bytes() >= remerge_threshold));
        if must_spill {
            self.spill()?;
        }
        Ok(())
    }

    /// Declare end of input and set up the final merge.
    pub fn finish_input(&mut self, state: &RuntimeState) -> Result<(), SortError> {
        self.check_canceled(state)?;
        if self.finishing {
            return Ok(());
        }
        self.finishing = true;

        let Some(schema) = self.accumulator.schema().cloned() else {
            // No chunk ever arrived, so nothing was spilled either.
            self.finished = true;
            return Ok(());
        };
        let codec = SortKeyCodec::try_new(&schema, &self.sort_keys)?;

        let mut runs: Vec<SortedRun> = self
            .spilled_runs
            .drain(..)
            .map(SortedRun::Spilled)
            .collect();
        if !self.accumulator.is_empty() {
            let tail = merge_into_run(
                &self.sort_keys,
                self.accumulator.chunks(),
                self.config.limit(),
                self.config.max_merged_chunk_size,
            )?;
            self.accumulator.reset();
            self.progress.replace(&tail);
            if !tail.is_empty() {
                runs.push(SortedRun::Memory(tail));
            }
        }
        if runs.is_empty() {
            self.finished = true;
            return Ok(());
        }
        if runs.len() > 1 {
            info!(
                "{}: merging {} sorted runs ({} spilled)",
                self.name,
                runs.len(),
                runs.iter()
                    .filter(|r| matches!(r, SortedRun::Spilled(_)))
                    .count()
            );
        }
        self.finale = Some(KWayMergeStream::new(
            codec,
            schema,
            runs,
            self.config.limit(),
            self.config.max_merged_chunk_size,
        )?);
        Ok(())
    }

    /// Next chunk of sorted output. `None` before `finish_input`, and again
    /// once the merge is exhausted.
    pub fn next_sorted_chunk(
        &mut self,
        state: &RuntimeState,
    ) -> Result<Option<Chunk>, SortError> {
        self.check_canceled(state)?;
        if !self.finishing || self.finished {
            return Ok(None);
        }
        let Some(stream) = self.finale.as_mut() else {
            self.finished = true;
            return Ok(None);
        };
        match stream.next_chunk()? {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                self.release_resources();
                self.finished = true;
                Ok(None)
            }
        }
    }

    fn remerge(&mut self, limit: usize) -> Result<(), SortError> {
        let before_bytes = self.accumulator.sum_bytes();
        let before_rows = self.accumulator.sum_rows();
        let compacted = merge_into_run(
            &self.sort_keys,
            self.accumulator.chunks(),
            Some(limit),
            self.config.max_merged_chunk_size,
        )?;
        self.accumulator.replace_chunks(compacted);
        self.progress.replace(self.accumulator.chunks());
        debug!(
            "{}: remerge lowered buffer from {} to {} bytes ({} to {} rows)",
            self.name,
            before_bytes,
            self.accumulator.sum_bytes(),
            before_rows,
            self.accumulator.sum_rows()
        );
        let next = self.remerge_state.observe(
            before_bytes,
            self.accumulator.sum_bytes(),
            self.config.remerge_lowered_memory_ratio,
        );
        if self.remerge_state.is_active() && !next.is_active() {
            debug!(
                "{}: remerge stopped recovering memory, disabling further remerges",
                self.name
            );
        }
        self.remerge_state = next;
        Ok(())
    }

    fn spill(&mut self) -> Result<(), SortError> {
        let Some(spiller) = self.spiller.as_ref() else {
            return Err(SortError::internal("spill storage not configured"));
        };
        let run = merge_into_run(
            &self.sort_keys,
            self.accumulator.chunks(),
            self.config.limit(),
            self.config.max_merged_chunk_size,
        )?;
        if run.is_empty() {
            return Ok(());
        }
        let file = spiller.spill_run(&run)?;
        info!(
            "{}: spilled run {} with {} rows ({} bytes) to {}",
            self.name,
            self.spilled_runs.len(),
            file.rows(),
            file.bytes(),
            file.path().display()
        );
        self.spilled_runs.push(file);
        self.accumulator.reset();
        self.progress.clear();
        Ok(())
    }

    fn check_canceled(&self, state: &RuntimeState) -> Result<(), SortError> {
        if self.canceled || state.is_canceled() {
            return Err(SortError::canceled());
        }
        Ok(())
    }

    fn release_resources(&mut self) {
        // Dropping spill handles removes their files.
        self.finale = None;
        self.spilled_runs.clear();
        self.accumulator.reset();
        self.progress.clear();
    }
}

impl Operator for MergeSortOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<(), String> {
        self.release_resources();
        self.finished = true;
        Ok(())
    }

    fn cancel(&mut self) {
        self.canceled = true;
        self.release_resources();
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for MergeSortOperator {
    fn need_input(&self) -> bool {
        !self.finishing && !self.finished && !self.canceled
    }

    fn has_output(&self) -> bool {
        self.finishing && !self.finished && !self.canceled
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> Result<(), String> {
        self.accept_chunk(state, chunk).map_err(String::from)
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> Result<Option<Chunk>, String> {
        self.next_sorted_chunk(state).map_err(String::from)
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> Result<(), String> {
        self.finish_input(state).map_err(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::error::SortErrorKind;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

    fn chunk_of(values: Vec<i32>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        Chunk::new(
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap(),
        )
    }

    fn drain(op: &mut MergeSortOperator, state: &RuntimeState) -> Vec<i32> {
        let mut out = Vec::new();
        while let Some(chunk) = op.next_sorted_chunk(state).unwrap() {
            let col = chunk
                .batch
                .column(0)
                .as_any()
                .downcast_ref::<Int32Array>()
                .unwrap();
            out.extend_from_slice(col.values());
        }
        out
    }

    fn basic_config() -> MergeSortConfig {
        MergeSortConfig {
            sort_keys: vec![SortColumnDesc::ascending("v")],
            ..MergeSortConfig::default()
        }
    }

    #[test]
    fn validate_rejects_empty_sort_keys() {
        let err = MergeSortOperator::new(MergeSortConfig::default()).unwrap_err();
        assert_eq!(err.kind, SortErrorKind::Internal);
    }

    #[test]
    fn validate_requires_spill_storage_for_external_sort() {
        let config = MergeSortConfig {
            max_bytes_before_external_sort: 1,
            ..basic_config()
        };
        assert!(MergeSortOperator::new(config).is_err());
    }

    #[test]
    fn in_memory_sort_with_limit() {
        let state = RuntimeState::default();
        let config = MergeSortConfig {
            limit: 4,
            ..basic_config()
        };
        let mut op = MergeSortOperator::new(config).unwrap();
        op.accept_chunk(&state, chunk_of(vec![5, 9])).unwrap();
        op.accept_chunk(&state, chunk_of(vec![1, 2, 7])).unwrap();
        op.accept_chunk(&state, chunk_of(vec![3, 3, 8])).unwrap();
        op.finish_input(&state).unwrap();
        assert_eq!(drain(&mut op, &state), vec![1, 2, 3, 3]);
        assert!(op.is_finished());
    }

    #[test]
    fn empty_input_finishes_immediately() {
        let state = RuntimeState::default();
        let mut op = MergeSortOperator::new(basic_config()).unwrap();
        op.finish_input(&state).unwrap();
        assert!(op.next_sorted_chunk(&state).unwrap().is_none());
        assert!(op.is_finished());
    }

    #[test]
    fn input_after_finish_is_rejected() {
        let state = RuntimeState::default();
        let mut op = MergeSortOperator::new(basic_config()).unwrap();
        op.finish_input(&state).unwrap();
        assert!(op.accept_chunk(&state, chunk_of(vec![1])).is_err());
    }

    #[test]
    fn cancellation_fails_pending_calls() {
        let state = RuntimeState::default();
        let mut op = MergeSortOperator::new(basic_config()).unwrap();
        op.accept_chunk(&state, chunk_of(vec![1])).unwrap();
        state.cancel();
        let err = op.accept_chunk(&state, chunk_of(vec![2])).unwrap_err();
        assert_eq!(err.kind, SortErrorKind::Canceled);
        let err = op.finish_input(&state).unwrap_err();
        assert_eq!(err.kind, SortErrorKind::Canceled);
    }

    #[test]
    fn remerge_compacts_a_limited_buffer() {
        let state = RuntimeState::default();
        let config = MergeSortConfig {
            limit: 2,
            max_bytes_before_remerge: 1,
            ..basic_config()
        };
        let mut op = MergeSortOperator::new(config).unwrap();
        op.accept_chunk(&state, chunk_of(vec![4, 5, 6, 7])).unwrap();
        op.accept_chunk(&state, chunk_of(vec![1, 2, 3])).unwrap();
        // Each accept crossed the threshold, so the buffer holds at most
        // `limit` rows afterwards.
        assert!(op.accumulator.sum_rows() <= 2);
        op.finish_input(&state).unwrap();
        assert_eq!(drain(&mut op, &state), vec![1, 2]);
    }

    #[test]
    fn remerge_is_skipped_without_a_limit() {
        let state = RuntimeState::default();
        let config = MergeSortConfig {
            max_bytes_before_remerge: 1,
            ..basic_config()
        };
        let mut op = MergeSortOperator::new(config).unwrap();
        op.accept_chunk(&state, chunk_of(vec![3, 4])).unwrap();
        op.accept_chunk(&state, chunk_of(vec![1, 2])).unwrap();
        assert_eq!(op.accumulator.chunks().len(), 2);
        assert!(op.remerge_state.is_active());
    }

    #[test]
    fn unproductive_remerge_escalates_to_spill() {
        let temp = tempfile::tempdir().unwrap();
        let state = RuntimeState::default();
        let config = MergeSortConfig {
            limit: 1000,
            max_bytes_before_remerge: 1,
            max_bytes_before_external_sort: usize::MAX,
            spill: Some(SpillConfig::new(vec![temp.path().to_path_buf()])),
            ..basic_config()
        };
        let mut op = MergeSortOperator::new(config).unwrap();
        // The limit is far above the row count, so remerge cannot shrink the
        // buffer below the remerge threshold and the buffer goes to disk
        // without ever reaching the external threshold.
        op.accept_chunk(&state, chunk_of(vec![2, 1])).unwrap();
        assert_eq!(op.spilled_runs.len(), 1);
        assert!(op.accumulator.is_empty());
        op.finish_input(&state).unwrap();
        assert_eq!(drain(&mut op, &state), vec![1, 2]);
    }

    #[test]
    fn spill_threshold_moves_the_buffer_to_disk() {
        let temp = tempfile::tempdir().unwrap();
        let state = RuntimeState::default();
        let config = MergeSortConfig {
            max_bytes_before_external_sort: 1,
            spill: Some(SpillConfig::new(vec![temp.path().to_path_buf()])),
            ..basic_config()
        };
        let mut op = MergeSortOperator::new(config).unwrap();
        op.accept_chunk(&state, chunk_of(vec![5, 9])).unwrap();
        op.accept_chunk(&state, chunk_of(vec![1, 7])).unwrap();
        assert_eq!(op.spilled_runs.len(), 2);
        assert!(op.accumulator.is_empty());
        op.finish_input(&state).unwrap();
        assert_eq!(drain(&mut op, &state), vec![1, 5, 7, 9]);
        // All run files are reclaimed once the merge completes.
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancel_releases_spilled_runs() {
        let temp = tempfile::tempdir().unwrap();
        let state = RuntimeState::default();
        let config = MergeSortConfig {
            max_bytes_before_external_sort: 1,
            spill: Some(SpillConfig::new(vec![temp.path().to_path_buf()])),
            ..basic_config()
        };
        let mut op = MergeSortOperator::new(config).unwrap();
        op.accept_chunk(&state, chunk_of(vec![2, 1])).unwrap();
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
        op.cancel();
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
