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
//! In-memory compaction of buffered chunks.
//!
//! When a row limit is set, re-sorting the buffered chunks and truncating to
//! the limit can shed most of the buffered bytes. Whether that pays off
//! depends on the data; `RemergeState` tracks how much memory each remerge
//! actually recovered and stops remerging after it misses twice in a row.

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;
use crate::exec::sort_key::{SortColumnDesc, rechunk, sort_chunks};

/// Consecutive unproductive remerges tolerated before giving up.
const MAX_UNPRODUCTIVE_REMERGES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemergeState {
    Active { unproductive: u32 },
    Disabled,
}

impl Default for RemergeState {
    fn default() -> Self {
        RemergeState::Active { unproductive: 0 }
    }
}

impl RemergeState {
    pub(crate) fn is_active(&self) -> bool {
        matches!(self, RemergeState::Active { .. })
    }

    /// Fold in the outcome of one remerge. A remerge is productive when it
    /// shrank the buffer to at most `lowered_ratio` of its prior size; a
    /// non-positive ratio treats every remerge as productive.
    pub(crate) fn observe(self, before_bytes: usize, after_bytes: usize, lowered_ratio: f64) -> Self {
        let RemergeState::Active { unproductive } = self else {
            return self;
        };
        let productive = lowered_ratio <= 0.0
            || (after_bytes as f64) <= (before_bytes as f64) * lowered_ratio;
        if productive {
            RemergeState::Active { unproductive: 0 }
        } else if unproductive + 1 >= MAX_UNPRODUCTIVE_REMERGES {
            RemergeState::Disabled
        } else {
            RemergeState::Active {
                unproductive: unproductive + 1,
            }
        }
    }
}

/// Merge `chunks` into one globally sorted run, truncated to `limit` rows
/// when set, and re-split into chunks of at most `chunk_size` rows.
pub(crate) fn merge_into_run(
    sort_keys: &[SortColumnDesc],
    chunks: &[Chunk],
    limit: Option<usize>,
    chunk_size: usize,
) -> Result<Vec<Chunk>, SortError> {
    match sort_chunks(sort_keys, chunks, limit)? {
        Some(merged) => Ok(rechunk(merged, chunk_size)),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn two_consecutive_misses_disable_remerge() {
        let state = RemergeState::default();
        let state = state.observe(100, 90, 0.5);
        assert!(state.is_active());
        let state = state.observe(100, 90, 0.5);
        assert_eq!(state, RemergeState::Disabled);
    }

    #[test]
    fn a_productive_remerge_resets_the_miss_count() {
        let state = RemergeState::default();
        let state = state.observe(100, 90, 0.5);
        let state = state.observe(100, 40, 0.5);
        assert_eq!(state, RemergeState::Active { unproductive: 0 });
        let state = state.observe(100, 90, 0.5);
        assert!(state.is_active());
    }

    #[test]
    fn disabled_state_is_terminal() {
        let state = RemergeState::Disabled.observe(100, 1, 0.5);
        assert_eq!(state, RemergeState::Disabled);
    }

    #[test]
    fn non_positive_ratio_never_disables() {
        let mut state = RemergeState::default();
        for _ in 0..10 {
            state = state.observe(100, 100, 0.0);
        }
        assert!(state.is_active());
    }

    #[test]
    fn merge_into_run_truncates_and_rechunks() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let chunk = |values: Vec<i32>| {
            Chunk::new(
                RecordBatch::try_new(schema.clone(), vec![Arc::new(Int32Array::from(values))])
                    .unwrap(),
            )
        };
        let keys = vec![SortColumnDesc::ascending("v")];
        let out = merge_into_run(&keys, &[chunk(vec![5, 9]), chunk(vec![1, 2, 7])], Some(3), 2)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[1].len(), 1);
        let first = out[0]
            .batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(first.values(), &[1, 2]);
    }
}
