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
//! Partial-result snapshots of an in-flight sort.
//!
//! The operator publishes its buffered in-memory chunks here after every
//! state change. `snapshot` can then be called from any thread to obtain a
//! sorted view of what has been buffered so far, without stopping the sort.
//! Spilled runs are not part of the view.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;
use crate::exec::sort_key::{SortColumnDesc, sort_chunks};

#[derive(Debug, Clone)]
pub struct SortProgressView {
    shared: Arc<Mutex<Vec<Chunk>>>,
    sort_keys: Arc<Vec<SortColumnDesc>>,
}

impl SortProgressView {
    pub(crate) fn new(sort_keys: Arc<Vec<SortColumnDesc>>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Vec::new())),
            sort_keys,
        }
    }

    pub(crate) fn push(&self, chunk: &Chunk) {
        self.lock().push(chunk.clone());
    }

    pub(crate) fn replace(&self, chunks: &[Chunk]) {
        *self.lock() = chunks.to_vec();
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Sorted view of the currently buffered rows, truncated to `row_limit`
    /// rows (0 means unbounded). The merge stops folding in further chunks
    /// once `time_budget` has elapsed, so the result may cover only a prefix
    /// of the buffered chunks; what it does cover is fully sorted.
    pub fn snapshot(
        &self,
        row_limit: usize,
        time_budget: Duration,
    ) -> Result<Option<Chunk>, SortError> {
        let chunks = self.lock().clone();
        let limit = if row_limit == 0 { None } else { Some(row_limit) };
        let deadline = Instant::now() + time_budget;

        let mut acc: Option<Chunk> = None;
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            acc = match acc {
                None => sort_chunks(&self.sort_keys, &[chunk], limit)?,
                Some(prev) => sort_chunks(&self.sort_keys, &[prev, chunk], limit)?,
            };
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(acc)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Chunk>> {
        self.shared.lock().expect("sort progress lock poisoned")
    }
}
