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
//! K-way merge of sorted runs.
//!
//! One heap entry per non-exhausted run, keyed by the row-format sort key of
//! the run's current row. Popping the minimum, emitting that row, and
//! re-seeding the entry yields globally sorted output; ties break on run
//! index so rows from earlier runs keep their relative order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::row::OwnedRow;

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;
use crate::exec::sort_key::SortKeyCodec;

use super::run::{RunCursor, SortedRun};

#[derive(Debug)]
struct HeapEntry {
    key: OwnedRow,
    run: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .row()
            .cmp(&other.key.row())
            .then_with(|| self.run.cmp(&other.run))
    }
}

#[derive(Debug)]
pub(crate) struct KWayMergeStream {
    codec: SortKeyCodec,
    schema: SchemaRef,
    cursors: Vec<RunCursor>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    chunk_size: usize,
    /// Rows still allowed out; `None` means unbounded.
    remaining: Option<usize>,
    done: bool,
}

impl KWayMergeStream {
    pub(crate) fn new(
        codec: SortKeyCodec,
        schema: SchemaRef,
        runs: Vec<SortedRun>,
        limit: Option<usize>,
        chunk_size: usize,
    ) -> Result<Self, SortError> {
        let mut cursors = Vec::with_capacity(runs.len());
        let mut heap = BinaryHeap::with_capacity(runs.len());
        for run in runs {
            let cursor = RunCursor::open(run, &schema, &codec)?;
            if let Some(key) = cursor.peek_key() {
                heap.push(Reverse(HeapEntry {
                    key,
                    run: cursors.len(),
                }));
            }
            cursors.push(cursor);
        }
        Ok(Self {
            codec,
            schema,
            cursors,
            heap,
            chunk_size: chunk_size.max(1),
            remaining: limit,
            done: false,
        })
    }

    /// Next chunk of globally sorted output, or `None` when the merge is
    /// complete or the row limit has been reached.
    pub(crate) fn next_chunk(&mut self) -> Result<Option<Chunk>, SortError> {
        if self.done {
            return Ok(None);
        }
        let budget = match self.remaining {
            Some(0) => {
                self.done = true;
                return Ok(None);
            }
            Some(remaining) => remaining.min(self.chunk_size),
            None => self.chunk_size,
        };

        let mut rows: Vec<RecordBatch> = Vec::with_capacity(budget);
        while rows.len() < budget {
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let cursor = &mut self.cursors[entry.run];
            let Some(row) = cursor.pop_row(&self.codec)? else {
                return Err(SortError::internal(
                    "merge heap referenced an exhausted run",
                ));
            };
            rows.push(row);
            if let Some(key) = cursor.peek_key() {
                self.heap.push(Reverse(HeapEntry {
                    key,
                    run: entry.run,
                }));
            }
        }

        if rows.is_empty() {
            self.done = true;
            return Ok(None);
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= rows.len();
        }
        let batch = concat_batches(&self.schema, &rows)
            .map_err(|e| SortError::internal(format!("assemble merged chunk failed: {e}")))?;
        Ok(Some(Chunk::new(batch)))
    }
}
