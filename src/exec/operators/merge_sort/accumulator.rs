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
//! Buffered-chunk bookkeeping for the merge-sort operator.
//!
//! Chunks arrive individually sorted; no cross-chunk ordering is imposed
//! here. The accumulator pins the schema from the first chunk, validates
//! later arrivals against it, and keeps the running row/byte totals the
//! threshold checks are driven by.

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;

#[derive(Debug)]
pub(crate) struct ChunkAccumulator {
    /// Reject a single chunk above this many bytes. 0 disables the check.
    max_chunk_bytes: usize,
    schema: Option<SchemaRef>,
    chunks: Vec<Chunk>,
    sum_rows: usize,
    sum_bytes: usize,
}

impl ChunkAccumulator {
    pub(crate) fn new(max_chunk_bytes: usize) -> Self {
        Self {
            max_chunk_bytes,
            schema: None,
            chunks: Vec::new(),
            sum_rows: 0,
            sum_bytes: 0,
        }
    }

    /// Append one sorted chunk. On error the accumulated state is untouched.
    pub(crate) fn accept(&mut self, chunk: Chunk) -> Result<(), SortError> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.max_chunk_bytes > 0 && chunk.estimated_bytes() > self.max_chunk_bytes {
            return Err(SortError::capacity_exceeded(format!(
                "chunk of {} bytes exceeds the configured maximum of {} bytes",
                chunk.estimated_bytes(),
                self.max_chunk_bytes
            )));
        }
        match &self.schema {
            None => self.schema = Some(chunk.schema()),
            Some(schema) => {
                if schema.as_ref() != chunk.schema().as_ref() {
                    return Err(SortError::schema_mismatch(format!(
                        "chunk schema [{}] disagrees with the established schema [{}]",
                        field_names(&chunk.schema()),
                        field_names(schema)
                    )));
                }
            }
        }
        self.sum_rows += chunk.len();
        self.sum_bytes += chunk.estimated_bytes();
        self.chunks.push(chunk);
        Ok(())
    }

    pub(crate) fn schema(&self) -> Option<&SchemaRef> {
        self.schema.as_ref()
    }

    pub(crate) fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub(crate) fn sum_rows(&self) -> usize {
        self.sum_rows
    }

    pub(crate) fn sum_bytes(&self) -> usize {
        self.sum_bytes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Swap the buffered chunks for a compacted replacement (remerge).
    pub(crate) fn replace_chunks(&mut self, chunks: Vec<Chunk>) {
        self.chunks = chunks;
        self.recompute_totals();
    }

    /// Drop all buffered chunks, keeping the pinned schema (spill reset).
    pub(crate) fn reset(&mut self) {
        self.chunks.clear();
        self.sum_rows = 0;
        self.sum_bytes = 0;
    }

    fn recompute_totals(&mut self) {
        self.sum_rows = self.chunks.iter().map(Chunk::len).sum();
        self.sum_bytes = self.chunks.iter().map(Chunk::estimated_bytes).sum();
    }
}

fn field_names(schema: &SchemaRef) -> String {
    schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::error::SortErrorKind;
    use arrow::array::{Int32Array, RecordBatch, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn int_chunk(values: Vec<i32>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap();
        Chunk::new(batch)
    }

    fn string_chunk(values: Vec<&str>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(values))]).unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn totals_track_accepted_chunks() {
        let mut acc = ChunkAccumulator::new(0);
        acc.accept(int_chunk(vec![1, 2, 3])).unwrap();
        acc.accept(int_chunk(vec![4])).unwrap();
        assert_eq!(acc.sum_rows(), 4);
        assert!(acc.sum_bytes() > 0);
        assert_eq!(acc.chunks().len(), 2);
    }

    #[test]
    fn schema_is_pinned_by_first_chunk() {
        let mut acc = ChunkAccumulator::new(0);
        acc.accept(int_chunk(vec![1])).unwrap();
        let err = acc.accept(string_chunk(vec!["a"])).unwrap_err();
        assert_eq!(err.kind, SortErrorKind::SchemaMismatch);
        // The failed chunk must not have altered accumulated state.
        assert_eq!(acc.sum_rows(), 1);
        assert_eq!(acc.chunks().len(), 1);
    }

    #[test]
    fn oversized_chunk_is_capacity_exceeded() {
        let mut acc = ChunkAccumulator::new(1);
        let err = acc.accept(int_chunk(vec![1, 2, 3])).unwrap_err();
        assert_eq!(err.kind, SortErrorKind::CapacityExceeded);
        assert!(acc.is_empty());
    }

    #[test]
    fn reset_keeps_the_pinned_schema() {
        let mut acc = ChunkAccumulator::new(0);
        acc.accept(int_chunk(vec![1])).unwrap();
        acc.reset();
        assert!(acc.is_empty());
        assert_eq!(acc.sum_bytes(), 0);
        assert!(acc.schema().is_some());
        let err = acc.accept(string_chunk(vec!["a"])).unwrap_err();
        assert_eq!(err.kind, SortErrorKind::SchemaMismatch);
    }
}
