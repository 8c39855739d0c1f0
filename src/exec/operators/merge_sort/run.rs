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
//! Sorted-run sources for the final merge.
//!
//! A run is a globally sorted sequence of chunks, held either in memory or
//! in a spilled file. `RunCursor` presents both uniformly as a stream of
//! single rows with a peekable sort key, which is all the k-way merge needs.

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::row::{OwnedRow, Rows};

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;
use crate::exec::sort_key::SortKeyCodec;
use crate::exec::spill::{RunFileReader, SpillFile};

#[derive(Debug)]
pub(crate) enum SortedRun {
    Memory(Vec<Chunk>),
    Spilled(SpillFile),
}

#[derive(Debug)]
enum ChunkFeed {
    Memory(std::vec::IntoIter<Chunk>),
    Spilled {
        reader: RunFileReader,
        // Keeps the on-disk file alive until the cursor is dropped.
        _file: SpillFile,
    },
}

impl ChunkFeed {
    fn next(&mut self) -> Result<Option<Chunk>, SortError> {
        match self {
            ChunkFeed::Memory(iter) => Ok(iter.next()),
            ChunkFeed::Spilled { reader, .. } => reader.next_chunk(),
        }
    }
}

#[derive(Debug)]
struct CurrentChunk {
    chunk: Chunk,
    keys: Rows,
    pos: usize,
}

#[derive(Debug)]
pub(crate) struct RunCursor {
    feed: ChunkFeed,
    current: Option<CurrentChunk>,
}

impl RunCursor {
    pub(crate) fn open(
        run: SortedRun,
        schema: &SchemaRef,
        codec: &SortKeyCodec,
    ) -> Result<Self, SortError> {
        let feed = match run {
            SortedRun::Memory(chunks) => ChunkFeed::Memory(chunks.into_iter()),
            SortedRun::Spilled(file) => {
                let reader = RunFileReader::open(file.path(), schema.clone())?;
                ChunkFeed::Spilled {
                    reader,
                    _file: file,
                }
            }
        };
        let mut cursor = Self {
            feed,
            current: None,
        };
        cursor.advance_chunk(codec)?;
        Ok(cursor)
    }

    /// Sort key of the row the cursor is positioned on, or `None` when the
    /// run is exhausted.
    pub(crate) fn peek_key(&self) -> Option<OwnedRow> {
        self.current
            .as_ref()
            .map(|cur| cur.keys.row(cur.pos).owned())
    }

    /// Take the current row and step forward, loading the next chunk of the
    /// run when the current one runs out.
    pub(crate) fn pop_row(&mut self, codec: &SortKeyCodec) -> Result<Option<RecordBatch>, SortError> {
        let Some(cur) = self.current.as_mut() else {
            return Ok(None);
        };
        let row = cur.chunk.batch.slice(cur.pos, 1);
        cur.pos += 1;
        if cur.pos >= cur.chunk.len() {
            self.advance_chunk(codec)?;
        }
        Ok(Some(row))
    }

    fn advance_chunk(&mut self, codec: &SortKeyCodec) -> Result<(), SortError> {
        loop {
            let Some(chunk) = self.feed.next()? else {
                self.current = None;
                return Ok(());
            };
            if chunk.is_empty() {
                continue;
            }
            let keys = codec.encode_keys(&chunk)?;
            self.current = Some(CurrentChunk {
                chunk,
                keys,
                pos: 0,
            });
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::sort_key::SortColumnDesc;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn chunk_of(schema: &SchemaRef, values: Vec<i32>) -> Chunk {
        Chunk::new(
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int32Array::from(values))])
                .unwrap(),
        )
    }

    #[test]
    fn cursor_streams_rows_across_chunk_boundaries() {
        let schema: SchemaRef =
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let codec = SortKeyCodec::try_new(&schema, &[SortColumnDesc::ascending("v")]).unwrap();
        let run = SortedRun::Memory(vec![
            chunk_of(&schema, vec![1, 3]),
            chunk_of(&schema, vec![]),
            chunk_of(&schema, vec![5]),
        ]);
        let mut cursor = RunCursor::open(run, &schema, &codec).unwrap();

        let mut seen = Vec::new();
        while cursor.peek_key().is_some() {
            let row = cursor.pop_row(&codec).unwrap().unwrap();
            let col = row
                .column(0)
                .as_any()
                .downcast_ref::<Int32Array>()
                .unwrap();
            seen.push(col.value(0));
        }
        assert_eq!(seen, vec![1, 3, 5]);
        assert!(cursor.pop_row(&codec).unwrap().is_none());
    }

    #[test]
    fn peeked_keys_are_non_decreasing_within_a_run() {
        let schema: SchemaRef =
            Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let codec = SortKeyCodec::try_new(&schema, &[SortColumnDesc::ascending("v")]).unwrap();
        let run = SortedRun::Memory(vec![chunk_of(&schema, vec![2, 4, 4, 9])]);
        let mut cursor = RunCursor::open(run, &schema, &codec).unwrap();

        let mut prev = None;
        while let Some(key) = cursor.peek_key() {
            if let Some(prev) = &prev {
                assert!(*prev <= key);
            }
            prev = Some(key);
            cursor.pop_row(&codec).unwrap();
        }
    }
}
