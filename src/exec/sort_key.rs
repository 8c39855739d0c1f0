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
//! Sort-key description and comparison kernels.
//!
//! Responsibilities:
//! - Resolve the configured sort description against a fixed schema.
//! - Provide the two merge primitives every sort stage is built from:
//!   a concat+lexsort single-run merge, and a row-format key codec whose
//!   encoded byte order equals the configured sort order (direction and
//!   null placement folded into the `SortField` options), so one min-heap
//!   serves ascending and descending sorts alike.

use std::sync::Arc;

use arrow::compute::{SortColumn, SortOptions, concat_batches, lexsort_to_indices, take};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField};

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;

/// One entry of a sort description: column name, direction, null placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortColumnDesc {
    pub column: String,
    pub asc: bool,
    pub nulls_first: bool,
}

impl SortColumnDesc {
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            asc: true,
            nulls_first: true,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            asc: false,
            nulls_first: false,
        }
    }

    fn options(&self) -> SortOptions {
        SortOptions {
            descending: !self.asc,
            nulls_first: self.nulls_first,
        }
    }
}

/// Map a sort description to column indices in `schema`.
pub(crate) fn resolve_sort_columns(
    schema: &SchemaRef,
    descs: &[SortColumnDesc],
) -> Result<Vec<usize>, SortError> {
    descs
        .iter()
        .map(|desc| {
            schema.index_of(&desc.column).map_err(|_| {
                SortError::schema_mismatch(format!(
                    "sort column '{}' not found in schema {}",
                    desc.column,
                    schema
                        .fields()
                        .iter()
                        .map(|f| f.name().as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                ))
            })
        })
        .collect()
}

/// Merge any number of chunks into one sorted chunk, truncated to `limit`.
///
/// Inputs need not be sorted; this is the full-materialization primitive
/// behind remerge, spill serialization, and the no-spill finale.
pub(crate) fn sort_chunks(
    descs: &[SortColumnDesc],
    chunks: &[Chunk],
    limit: Option<usize>,
) -> Result<Option<Chunk>, SortError> {
    if chunks.is_empty() {
        return Ok(None);
    }
    let schema = chunks[0].schema();
    let batches: Vec<_> = chunks.iter().map(|c| c.batch.clone()).collect();
    let batch = concat_batches(&schema, &batches)
        .map_err(|e| SortError::internal(format!("concat chunks failed: {e}")))?;
    if batch.num_rows() == 0 {
        return Ok(None);
    }
    if descs.is_empty() {
        let keep = limit.unwrap_or(batch.num_rows()).min(batch.num_rows());
        return Ok(Some(Chunk::new(batch.slice(0, keep))));
    }

    let indices = resolve_sort_columns(&schema, descs)?;
    let sort_columns = indices
        .iter()
        .zip(descs.iter())
        .map(|(idx, desc)| SortColumn {
            values: batch.column(*idx).clone(),
            options: Some(desc.options()),
        })
        .collect::<Vec<_>>();
    let order = lexsort_to_indices(&sort_columns, limit)
        .map_err(|e| SortError::internal(format!("lexsort failed: {e}")))?;
    let columns = batch
        .columns()
        .iter()
        .map(|col| take(col.as_ref(), &order, None))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SortError::internal(format!("take failed: {e}")))?;
    let sorted = RecordBatch::try_new(batch.schema(), columns)
        .map_err(|e| SortError::internal(format!("rebuild sorted batch failed: {e}")))?;
    Ok(Some(Chunk::new(sorted)))
}

/// Split one chunk into slices of at most `chunk_size` rows.
pub(crate) fn rechunk(chunk: Chunk, chunk_size: usize) -> Vec<Chunk> {
    if chunk.is_empty() {
        return Vec::new();
    }
    if chunk_size == 0 || chunk.len() <= chunk_size {
        return vec![chunk];
    }
    let mut out = Vec::with_capacity(chunk.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < chunk.len() {
        let len = chunk_size.min(chunk.len() - offset);
        out.push(chunk.slice(offset, len));
        offset += len;
    }
    out
}

/// Row-format encoder for sort keys of a fixed schema.
///
/// Encoded rows compare bytewise in configured sort order.
#[derive(Debug)]
pub(crate) struct SortKeyCodec {
    key_indices: Vec<usize>,
    converter: RowConverter,
}

impl SortKeyCodec {
    pub(crate) fn try_new(
        schema: &SchemaRef,
        descs: &[SortColumnDesc],
    ) -> Result<Self, SortError> {
        if descs.is_empty() {
            return Err(SortError::internal("sort description is empty"));
        }
        let key_indices = resolve_sort_columns(schema, descs)?;
        let fields = key_indices
            .iter()
            .zip(descs.iter())
            .map(|(idx, desc)| {
                SortField::new_with_options(
                    schema.field(*idx).data_type().clone(),
                    desc.options(),
                )
            })
            .collect::<Vec<_>>();
        let converter = RowConverter::new(fields)
            .map_err(|e| SortError::internal(format!("build row converter failed: {e}")))?;
        Ok(Self {
            key_indices,
            converter,
        })
    }

    pub(crate) fn encode_keys(&self, chunk: &Chunk) -> Result<Rows, SortError> {
        let key_columns = self
            .key_indices
            .iter()
            .map(|idx| Arc::clone(chunk.batch.column(*idx)))
            .collect::<Vec<_>>();
        self.converter
            .convert_columns(&key_columns)
            .map_err(|e| SortError::internal(format!("encode sort keys failed: {e}")))
    }
}
