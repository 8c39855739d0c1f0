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
//! On-disk format for one spilled sorted run.
//!
//! Layout: a fixed little-endian header, then one frame per chunk. Each
//! frame is `[message_len u32][num_rows u32][arrow ipc message bytes]`.
//! The header is rewritten on finish with the final chunk and row counts.
//! Runs are consumed sequentially by the external merge, so frames carry
//! inline length prefixes instead of a trailing index.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use arrow::array::RecordBatch;
use arrow::buffer::Buffer;
use arrow::datatypes::{DataType, Schema, SchemaRef};
use arrow::ipc::reader::FileDecoder;
use arrow::ipc::writer::{
    CompressionContext, DictionaryTracker, IpcDataGenerator, IpcWriteOptions, write_message,
};
use arrow::ipc::{Block, CompressionType, MetadataVersion};

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;

const RUN_MAGIC: [u8; 4] = *b"RRUN";
const RUN_VERSION: u16 = 1;
const RUN_HEADER_LEN: u16 = 32;
const FRAME_PREFIX_LEN: usize = 8;
const IPC_ALIGNMENT: usize = 64;
const CONTINUATION_MARKER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunCodec {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl RunCodec {
    fn as_u8(self) -> u8 {
        match self {
            RunCodec::None => 0,
            RunCodec::Lz4 => 1,
            RunCodec::Zstd => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self, SortError> {
        match value {
            0 => Ok(RunCodec::None),
            1 => Ok(RunCodec::Lz4),
            2 => Ok(RunCodec::Zstd),
            _ => Err(SortError::storage_read(format!(
                "unknown run codec value: {value}"
            ))),
        }
    }

    fn write_options(self) -> Result<IpcWriteOptions, SortError> {
        let options = IpcWriteOptions::try_new(IPC_ALIGNMENT, false, MetadataVersion::V5)
            .map_err(|e| SortError::internal(format!("build ipc write options failed: {e}")))?;
        let compression = match self {
            RunCodec::None => return Ok(options),
            RunCodec::Lz4 => CompressionType::LZ4_FRAME,
            RunCodec::Zstd => CompressionType::ZSTD,
        };
        options
            .try_with_compression(Some(compression))
            .map_err(|e| SortError::internal(format!("ipc compression unavailable: {e}")))
    }
}

struct RunHeader {
    codec: RunCodec,
    num_chunks: u32,
    total_rows: u64,
    schema_hash: u64,
}

impl RunHeader {
    fn to_bytes(&self) -> [u8; RUN_HEADER_LEN as usize] {
        let mut buf = [0u8; RUN_HEADER_LEN as usize];
        buf[..4].copy_from_slice(&RUN_MAGIC);
        buf[4..6].copy_from_slice(&RUN_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&RUN_HEADER_LEN.to_le_bytes());
        buf[8] = self.codec.as_u8();
        // bytes 9..12 reserved, must stay zero
        buf[12..16].copy_from_slice(&self.num_chunks.to_le_bytes());
        buf[16..24].copy_from_slice(&self.total_rows.to_le_bytes());
        buf[24..32].copy_from_slice(&self.schema_hash.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Result<Self, SortError> {
        if buf.len() < RUN_HEADER_LEN as usize {
            return Err(SortError::storage_read("run header is too small"));
        }
        if buf[..4] != RUN_MAGIC {
            return Err(SortError::storage_read("run header magic mismatch"));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().expect("header slice"));
        if version != RUN_VERSION {
            return Err(SortError::storage_read(format!(
                "unsupported run version: {version}"
            )));
        }
        let header_len = u16::from_le_bytes(buf[6..8].try_into().expect("header slice"));
        if header_len != RUN_HEADER_LEN {
            return Err(SortError::storage_read(format!(
                "unsupported run header length: {header_len}"
            )));
        }
        if buf[9..12] != [0, 0, 0] {
            return Err(SortError::storage_read("run header reserved bytes not zero"));
        }
        Ok(Self {
            codec: RunCodec::from_u8(buf[8])?,
            num_chunks: u32::from_le_bytes(buf[12..16].try_into().expect("header slice")),
            total_rows: u64::from_le_bytes(buf[16..24].try_into().expect("header slice")),
            schema_hash: u64::from_le_bytes(buf[24..32].try_into().expect("header slice")),
        })
    }
}

pub(crate) struct RunFileWriter {
    file: File,
    write_options: IpcWriteOptions,
    header: RunHeader,
    bytes_written: u64,
}

impl RunFileWriter {
    pub(crate) fn create(
        file: File,
        schema: &SchemaRef,
        codec: RunCodec,
    ) -> Result<Self, SortError> {
        if has_dictionary(schema.as_ref()) {
            return Err(SortError::internal(
                "dictionary-encoded columns are not supported in spilled runs",
            ));
        }
        let write_options = codec.write_options()?;
        let header = RunHeader {
            codec,
            num_chunks: 0,
            total_rows: 0,
            schema_hash: schema_hash(schema.as_ref()),
        };
        let mut writer = Self {
            file,
            write_options,
            header,
            bytes_written: RUN_HEADER_LEN as u64,
        };
        writer
            .file
            .write_all(&writer.header.to_bytes())
            .map_err(|e| SortError::internal(format!("write run header failed: {e}")))?;
        Ok(writer)
    }

    pub(crate) fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), SortError> {
        let message = encode_ipc_message(&chunk.batch, &self.write_options)?;
        let message_len = u32::try_from(message.len())
            .map_err(|_| SortError::internal("run frame exceeds u32 length"))?;
        let num_rows = u32::try_from(chunk.len())
            .map_err(|_| SortError::internal("run chunk row count overflows u32"))?;
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        prefix[..4].copy_from_slice(&message_len.to_le_bytes());
        prefix[4..8].copy_from_slice(&num_rows.to_le_bytes());
        self.file
            .write_all(&prefix)
            .and_then(|_| self.file.write_all(&message))
            .map_err(|e| SortError::internal(format!("write run frame failed: {e}")))?;
        self.header.num_chunks += 1;
        self.header.total_rows += num_rows as u64;
        self.bytes_written += (FRAME_PREFIX_LEN + message.len()) as u64;
        Ok(())
    }

    /// Rewrite the header with final counts and flush. Returns (rows, bytes).
    pub(crate) fn finish(mut self) -> Result<(u64, u64), SortError> {
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| SortError::internal(format!("seek run header failed: {e}")))?;
        self.file
            .write_all(&self.header.to_bytes())
            .map_err(|e| SortError::internal(format!("rewrite run header failed: {e}")))?;
        self.file
            .flush()
            .map_err(|e| SortError::internal(format!("flush run file failed: {e}")))?;
        Ok((self.header.total_rows, self.bytes_written))
    }
}

/// Sequential reader over a spilled run.
#[derive(Debug)]
pub struct RunFileReader {
    file: File,
    schema: SchemaRef,
    remaining_chunks: u32,
}

impl RunFileReader {
    pub(crate) fn open(path: impl AsRef<Path>, schema: SchemaRef) -> Result<Self, SortError> {
        let mut file = File::open(path.as_ref()).map_err(|e| {
            SortError::storage_read(format!(
                "open spilled run {} failed: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut buf = [0u8; RUN_HEADER_LEN as usize];
        file.read_exact(&mut buf)
            .map_err(|e| SortError::storage_read(format!("read run header failed: {e}")))?;
        let header = RunHeader::from_bytes(&buf)?;
        if header.schema_hash != schema_hash(schema.as_ref()) {
            return Err(SortError::storage_read("run schema hash mismatch"));
        }
        Ok(Self {
            file,
            schema,
            remaining_chunks: header.num_chunks,
        })
    }

    pub(crate) fn next_chunk(&mut self) -> Result<Option<Chunk>, SortError> {
        if self.remaining_chunks == 0 {
            return Ok(None);
        }
        self.remaining_chunks -= 1;

        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        self.file
            .read_exact(&mut prefix)
            .map_err(|e| SortError::storage_read(format!("read run frame prefix failed: {e}")))?;
        let message_len = u32::from_le_bytes(prefix[..4].try_into().expect("prefix slice"));
        let num_rows = u32::from_le_bytes(prefix[4..8].try_into().expect("prefix slice"));

        let mut message = vec![0u8; message_len as usize];
        self.file
            .read_exact(&mut message)
            .map_err(|e| SortError::storage_read(format!("read run frame failed: {e}")))?;
        let batch = decode_ipc_message(self.schema.clone(), &message)?;
        if batch.num_rows() as u32 != num_rows {
            return Err(SortError::storage_read(format!(
                "run frame row count mismatch: header {num_rows}, decoded {}",
                batch.num_rows()
            )));
        }
        Ok(Some(Chunk::new(batch)))
    }
}

fn encode_ipc_message(
    batch: &RecordBatch,
    options: &IpcWriteOptions,
) -> Result<Vec<u8>, SortError> {
    let data_gen = IpcDataGenerator::default();
    let mut dictionary_tracker = DictionaryTracker::new(false);
    let mut compression_context = CompressionContext::default();
    let (encoded_dictionaries, encoded_message) = data_gen
        .encode(
            batch,
            &mut dictionary_tracker,
            options,
            &mut compression_context,
        )
        .map_err(|e| SortError::internal(format!("arrow ipc encode failed: {e}")))?;
    if !encoded_dictionaries.is_empty() {
        return Err(SortError::internal(
            "dictionary batch messages are not supported in spilled runs",
        ));
    }
    let mut buffer = Vec::new();
    write_message(&mut buffer, encoded_message, options)
        .map_err(|e| SortError::internal(format!("arrow ipc write failed: {e}")))?;
    Ok(buffer)
}

fn decode_ipc_message(schema: SchemaRef, message: &[u8]) -> Result<RecordBatch, SortError> {
    let metadata_len = ipc_metadata_len(message)?;
    if metadata_len > message.len() {
        return Err(SortError::storage_read(
            "ipc metadata length exceeds frame size",
        ));
    }
    let body_len = message.len() - metadata_len;
    let block = Block::new(0, metadata_len as i32, body_len as i64);
    let buffer = Buffer::from(message.to_vec());
    let decoder = FileDecoder::new(schema, MetadataVersion::V5);
    decoder
        .read_record_batch(&block, &buffer)
        .map_err(|e| SortError::storage_read(format!("arrow ipc decode failed: {e}")))?
        .ok_or_else(|| SortError::storage_read("run frame did not contain a record batch"))
}

fn ipc_metadata_len(message: &[u8]) -> Result<usize, SortError> {
    if message.len() < 4 {
        return Err(SortError::storage_read("ipc frame too small for a header"));
    }
    let (prefix_size, meta_len) = if message.len() >= 8 && message[..4] == CONTINUATION_MARKER {
        let len = i32::from_le_bytes(message[4..8].try_into().expect("marker slice"));
        (8usize, len)
    } else {
        let len = i32::from_le_bytes(message[..4].try_into().expect("marker slice"));
        (4usize, len)
    };
    if meta_len < 0 {
        return Err(SortError::storage_read("negative ipc metadata length"));
    }
    let raw = prefix_size
        .checked_add(meta_len as usize)
        .ok_or_else(|| SortError::storage_read("ipc metadata length overflow"))?;
    Ok(align_up(raw, IPC_ALIGNMENT))
}

fn align_up(value: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (value + mask) & !mask
}

pub(crate) fn schema_hash(schema: &Schema) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    for byte in schema.to_string().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn has_dictionary(schema: &Schema) -> bool {
    fn nested(data_type: &DataType) -> bool {
        match data_type {
            DataType::Dictionary(_, _) => true,
            DataType::List(field)
            | DataType::LargeList(field)
            | DataType::FixedSizeList(field, _)
            | DataType::Map(field, _) => nested(field.data_type()),
            DataType::Struct(fields) => fields.iter().any(|f| nested(f.data_type())),
            DataType::Union(fields, _) => fields.iter().any(|(_, f)| nested(f.data_type())),
            DataType::RunEndEncoded(_, values) => nested(values.data_type()),
            _ => false,
        }
    }
    schema.fields().iter().any(|f| nested(f.data_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field};
    use std::sync::Arc;

    fn chunk_of(values: Vec<i64>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap();
        Chunk::new(batch)
    }

    #[test]
    fn roundtrip_preserves_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        let first = chunk_of(vec![1, 2, 3]);
        let second = chunk_of(vec![4, 5]);
        let schema = first.schema();

        let file = File::create_new(&path).unwrap();
        let mut writer = RunFileWriter::create(file, &schema, RunCodec::None).unwrap();
        writer.write_chunk(&first).unwrap();
        writer.write_chunk(&second).unwrap();
        let (rows, bytes) = writer.finish().unwrap();
        assert_eq!(rows, 5);
        assert!(bytes > RUN_HEADER_LEN as u64);

        let mut reader = RunFileReader::open(&path, schema).unwrap();
        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 3);
        assert_eq!(reader.next_chunk().unwrap().unwrap().len(), 2);
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn schema_mismatch_is_a_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        let chunk = chunk_of(vec![1]);

        let file = File::create_new(&path).unwrap();
        let mut writer = RunFileWriter::create(file, &chunk.schema(), RunCodec::None).unwrap();
        writer.write_chunk(&chunk).unwrap();
        writer.finish().unwrap();

        let other = Arc::new(Schema::new(vec![Field::new("x", DataType::Utf8, true)]));
        let err = RunFileReader::open(&path, other).unwrap_err();
        assert_eq!(err.kind, crate::exec::error::SortErrorKind::StorageReadFailure);
    }

    #[test]
    fn truncated_file_is_a_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        let chunk = chunk_of(vec![1, 2]);
        let schema = chunk.schema();

        let file = File::create_new(&path).unwrap();
        let mut writer = RunFileWriter::create(file, &schema, RunCodec::None).unwrap();
        writer.write_chunk(&chunk).unwrap();
        writer.finish().unwrap();

        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 8]).unwrap();

        let mut reader = RunFileReader::open(&path, schema).unwrap();
        let err = reader.next_chunk().unwrap_err();
        assert_eq!(err.kind, crate::exec::error::SortErrorKind::StorageReadFailure);
    }
}
