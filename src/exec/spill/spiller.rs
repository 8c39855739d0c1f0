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
//! Spilled-run creation and lifecycle.
//!
//! Responsibilities:
//! - Round-robin run files over the configured local directories.
//! - Enforce the free-disk-space precondition before each spill.
//! - Tie temporary-file cleanup to `SpillFile` ownership, so runs are
//!   reclaimed on every exit path, including cancellation and errors.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arrow::datatypes::SchemaRef;

use crate::exec::chunk::Chunk;
use crate::exec::error::SortError;
use crate::exec::spill::run_file::{RunCodec, RunFileReader, RunFileWriter};
use crate::riffle_logging::warn;

#[derive(Debug, Clone)]
pub struct SpillConfig {
    pub local_dirs: Vec<PathBuf>,
    /// Spills fail with `OutOfDiskSpace` when the target filesystem has
    /// less than this many bytes available. 0 disables the check.
    pub min_free_disk_space: u64,
    pub codec: RunCodec,
}

impl SpillConfig {
    pub fn new(local_dirs: Vec<PathBuf>) -> Self {
        Self {
            local_dirs,
            min_free_disk_space: 0,
            codec: RunCodec::default(),
        }
    }
}

/// Handle to one spilled sorted run. Owns the on-disk file; dropping the
/// handle removes it.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    rows: u64,
    bytes: u64,
}

impl SpillFile {
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                "remove spilled run failed: path={} error={}",
                self.path.display(),
                err
            );
        }
    }
}

#[derive(Debug)]
pub struct Spiller {
    dirs: Vec<PathBuf>,
    next_dir: AtomicUsize,
    next_id: AtomicU64,
    min_free_disk_space: u64,
    codec: RunCodec,
    pid: u32,
}

impl Spiller {
    pub fn new(config: SpillConfig) -> Result<Self, SortError> {
        if config.local_dirs.is_empty() {
            return Err(SortError::internal("spill local_dirs is empty"));
        }
        for dir in &config.local_dirs {
            std::fs::create_dir_all(dir).map_err(|e| {
                SortError::internal(format!(
                    "create spill directory {} failed: {e}",
                    dir.display()
                ))
            })?;
        }
        Ok(Self {
            dirs: config.local_dirs,
            next_dir: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            min_free_disk_space: config.min_free_disk_space,
            codec: config.codec,
            pid: std::process::id(),
        })
    }

    /// Write `chunks` (already globally sorted among themselves) as a new
    /// spilled run.
    pub fn spill_run(&self, chunks: &[Chunk]) -> Result<SpillFile, SortError> {
        let Some(first) = chunks.first() else {
            return Err(SortError::internal("cannot spill an empty run"));
        };
        let schema = first.schema();
        let dir = self.pick_dir();
        self.ensure_free_space(&dir)?;

        let (path, file) = self.create_run_file(&dir)?;
        let mut writer = RunFileWriter::create(file, &schema, self.codec)?;
        let mut result = Ok(());
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            result = writer.write_chunk(chunk);
            if result.is_err() {
                break;
            }
        }
        let finished = result.and_then(|_| writer.finish());
        match finished {
            Ok((rows, bytes)) => Ok(SpillFile { path, rows, bytes }),
            Err(err) => {
                // The handle never existed, so clean up the partial file here.
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    warn!(
                        "remove partial spilled run failed: path={} error={}",
                        path.display(),
                        remove_err
                    );
                }
                Err(err)
            }
        }
    }

    pub fn open_run(&self, schema: SchemaRef, file: &SpillFile) -> Result<RunFileReader, SortError> {
        RunFileReader::open(file.path(), schema)
    }

    fn pick_dir(&self) -> PathBuf {
        let idx = self.next_dir.fetch_add(1, Ordering::AcqRel);
        self.dirs[idx % self.dirs.len()].clone()
    }

    fn create_run_file(&self, dir: &Path) -> Result<(PathBuf, std::fs::File), SortError> {
        let mut attempts = 0;
        loop {
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let path = dir.join(format!("sort_run_{:x}_{:x}.run", self.pid, id));
            match OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                }
                Err(err) => {
                    return Err(SortError::internal(format!(
                        "create spill file {} failed: {err}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn ensure_free_space(&self, dir: &Path) -> Result<(), SortError> {
        if self.min_free_disk_space == 0 {
            return Ok(());
        }
        match free_disk_space(dir) {
            Some(available) if available < self.min_free_disk_space => {
                Err(SortError::out_of_disk_space(format!(
                    "free space on {} is {available} bytes, below the configured minimum of {}",
                    dir.display(),
                    self.min_free_disk_space
                )))
            }
            Some(_) => Ok(()),
            None => {
                // The check is advisory; a failed query must not block spilling.
                warn!(
                    "free disk space query failed for {}, proceeding with spill",
                    dir.display()
                );
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn free_disk_space(path: &Path) -> Option<u64> {
    let c_path = CString::new(path.to_str()?).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_disk_space(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    use crate::exec::error::SortErrorKind;

    fn chunk_of(values: Vec<i32>) -> Chunk {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).unwrap();
        Chunk::new(batch)
    }

    fn dir_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn spill_and_restore_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = SpillConfig::new(vec![temp.path().to_path_buf()]);
        config.codec = RunCodec::None;
        let spiller = Spiller::new(config).unwrap();

        let chunks = vec![chunk_of(vec![1, 2, 3]), chunk_of(vec![4, 5])];
        let schema = chunks[0].schema();
        let file = spiller.spill_run(&chunks).unwrap();
        assert_eq!(file.rows(), 5);

        let mut reader = spiller.open_run(schema, &file).unwrap();
        let mut restored = 0;
        while let Some(chunk) = reader.next_chunk().unwrap() {
            restored += chunk.len();
        }
        assert_eq!(restored, 5);
    }

    #[test]
    fn dropping_the_handle_removes_the_file() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = SpillConfig::new(vec![temp.path().to_path_buf()]);
        config.codec = RunCodec::None;
        let spiller = Spiller::new(config).unwrap();

        let file = spiller.spill_run(&[chunk_of(vec![1])]).unwrap();
        assert_eq!(dir_entries(temp.path()), 1);
        drop(file);
        assert_eq!(dir_entries(temp.path()), 0);
    }

    #[test]
    fn insufficient_free_space_fails_without_orphans() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = SpillConfig::new(vec![temp.path().to_path_buf()]);
        config.min_free_disk_space = u64::MAX;
        let spiller = Spiller::new(config).unwrap();

        let err = spiller.spill_run(&[chunk_of(vec![1])]).unwrap_err();
        assert_eq!(err.kind, SortErrorKind::OutOfDiskSpace);
        assert_eq!(dir_entries(temp.path()), 0);
    }
}
