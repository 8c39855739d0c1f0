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
//! Error taxonomy of the sort core.
//!
//! Every error aborts the whole sort operation; there is no silent
//! degradation to unsorted output and no retry inside the core. The kind is
//! kept machine-readable so callers can distinguish configuration problems
//! (`OutOfDiskSpace`) from data problems (`SchemaMismatch`).

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortErrorKind {
    /// An incoming chunk's schema disagrees with the established one.
    SchemaMismatch,
    /// A single incoming chunk is malformed or oversized.
    CapacityExceeded,
    /// Free disk space below the configured minimum at spill time.
    OutOfDiskSpace,
    /// A spilled run cannot be read back during the external merge.
    StorageReadFailure,
    /// The operation was canceled cooperatively.
    Canceled,
    /// Invariant violation or collaborator failure (arrow, io).
    Internal,
}

#[derive(Debug, Clone)]
pub struct SortError {
    pub kind: SortErrorKind,
    pub message: String,
}

impl SortError {
    pub fn new(kind: SortErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::new(SortErrorKind::SchemaMismatch, message)
    }

    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::new(SortErrorKind::CapacityExceeded, message)
    }

    pub fn out_of_disk_space(message: impl Into<String>) -> Self {
        Self::new(SortErrorKind::OutOfDiskSpace, message)
    }

    pub fn storage_read(message: impl Into<String>) -> Self {
        Self::new(SortErrorKind::StorageReadFailure, message)
    }

    pub fn canceled() -> Self {
        Self::new(SortErrorKind::Canceled, "sort operation canceled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(SortErrorKind::Internal, message)
    }
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SortError {}

impl From<SortError> for String {
    fn from(err: SortError) -> Self {
        err.to_string()
    }
}
