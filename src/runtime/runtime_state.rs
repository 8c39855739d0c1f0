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
//! Per-operation execution context shared between the host pipeline and
//! riffle operators.
//!
//! Responsibilities:
//! - First-error-wins error state visible to every operator of an operation.
//! - Cooperative cancellation flag observed at every operator step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<String>>,
}

impl RuntimeErrorState {
    pub fn set_error(&self, err: String) {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

/// Execution context for one sort operation.
///
/// Clones share the same error and cancellation state, so the handle can be
/// given both to the ingesting thread and to whoever may cancel the query.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    error_state: Arc<RuntimeErrorState>,
    canceled: Arc<AtomicBool>,
    chunk_size: usize,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl RuntimeState {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            error_state: Arc::new(RuntimeErrorState::default()),
            canceled: Arc::new(AtomicBool::new(false)),
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn set_error(&self, err: String) {
        self.error_state.set_error(err);
    }

    pub fn error(&self) -> Option<String> {
        self.error_state.error()
    }
}
