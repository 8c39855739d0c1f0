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
//! External merge sort over individually sorted input chunks.
//!
//! The operator buffers sorted chunks in memory, optionally compacts the
//! buffer when a row limit makes that profitable, spills sorted runs to
//! disk when the buffer outgrows its byte budget, and finally streams a
//! k-way merge of every run as sorted output.

mod accumulator;
mod merge;
mod merge_sort_processor;
mod remerge;
mod run;
mod snapshot;

pub use merge_sort_processor::{MergeSortConfig, MergeSortOperator, MergeSortProcessorFactory};
pub use snapshot::SortProgressView;

pub use crate::exec::error::{SortError, SortErrorKind};
