//  Copyright 2025 JCacheX Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Core in-memory cache engine: striped concurrent storage, pluggable
//! eviction with W-TinyLFU admission, expiration and refresh, an
//! asynchronous maintenance pipeline, and a statistics surface.

mod buffer;
pub mod cache;
pub mod changes;
pub mod config;
mod entry;
pub mod error;
pub mod eviction;
mod expiry;
pub mod listener;
pub mod metrics;
mod pool;
mod scheduler;
pub mod sketch;
mod store;

pub mod prelude;
pub use prelude::*;
