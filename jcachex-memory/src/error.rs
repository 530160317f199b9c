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

use std::sync::Arc;

/// Errors surfaced by cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The key was rejected by the configured key validator.
    #[error("invalid key")]
    InvalidKey,
    /// A write required eviction but the policy produced no victim.
    #[error("capacity exceeded and no eviction victim available")]
    CapacityExceeded,
    /// A loader invocation failed.
    #[error("load failed")]
    Load(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// An asynchronous operation missed its deadline.
    #[error("operation timed out")]
    Timeout,
    /// The worker pool rejected an asynchronous submission.
    #[error("worker pool overloaded")]
    Overloaded,
    /// The cache has begun shutting down.
    #[error("cache is shutting down")]
    ShuttingDown,
    /// An internal invariant was violated; the instance should be discarded.
    #[error("cache poisoned: {0}")]
    Poisoned(&'static str),
}

impl Error {
    pub(crate) fn load(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Load(Arc::new(cause))
    }
}

/// Failure description recovered from a panicking loader.
#[derive(Debug, Clone, thiserror::Error)]
#[error("loader panicked: {0}")]
pub struct LoadPanic(pub String);

impl LoadPanic {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_carries_cause() {
        let err = Error::load(LoadPanic("boom".to_string()));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("boom"));
    }

    #[test]
    fn test_panic_payload_messages() {
        let p = LoadPanic::from_payload(Box::new("static"));
        assert_eq!(p.0, "static");
        let p = LoadPanic::from_payload(Box::new("owned".to_string()));
        assert_eq!(p.0, "owned");
        let p = LoadPanic::from_payload(Box::new(42_u32));
        assert_eq!(p.0, "unknown panic");
    }
}
