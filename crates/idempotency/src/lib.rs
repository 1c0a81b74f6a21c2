//! Request idempotency and response replay.
//!
//! A client tags a mutating request with an `Idempotency-Key`. The first
//! successful execution records the response; retries carrying the same key
//! and the same request hash get the recorded response back instead of
//! re-executing the operation. A reused key with a different payload, or a
//! different owning tenant, is a conflict.
//!
//! The [`IdempotencyService`] owns the decision logic and delegates storage
//! to a pluggable [`store::IdempotencyStore`]: an in-process map for
//! single-instance deployments and tests, or a database-backed store for
//! horizontally scaled ones.

pub mod config;
pub mod error;
pub mod hash;
pub mod keys;
pub mod record;
pub mod service;
pub mod store;
pub mod wrapper;

pub use config::IdempotencyConfig;
pub use error::{IdempotencyError, StoreError};
pub use record::{IdempotencyRecord, RecordState, RequestContext};
pub use service::{BeginOutcome, CheckResult, IdempotencyService};
pub use store::{ClaimOutcome, IdempotencyStore, StoreStats, memory::MemoryStore};
pub use wrapper::with_idempotency;
