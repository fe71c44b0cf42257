#![forbid(unsafe_code)]

//! # delivery-engine
//!
//! A resilient message-delivery engine: idempotent admission, circuit-breaker-guarded
//! transport failover, retry with backoff, token-bucket admission limiting, and a
//! priority/delay job queue with a bounded worker pool.
//!
//! ## Features
//!
//! - **Idempotent admission** — duplicate `requestId`s are deduped, not re-sent
//! - **Transport failover** — ordered transports with per-transport circuit breakers
//! - **Retry with backoff** — configurable exponential backoff, transport-honored `retryAfter`
//! - **Rate limiting** — per-submitter windowed token bucket
//! - **Job queue** — priority- and delay-aware, bounded concurrency, watchdog timeouts
//! - **Lock-free breaker state** using atomics
//!
//! ## Quick Start
//!
//! ```rust
//! use delivery_engine::{DeliveryEngine, EngineConfig, SubmitOutcome, SubmitRequest};
//! use delivery_engine::transport::{ScriptedOutcome, ScriptedTransport, Transport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let primary: Arc<dyn Transport> = Arc::new(ScriptedTransport::new(
//!         "primary",
//!         vec![ScriptedOutcome::Success { message_id: "m-1".into() }],
//!     ));
//!     let engine = DeliveryEngine::new(vec![primary], EngineConfig { enable_queue: false, ..Default::default() });
//!
//!     let outcome = engine
//!         .submit(SubmitRequest::new("user@example.com", "hello", "world", "req-1"))
//!         .await;
//!
//!     match outcome {
//!         SubmitOutcome::Sent { transport, message_id, .. } => {
//!             println!("sent via {transport}: {message_id}");
//!         }
//!         other => println!("unexpected: {other:?}"),
//!     }
//! }
//! ```

mod backoff;
mod circuit_breaker;
mod clock;
mod engine;
mod error;
mod idempotency;
mod queue;
mod rate_limit;
mod sleeper;
mod timeout;
pub mod transport;

pub use backoff::Backoff;
pub use circuit_breaker::{BreakerConfig, BreakerMode, BreakerRegistry, BreakerStatus, CircuitBreaker};
pub use clock::{Clock, MonotonicClock};
pub use engine::{
    DeliveryEngine, EngineConfig, ExternalStatus, StatusResult, SubmitOutcome, SubmitRequest,
};
pub use error::{ErrorInfo, ValidationError, ValidationErrors};
pub use idempotency::{BeginOutcome, IdempotencyConfig, IdempotencyStore, LifecycleRecord, LifecycleStatus, TerminalSuccess};
pub use queue::{Job, JobPayload, JobQueue, JobStatus, QueueConfig, QueueStats};
pub use rate_limit::{BucketStore, Decision, InMemoryBucketStore, RateLimiter, RateLimiterConfig, WindowedTokenBucket};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::{TimeoutElapsed, TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
