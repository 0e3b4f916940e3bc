// lib.rs - Delivery consistency engine for a multi-channel inbox

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod delivery_queue;
pub mod engine;
pub mod error;
pub mod event;
pub mod metrics;
pub mod model;
pub mod rate_limit;
pub mod reconciler;
pub mod store;
pub mod sweeper;

pub use cache::{BoundedCache, CacheEntry, CacheStats};
pub use clock::{Clock, ManualClock, SystemClock, UnixTimeMs};
pub use config::{
    CacheConfig, DedupConfig, EngineConfig, KeyScope, QueueConfig, RateLimitConfig,
    ReconcilerConfig,
};
pub use dedup::InboundDeduplicator;
pub use delivery_queue::{DeliveryNotice, DeliveryQueue, QueuedPush};
pub use engine::{DeliveryEngine, IngestOutcome};
pub use error::{DeliveryError, DeliveryResult, ErrorKind};
pub use event::{EventSource, InboundEvent};
pub use metrics::{DeliveryMetrics, MetricsSnapshot};
pub use model::{
    AuthoritativeMessage, ConversationId, FailureReason, LocalId, LocalIdAllocator, MessageId,
    NewMessage, ProvisionalMessage, ProvisionalState, ProvisionalTransition,
};
pub use rate_limit::{Admission, RateLimiter};
pub use reconciler::OptimisticReconciler;
pub use store::{InMemoryMessageStore, MessageStore};
pub use sweeper::SweepHandle;
