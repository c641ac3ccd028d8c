//! Queued event delivery with type-safe lifecycle management.
//!
//! This crate provides the worker substrate for webhook-style event pipelines:
//! - Accepts events into independently configured queue lanes
//! - Manages the event lifecycle with type-safe state transitions
//! - Reclaims events whose workers disappeared (visibility timeout)
//! - Parks events that exceed their redelivery budget in a dead-letter sink
//! - Abstracts outbound HTTP behind a mockable client trait
//!
//! # Example
//! ```ignore
//! use conveyor::{Event, InMemoryStorage, Queued, WorkerConfig, WorkerPool};
//!
//! let storage = Arc::new(InMemoryStorage::new());
//! let pool = Arc::new(WorkerPool::new(
//!     storage.clone(),
//!     Arc::new(processor),
//!     WorkerConfig::default(),
//! ));
//!
//! // Start the pool
//! let handle = tokio::spawn(pool.run(shutdown_token));
//!
//! // Enqueue events
//! storage.enqueue(Event::queued(data)).await?;
//! ```

pub mod daemon;
pub mod error;
pub mod event;
pub mod http;
pub mod retry;
pub mod storage;

// Re-export commonly used types
pub use daemon::{Outcome, Processor, WorkerConfig, WorkerPool};
pub use error::{ConveyorError, Result};
pub use event::*;
pub use http::{HttpClient, HttpRequest, HttpResponse, MockHttpClient, ReqwestHttpClient};
pub use retry::{default_should_retry, RetryPolicy, ShouldRetryFn};
pub use storage::in_memory::InMemoryStorage;
pub use storage::{LaneDepth, ReapSummary, Storage};
