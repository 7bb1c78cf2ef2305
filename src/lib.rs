//! fetchpool: a priority-scheduled parallel HTTP download engine.
//!
//! # Architecture
//!
//! The crate is organized bottom-up:
//! - [`channel`] - K-level priority MPMC queue with async readers
//! - [`sync`] - pause token, linked cancellation, resizable semaphore
//! - [`scheduler`] - worker pool with throughput-driven parallelism
//! - [`request`] - request lifecycle, status probes, user bodies
//! - [`load`] - chunked, resumable file downloads
//! - [`http`] / [`fsx`] - transport and filesystem boundaries
//!
//! A request enqueues itself at its priority into its scheduler's channel;
//! the scheduler drains the channel under a dynamic parallelism limit and
//! each worker drives the request body to a terminal state, retrying
//! failures within the configured budget.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod error;
pub mod fsx;
pub mod http;
pub mod load;
pub mod request;
pub mod scheduler;
pub mod sync;

// Re-export commonly used types
pub use channel::{ChannelClosed, PriorityChannel};
pub use error::DownloadError;
pub use http::{HttpClient, ResponseSummary, DEFAULT_USER_AGENT};
pub use load::{ByteRange, LoadRequest, LoadRequestOptions, WriteMode};
pub use request::{
    OwnRequest, Priority, Request, RequestOptions, RequestState, StatusRequest,
    DEFAULT_TRY_COUNTER,
};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use sync::{DynamicSemaphore, PauseToken};
