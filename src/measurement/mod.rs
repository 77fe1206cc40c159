//! Periodic sampling of controller channels into an in-memory queue.
//!
//! - [`sample`]: the [`Sample`] record produced once per tick
//! - [`queue`]: [`SampleQueue`], the FIFO consumers read from
//! - [`worker`]: [`SamplingWorker`], the background loop and its lifecycle

pub mod queue;
pub mod sample;
pub mod worker;

pub use queue::SampleQueue;
pub use sample::Sample;
pub use worker::{
    SamplingOptions, SamplingWorker, TickFailure, WorkerState, WorkerStats, DEFAULT_INTERVAL,
};
