//! # ITC DAQ Library
//!
//! Background sampling of an Oxford Instruments ITC503 temperature controller.
//! A typed client talks to the controller over a command/response link, and a
//! sampling worker polls a list of channels at a fixed interval, pushing
//! timestamped samples into a queue that any number of consumers can drain.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (`config/itc_daq.toml` plus `ITC_DAQ_*`
//!   environment overrides). See `config::ItcDaqConfig`.
//! - **`error`**: The `DaqError` enum shared by every layer.
//! - **`instrument`**: `ItcClient`, channel identifiers, and `SimulatedItc`, an in-memory
//!   controller for tests and dry runs.
//! - **`link`**: The `InstrumentLink` capability and `SerialLink`, its CR-framed
//!   serial/TCP implementation.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`measurement`**: `Sample`, `SampleQueue`, and the `SamplingWorker` lifecycle.
//!
//! ## Example
//!
//! ```no_run
//! use itc_daq::instrument::{ItcClient, SimulatedItc};
//! use itc_daq::measurement::{SamplingOptions, SamplingWorker};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> itc_daq::error::AppResult<()> {
//! let client = Arc::new(ItcClient::new(SimulatedItc::new()));
//! let worker = SamplingWorker::new(
//!     client,
//!     &["TSorp", "THe3", "T1K"],
//!     SamplingOptions::with_interval(Duration::from_millis(400)),
//! )?;
//! let queue = worker.queue();
//!
//! worker.start()?;
//! tokio::time::sleep(Duration::from_secs(2)).await;
//! worker.stop();
//! worker.join().await?;
//!
//! while let Some(sample) = queue.try_pop() {
//!     println!("{}", sample.to_csv_row());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod instrument;
pub mod link;
pub mod logging;
pub mod measurement;
