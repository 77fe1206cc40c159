//! Instrument Link Abstraction
//!
//! The link is the synchronous request/response transport to the physical
//! controller: write one command line, read one reply line. Everything above
//! it (the ITC503 client, the sampling worker) only ever sees this trait, so
//! the same code drives real hardware and the in-memory simulator.
//!
//! # Implementations
//!
//! - [`SerialLink`]: CR-framed exchanges over any async byte stream
//!   (serial port, TCP GPIB bridge, `tokio::io::duplex` in tests)
//! - [`crate::instrument::simulator::SimulatedItc`]: in-memory ITC503
//!
//! # Contract
//!
//! - One exchange at a time. Implementations serialize concurrent callers
//!   internally; the bus itself never sees interleaved transactions.
//! - Timeouts belong to the link. Callers above it impose none.
//! - Transport failures surface as [`DaqError::Communication`](crate::error::DaqError).

pub mod serial;

pub use serial::{SerialLink, SerialPortIO, DEFAULT_TIMEOUT, TERMINATOR};

use crate::config::{LinkConfig, Transport};
use crate::error::{AppResult, DaqError};
use crate::instrument::SimulatedItc;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Capability: request/response access to an instrument.
#[async_trait]
pub trait InstrumentLink: Send + Sync {
    /// Human-readable link name used in logs and errors.
    fn name(&self) -> &str;

    /// Send `command` and return the reply line with the terminator stripped.
    async fn query(&self, command: &str) -> AppResult<String>;

    /// Send `command` without waiting for a reply.
    async fn write(&self, command: &str) -> AppResult<()>;
}

/// Open the link described by `config`.
///
/// The simulated transport yields a fresh [`SimulatedItc`] in remote mode.
pub async fn open(config: &LinkConfig) -> AppResult<Arc<dyn InstrumentLink>> {
    match config.transport {
        Transport::Simulated => {
            info!("Using simulated ITC503");
            Ok(Arc::new(SimulatedItc::new()))
        }
        Transport::Tcp => {
            let address = config.address.as_deref().ok_or_else(|| {
                DaqError::Configuration("link.address is required for the tcp transport".into())
            })?;
            Ok(Arc::new(SerialLink::connect_tcp(address, config.timeout).await?))
        }
        Transport::Serial => open_serial(config).await,
    }
}

#[cfg(feature = "instrument_serial")]
async fn open_serial(config: &LinkConfig) -> AppResult<Arc<dyn InstrumentLink>> {
    let port = config.port.as_deref().ok_or_else(|| {
        DaqError::Configuration("link.port is required for the serial transport".into())
    })?;
    Ok(Arc::new(
        SerialLink::open(port, config.baud_rate, config.timeout).await?,
    ))
}

#[cfg(not(feature = "instrument_serial"))]
async fn open_serial(_config: &LinkConfig) -> AppResult<Arc<dyn InstrumentLink>> {
    Err(DaqError::Configuration(
        "Serial transport requires the 'instrument_serial' feature".into(),
    ))
}
