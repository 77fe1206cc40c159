//! ITC503 temperature controller access.
//!
//! - [`channel`]: channel identifiers and labelled values
//! - [`itc503`]: [`ItcClient`], the typed request/response client
//! - [`simulator`]: [`SimulatedItc`], an in-memory controller implementing the link

pub mod channel;
pub mod itc503;
pub mod simulator;

pub use channel::{Channel, Control, ControlStatus, Reading, Switch};
pub use itc503::{
    CommandedState, ControlMode, ControllerStatus, ItcClient, TemperatureSnapshot,
    MAX_HEATER_OUTPUT, MAX_SETPOINT_K,
};
pub use simulator::{Fault, SimulatedItc, SIMULATED_IDENTITY};
