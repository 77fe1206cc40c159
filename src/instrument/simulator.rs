//! In-memory ITC503 for tests, demos and the CLI `--simulate` mode.
//!
//! Implements [`InstrumentLink`] by interpreting the same ASCII command set as
//! the real controller, so [`ItcClient`](super::ItcClient) cannot tell the
//! difference. Faults can be injected per exchange for resilience testing.
//!
//! Power-up values match a cold Heliox insert sitting at room temperature on
//! the sorb and 7 K on both pots.

use crate::error::{AppResult, DaqError};
use crate::instrument::channel::Channel;
use crate::link::InstrumentLink;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::trace;

/// Identification string returned for `V`.
pub const SIMULATED_IDENTITY: &str = "ITC503 Version 1.1 (c) OXFORD 1998";

/// Failure scenario applied to upcoming exchanges.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The next `exchanges` exchanges of any kind fail with a communication error.
    CommunicationLoss {
        /// Number of exchanges to fail.
        exchanges: u32,
    },
    /// The next `times` exchanges of exactly `command` fail with a communication error.
    FailCommand {
        /// Command to match, e.g. `"R2"`.
        command: String,
        /// Number of matching exchanges to fail.
        times: u32,
    },
    /// The next `times` exchanges of exactly `command` get an unparseable reply.
    GarbledReply {
        /// Command to match.
        command: String,
        /// Number of matching exchanges to garble.
        times: u32,
    },
}

impl Fault {
    fn matches(&self, command: &str) -> bool {
        match self {
            Fault::CommunicationLoss { exchanges } => *exchanges > 0,
            Fault::FailCommand { command: c, times } | Fault::GarbledReply { command: c, times } => {
                *times > 0 && c == command
            }
        }
    }

    /// Use up one occurrence; returns whether the fault is exhausted.
    fn consume(&mut self) -> bool {
        let remaining = match self {
            Fault::CommunicationLoss { exchanges } => exchanges,
            Fault::FailCommand { times, .. } | Fault::GarbledReply { times, .. } => times,
        };
        *remaining = remaining.saturating_sub(1);
        *remaining == 0
    }
}

#[derive(Debug)]
struct SimState {
    sensors: [f64; 3],
    setpoint: f64,
    heater_output: f64,
    heater_sensor: u8,
    auto_mode: u8,
    auto_pid: bool,
    control_mode: u8,
    latency: Duration,
    faults: Vec<Fault>,
    exchanges: u64,
    log: Vec<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            sensors: [249.2, 7.0, 7.0],
            setpoint: 0.0,
            heater_output: 0.0,
            heater_sensor: 1,
            auto_mode: 0,
            auto_pid: false,
            control_mode: 3,
            latency: Duration::ZERO,
            faults: Vec::new(),
            exchanges: 0,
            log: Vec::new(),
        }
    }
}

impl SimState {
    fn is_remote(&self) -> bool {
        matches!(self.control_mode, 1 | 3)
    }

    fn auto_heat(&self) -> bool {
        matches!(self.auto_mode, 1 | 3)
    }

    /// Interpret one command. `None` means the controller sends no reply.
    fn respond(&mut self, command: &str) -> Option<String> {
        let rejected = || Some(format!("?{command}"));
        let mut chars = command.chars();
        let letter = chars.next()?;
        let arg = chars.as_str();

        match letter {
            'V' if arg.is_empty() => Some(SIMULATED_IDENTITY.to_string()),
            'Q' => None,
            'R' => {
                let value = match arg {
                    "0" => self.setpoint,
                    "1" => self.sensors[0],
                    "2" => self.sensors[1],
                    "3" => self.sensors[2],
                    "5" => self.heater_output,
                    _ => return rejected(),
                };
                Some(format!("R{value:+}"))
            }
            'X' if arg.is_empty() => Some(format!(
                "X0A{}C{}S00H{}L{}",
                self.auto_mode,
                self.control_mode,
                self.heater_sensor,
                u8::from(self.auto_pid)
            )),
            'C' => match arg.parse::<u8>() {
                Ok(mode @ 0..=3) => {
                    self.control_mode = mode;
                    Some("C".to_string())
                }
                _ => rejected(),
            },
            'T' | 'H' | 'A' | 'L' | 'O' if !self.is_remote() => rejected(),
            'T' => match arg.parse::<f64>() {
                Ok(v) if v.is_finite() && (0.0..=1999.999).contains(&v) => {
                    self.setpoint = v;
                    Some("T".to_string())
                }
                _ => rejected(),
            },
            'H' => match arg.parse::<u8>() {
                Ok(sensor @ 1..=3) => {
                    self.heater_sensor = sensor;
                    Some("H".to_string())
                }
                _ => rejected(),
            },
            'A' => match arg.parse::<u8>() {
                Ok(mode @ 0..=3) => {
                    self.auto_mode = mode;
                    Some("A".to_string())
                }
                _ => rejected(),
            },
            'L' => match arg {
                "0" | "1" => {
                    self.auto_pid = arg == "1";
                    Some("L".to_string())
                }
                _ => rejected(),
            },
            'O' => match arg.parse::<f64>() {
                Ok(v) if v.is_finite() && (0.0..=99.9).contains(&v) => {
                    // Manual output is acknowledged but has no effect under auto heat
                    if !self.auto_heat() {
                        self.heater_output = v;
                    }
                    Some("O".to_string())
                }
                _ => rejected(),
            },
            _ => rejected(),
        }
    }

    /// Record the exchange and apply the first matching fault, if any.
    fn take_fault(&mut self, command: &str) -> Option<Fault> {
        self.exchanges += 1;
        self.log.push(command.to_string());

        let index = self.faults.iter().position(|f| f.matches(command))?;
        let fault = self.faults[index].clone();
        if self.faults[index].consume() {
            self.faults.remove(index);
        }
        Some(fault)
    }
}

/// Simulated ITC503 controller.
#[derive(Debug)]
pub struct SimulatedItc {
    name: String,
    state: Mutex<SimState>,
}

impl Default for SimulatedItc {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedItc {
    /// A controller in remote & unlocked mode with power-up values.
    pub fn new() -> Self {
        Self {
            name: "simulated-itc503".to_string(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Start in local & locked mode (the real power-up state); setters are refused
    /// until `C3` is sent.
    pub fn local(self) -> Self {
        self.state.lock().control_mode = 0;
        self
    }

    /// Delay every exchange by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Change what a sensor reports.
    pub fn set_temperature(&self, channel: Channel, kelvin: f64) {
        if let Some(number) = channel.sensor_number() {
            self.state.lock().sensors[usize::from(number - 1)] = kelvin;
        }
    }

    /// Queue a fault for upcoming exchanges.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Drop all pending faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Number of exchanges (queries and writes) seen so far.
    pub fn exchanges(&self) -> u64 {
        self.state.lock().exchanges
    }

    /// Every command received, in order.
    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    async fn exchange(&self, command: &str) -> AppResult<Option<String>> {
        let (latency, fault) = {
            let mut state = self.state.lock();
            (state.latency, state.take_fault(command))
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match fault {
            Some(Fault::CommunicationLoss { .. }) | Some(Fault::FailCommand { .. }) => {
                Err(DaqError::communication(
                    &self.name,
                    format!("injected communication failure on '{command}'"),
                ))
            }
            Some(Fault::GarbledReply { .. }) => Ok(Some("R#~*".to_string())),
            None => {
                let reply = self.state.lock().respond(command);
                trace!(command, reply = ?reply, "Simulated exchange");
                Ok(reply)
            }
        }
    }
}

#[async_trait]
impl InstrumentLink for SimulatedItc {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        self.exchange(command).await?.ok_or_else(|| {
            DaqError::communication(&self.name, format!("no reply to '{command}' (read timeout)"))
        })
    }

    async fn write(&self, command: &str) -> AppResult<()> {
        self.exchange(command).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_power_up_values() {
        let sim = SimulatedItc::new();
        assert_eq!(sim.query("V").await.unwrap(), SIMULATED_IDENTITY);
        assert_eq!(sim.query("R1").await.unwrap(), "R+249.2");
        assert_eq!(sim.query("R2").await.unwrap(), "R+7");
        assert_eq!(sim.query("X").await.unwrap(), "X0A0C3S00H1L0");
    }

    #[tokio::test]
    async fn test_local_mode_refuses_settings() {
        let sim = SimulatedItc::new().local();
        assert_eq!(sim.query("T30").await.unwrap(), "?T30");
        assert_eq!(sim.query("C3").await.unwrap(), "C");
        assert_eq!(sim.query("T30").await.unwrap(), "T");
        assert_eq!(sim.query("R0").await.unwrap(), "R+30");
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let sim = SimulatedItc::new();
        assert_eq!(sim.query("H7").await.unwrap(), "?H7");
        assert_eq!(sim.query("O150").await.unwrap(), "?O150");
        assert_eq!(sim.query("R9").await.unwrap(), "?R9");
        assert_eq!(sim.query("Z").await.unwrap(), "?Z");
    }

    #[tokio::test]
    async fn test_manual_output_ignored_under_auto_heat() {
        let sim = SimulatedItc::new();
        sim.query("A1").await.unwrap();
        assert_eq!(sim.query("O20").await.unwrap(), "O");
        assert_eq!(sim.query("R5").await.unwrap(), "R+0");
        sim.query("A0").await.unwrap();
        sim.query("O20").await.unwrap();
        assert_eq!(sim.query("R5").await.unwrap(), "R+20");
    }

    #[tokio::test]
    async fn test_q_command_has_no_reply() {
        let sim = SimulatedItc::new();
        sim.write("Q0").await.unwrap();
        assert!(matches!(sim.query("Q0").await, Err(DaqError::Communication { .. })));
        assert_eq!(sim.command_log(), vec!["Q0", "Q0"]);
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed() {
        let sim = SimulatedItc::new();
        sim.inject(Fault::FailCommand {
            command: "R2".into(),
            times: 2,
        });
        sim.inject(Fault::GarbledReply {
            command: "R3".into(),
            times: 1,
        });

        assert!(sim.query("R1").await.is_ok());
        assert!(sim.query("R2").await.is_err());
        assert!(sim.query("R2").await.is_err());
        assert_eq!(sim.query("R2").await.unwrap(), "R+7");
        assert_eq!(sim.query("R3").await.unwrap(), "R#~*");
        assert_eq!(sim.query("R3").await.unwrap(), "R+7");
        assert_eq!(sim.exchanges(), 6);
    }

    #[tokio::test]
    async fn test_communication_loss_hits_every_command() {
        let sim = SimulatedItc::new();
        sim.inject(Fault::CommunicationLoss { exchanges: 2 });
        assert!(sim.query("V").await.is_err());
        assert!(sim.write("Q0").await.is_err());
        assert!(sim.query("V").await.is_ok());
    }
}
