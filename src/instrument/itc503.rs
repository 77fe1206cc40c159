//! Oxford Instruments ITC503 Temperature Controller Client
//!
//! Reference: ITC503 Operator's Handbook, section 8 (computer interface)
//!
//! Protocol Overview:
//! - Format: single-letter ASCII commands (NOT SCPI)
//! - Terminator: CR (`\r`) after `Q0`
//! - Every command except `Q` is answered; the reply starts with the command
//!   letter, or with `?` when the controller refuses the command
//! - Reads: `R0` setpoint, `R1..R3` sensors, `R5` heater output (%)
//! - Writes: `T` setpoint, `H` heater sensor, `A` auto/manual, `L` auto-PID,
//!   `O` manual heater output, `C` local/remote
//! - Status: `X` returns `XnAnCnSnnHnLn`
//!
//! # Local mirror
//!
//! The client remembers what it last *commanded* ([`CommandedState`]). That
//! mirror is informational only: every getter that has a readback command
//! queries the controller, so front-panel changes or a rejected command can
//! never be masked by stale local state.
//!
//! # Usage
//!
//! ```rust,ignore
//! use itc_daq::instrument::{Channel, ItcClient};
//! use itc_daq::link::SerialLink;
//!
//! let link = SerialLink::open("/dev/ttyUSB0", 9600, Duration::from_secs(1)).await?;
//! let itc = ItcClient::new(link);
//! itc.initialize().await?;
//! itc.set_setpoint(30.0).await?;
//! let tsorp = itc.get_channel(Channel::TSorp).await?;
//! ```

use crate::error::{AppResult, DaqError};
use crate::instrument::channel::{Channel, Control, ControlStatus, Reading, Switch};
use crate::link::InstrumentLink;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Highest setpoint the controller accepts, in kelvin.
pub const MAX_SETPOINT_K: f64 = 1999.999;

/// Highest manual heater output, in percent.
pub const MAX_HEATER_OUTPUT: f64 = 99.9;

/// Front-panel lock / remote control mode (`C` command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlMode {
    /// C0: local and locked (power-up default).
    LocalLocked,
    /// C1: remote and locked.
    RemoteLocked,
    /// C2: local and unlocked.
    LocalUnlocked,
    /// C3: remote and unlocked.
    RemoteUnlocked,
}

impl ControlMode {
    fn code(self) -> u8 {
        match self {
            ControlMode::LocalLocked => 0,
            ControlMode::RemoteLocked => 1,
            ControlMode::LocalUnlocked => 2,
            ControlMode::RemoteUnlocked => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ControlMode::LocalLocked),
            1 => Some(ControlMode::RemoteLocked),
            2 => Some(ControlMode::LocalUnlocked),
            3 => Some(ControlMode::RemoteUnlocked),
            _ => None,
        }
    }
}

/// What this client last told the controller to do.
///
/// Fields are only updated after the controller acknowledged the command.
/// None of them is authoritative; use the matching getter for the device's view.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandedState {
    /// Last heater sensor selected through [`ItcClient::set_heater_sensor_to`].
    pub heater_sensor: Option<Channel>,
    /// Whether a heater sensor has been selected through this client at all.
    pub heater_set: bool,
    /// Last auto-heat command.
    pub auto_heat: Option<bool>,
    /// Last auto-PID command.
    pub auto_pid: Option<bool>,
    /// Last setpoint sent, in kelvin.
    pub setpoint: Option<f64>,
    /// Last manual heater output sent, in percent.
    pub heater_output: Option<f64>,
    /// Last control mode sent.
    pub control_mode: Option<ControlMode>,
}

/// Parsed `X` status reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// System status digit (0 = normal).
    pub system: u32,
    /// Auto/manual digit: 0 heater+gas manual, 1 heater auto, 2 gas auto, 3 both auto.
    pub auto_mode: u32,
    /// Local/remote mode.
    pub control_mode: ControlMode,
    /// Sweep status (0 = not sweeping).
    pub sweep: u32,
    /// Sensor currently driving the heater loop.
    pub heater_sensor: Channel,
    /// Auto-PID state.
    pub auto_pid: Switch,
    /// Raw reply.
    pub raw: String,
}

impl ControllerStatus {
    /// Auto-heat state derived from the auto/manual digit.
    pub fn auto_heat(&self) -> Switch {
        Switch::from(matches!(self.auto_mode, 1 | 3))
    }

    /// Parse an `X` reply such as `X0A1C3S00H1L0`.
    pub fn parse(reply: &str) -> AppResult<Self> {
        let field = |key: char| -> AppResult<u32> {
            status_field(reply, key).ok_or_else(|| {
                DaqError::parse("X", reply, format!("missing or non-numeric '{key}' field"))
            })
        };

        if !reply.starts_with('X') {
            return Err(DaqError::parse("X", reply, "status reply must start with 'X'"));
        }

        let control = field('C')?;
        let control_mode = ControlMode::from_code(control)
            .ok_or_else(|| DaqError::parse("X", reply, format!("invalid control mode C{control}")))?;
        let heater = field('H')?;
        let heater_sensor = u8::try_from(heater)
            .ok()
            .and_then(Channel::from_sensor_number)
            .ok_or_else(|| DaqError::parse("X", reply, format!("invalid heater sensor H{heater}")))?;
        let auto_pid = match field('L')? {
            0 => Switch::Off,
            1 => Switch::On,
            other => {
                return Err(DaqError::parse("X", reply, format!("invalid auto-PID digit L{other}")))
            }
        };

        Ok(Self {
            system: field('X')?,
            auto_mode: field('A')?,
            control_mode,
            sweep: field('S')?,
            heater_sensor,
            auto_pid,
            raw: reply.to_string(),
        })
    }
}

/// Digits following the first occurrence of `key` in a status reply.
fn status_field(reply: &str, key: char) -> Option<u32> {
    let start = reply.find(key)? + key.len_utf8();
    let digits: String = reply[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// The three sensor temperatures taken together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperatureSnapshot {
    /// Wall-clock time captured immediately before the first read.
    pub timestamp: DateTime<Utc>,
    /// Sorption pump.
    pub tsorp: Reading,
    /// He-3 pot.
    pub the3: Reading,
    /// 1 K pot.
    pub t1k: Reading,
}

/// Typed request/response client for one ITC503.
///
/// All methods take `&self`; exchanges are serialized by the link. The client
/// owns its link exclusively and should not be shared by two sampling workers
/// unless the callers serialize access themselves.
pub struct ItcClient {
    link: Arc<dyn InstrumentLink>,
    commanded: Mutex<CommandedState>,
}

impl std::fmt::Debug for ItcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItcClient")
            .field("link", &self.link.name())
            .field("commanded", &*self.commanded.lock())
            .finish()
    }
}

impl ItcClient {
    /// Bind a client to a link.
    pub fn new(link: impl InstrumentLink + 'static) -> Self {
        Self::from_shared(Arc::new(link))
    }

    /// Bind a client to a link that is also held elsewhere (e.g. a simulator under test).
    pub fn from_shared(link: Arc<dyn InstrumentLink>) -> Self {
        Self {
            link,
            commanded: Mutex::new(CommandedState::default()),
        }
    }

    /// Name of the underlying link.
    pub fn link_name(&self) -> &str {
        self.link.name()
    }

    /// Snapshot of the last-commanded mirror.
    pub fn commanded(&self) -> CommandedState {
        self.commanded.lock().clone()
    }

    /// Whether a heater sensor has been selected through this client.
    pub fn heater_set(&self) -> bool {
        self.commanded.lock().heater_set
    }

    /// Put the controller into a known communication state.
    ///
    /// Sends `Q0` (CR-only framing, never answered) and switches to remote & unlocked
    /// so that the setters below are accepted.
    #[instrument(skip(self), fields(link = %self.link.name()), err)]
    pub async fn initialize(&self) -> AppResult<()> {
        self.link.write("Q0").await?;
        self.set_control_mode(ControlMode::RemoteUnlocked).await?;
        info!("ITC503 initialised (remote, unlocked)");
        Ok(())
    }

    /// Query the version string (`V`).
    pub async fn identify(&self) -> AppResult<String> {
        let reply = self.link.query("V").await?;
        check_rejected("V", &reply)?;
        if reply.is_empty() {
            return Err(DaqError::parse("V", reply, "empty identification"));
        }
        Ok(reply)
    }

    /// Switch between local/remote and locked/unlocked front panel.
    pub async fn set_control_mode(&self, mode: ControlMode) -> AppResult<()> {
        self.command(&format!("C{}", mode.code())).await?;
        self.commanded.lock().control_mode = Some(mode);
        Ok(())
    }

    /// Read one channel.
    #[instrument(skip(self), fields(link = %self.link.name()), err)]
    pub async fn get_channel(&self, channel: Channel) -> AppResult<Reading> {
        let command = channel.read_command();
        let reply = self.link.query(command).await?;
        let value = parse_value(command, &reply)?;
        debug!(channel = %channel, value, "Read channel");
        Ok(Reading::new(channel, value))
    }

    /// Read a channel given by name.
    pub async fn get_channel_by_name(&self, name: &str) -> AppResult<Reading> {
        self.get_channel(name.parse()?).await
    }

    /// Read the sorption pump sensor.
    pub async fn get_tsorp(&self) -> AppResult<Reading> {
        self.get_channel(Channel::TSorp).await
    }

    /// Read the He-3 pot sensor.
    pub async fn get_the3(&self) -> AppResult<Reading> {
        self.get_channel(Channel::THe3).await
    }

    /// Read the 1 K pot sensor.
    pub async fn get_t1k(&self) -> AppResult<Reading> {
        self.get_channel(Channel::T1K).await
    }

    /// Read several channels in order, one exchange each.
    ///
    /// Stops at the first failure; no partial result is returned.
    pub async fn read_channels(&self, channels: &[Channel]) -> AppResult<Vec<Reading>> {
        let mut readings = Vec::with_capacity(channels.len());
        for &channel in channels {
            readings.push(self.get_channel(channel).await?);
        }
        Ok(readings)
    }

    /// Set the temperature setpoint in kelvin.
    ///
    /// Not read back; call [`ItcClient::get_setpoint`] for the controller's value.
    #[instrument(skip(self), fields(link = %self.link.name()), err)]
    pub async fn set_setpoint(&self, kelvin: f64) -> AppResult<()> {
        if !kelvin.is_finite() || !(0.0..=MAX_SETPOINT_K).contains(&kelvin) {
            return Err(DaqError::Configuration(format!(
                "Setpoint {kelvin} K out of range (0-{MAX_SETPOINT_K} K)"
            )));
        }
        self.command(&format!("T{kelvin}")).await?;
        self.commanded.lock().setpoint = Some(kelvin);
        info!(setpoint_k = kelvin, "Setpoint changed");
        Ok(())
    }

    /// Read the setpoint back from the controller.
    pub async fn get_setpoint(&self) -> AppResult<Reading> {
        self.get_channel(Channel::Setpoint).await
    }

    /// Select which sensor drives the heater loop.
    #[instrument(skip(self), fields(link = %self.link.name()), err)]
    pub async fn set_heater_sensor_to(&self, channel: Channel) -> AppResult<()> {
        let number = channel.sensor_number().ok_or_else(|| {
            DaqError::Configuration(format!("{channel} is not a sensor and cannot drive the heater"))
        })?;
        self.command(&format!("H{number}")).await?;
        {
            let mut commanded = self.commanded.lock();
            commanded.heater_sensor = Some(channel);
            commanded.heater_set = true;
        }
        info!(sensor = %channel, "Heater sensor selected");
        Ok(())
    }

    /// Sensor currently driving the heater loop, as reported by the controller.
    pub async fn get_heater_sensor(&self) -> AppResult<Channel> {
        Ok(self.get_status().await?.heater_sensor)
    }

    /// Enable automatic heater control (`A1`).
    pub async fn auto_heat_on(&self) -> AppResult<()> {
        self.set_auto_heat(true).await
    }

    /// Disable automatic heater control (`A0`).
    pub async fn auto_heat_off(&self) -> AppResult<()> {
        self.set_auto_heat(false).await
    }

    async fn set_auto_heat(&self, on: bool) -> AppResult<()> {
        self.command(if on { "A1" } else { "A0" }).await?;
        self.commanded.lock().auto_heat = Some(on);
        info!(auto_heat = %Switch::from(on), "Auto heat changed");
        Ok(())
    }

    /// Auto-heat state as reported by the controller.
    pub async fn get_auto_heat_status(&self) -> AppResult<ControlStatus> {
        let status = self.get_status().await?;
        Ok(ControlStatus {
            control: Control::AutoHeat,
            state: status.auto_heat(),
        })
    }

    /// Enable automatic PID selection (`L1`).
    pub async fn auto_pid_on(&self) -> AppResult<()> {
        self.set_auto_pid(true).await
    }

    /// Disable automatic PID selection (`L0`).
    pub async fn auto_pid_off(&self) -> AppResult<()> {
        self.set_auto_pid(false).await
    }

    async fn set_auto_pid(&self, on: bool) -> AppResult<()> {
        self.command(if on { "L1" } else { "L0" }).await?;
        self.commanded.lock().auto_pid = Some(on);
        info!(auto_pid = %Switch::from(on), "Auto PID changed");
        Ok(())
    }

    /// Auto-PID state as reported by the controller.
    pub async fn get_auto_pid_status(&self) -> AppResult<ControlStatus> {
        let status = self.get_status().await?;
        Ok(ControlStatus {
            control: Control::AutoPid,
            state: status.auto_pid,
        })
    }

    /// Set the manual heater output in percent.
    ///
    /// The controller ignores this while auto-heat is on.
    #[instrument(skip(self), fields(link = %self.link.name()), err)]
    pub async fn set_heater_output(&self, percent: f64) -> AppResult<()> {
        if !percent.is_finite() || !(0.0..=MAX_HEATER_OUTPUT).contains(&percent) {
            return Err(DaqError::Configuration(format!(
                "Heater output {percent}% out of range (0-{MAX_HEATER_OUTPUT}%)"
            )));
        }
        self.command(&format!("O{percent}")).await?;
        self.commanded.lock().heater_output = Some(percent);
        info!(heater_output = percent, "Heater output changed");
        Ok(())
    }

    /// Heater output as reported by the controller.
    pub async fn get_heater_output(&self) -> AppResult<Reading> {
        self.get_channel(Channel::HeaterOutput).await
    }

    /// Full `X` status.
    pub async fn get_status(&self) -> AppResult<ControllerStatus> {
        let reply = self.link.query("X").await?;
        check_rejected("X", &reply)?;
        ControllerStatus::parse(&reply)
    }

    /// Read all three sensors; the timestamp is taken once, before the first read.
    pub async fn get_all_temperatures(&self) -> AppResult<TemperatureSnapshot> {
        let timestamp = Utc::now();
        let tsorp = self.get_tsorp().await?;
        let the3 = self.get_the3().await?;
        let t1k = self.get_t1k().await?;
        Ok(TemperatureSnapshot {
            timestamp,
            tsorp,
            the3,
            t1k,
        })
    }

    /// Send a setting command and check the controller echoed its letter.
    async fn command(&self, command: &str) -> AppResult<()> {
        let reply = self.link.query(command).await?;
        check_rejected(command, &reply)?;
        let letter = command.chars().next().unwrap_or_default();
        if !reply.starts_with(letter) {
            return Err(DaqError::parse(
                command,
                reply,
                format!("expected acknowledgement starting with '{letter}'"),
            ));
        }
        debug!(command, "Command acknowledged");
        Ok(())
    }
}

fn check_rejected(command: &str, reply: &str) -> AppResult<()> {
    if reply.starts_with('?') {
        return Err(DaqError::Rejected {
            command: command.to_string(),
            reply: reply.to_string(),
        });
    }
    Ok(())
}

/// Parse an `R` reply such as `R+249.2` or `R30.000`.
fn parse_value(command: &str, reply: &str) -> AppResult<f64> {
    check_rejected(command, reply)?;
    let body = reply
        .strip_prefix('R')
        .ok_or_else(|| DaqError::parse(command, reply, "reply does not start with 'R'"))?
        .trim();
    if body.is_empty() {
        return Err(DaqError::parse(command, reply, "empty value"));
    }
    let value: f64 = body
        .parse()
        .map_err(|e| DaqError::parse(command, reply, format!("not a number: {e}")))?;
    if !value.is_finite() {
        return Err(DaqError::parse(command, reply, "value is not finite"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_formats() {
        let cases = [
            ("R+249.2", 249.2),
            ("R249.2", 249.2),
            ("R+30.000", 30.0),
            ("R-0.5", -0.5),
            ("R7", 7.0),
        ];
        for (reply, expected) in cases {
            assert_eq!(parse_value("R1", reply).unwrap(), expected, "reply {reply}");
        }
    }

    #[test]
    fn test_parse_value_errors() {
        assert!(matches!(parse_value("R1", "R"), Err(DaqError::Parse { .. })));
        assert!(matches!(parse_value("R1", "Rabc"), Err(DaqError::Parse { .. })));
        assert!(matches!(parse_value("R1", "T"), Err(DaqError::Parse { .. })));
        assert!(matches!(parse_value("R1", "Rinf"), Err(DaqError::Parse { .. })));
        assert!(matches!(parse_value("R9", "?R9"), Err(DaqError::Rejected { .. })));
    }

    #[test]
    fn test_parse_status() {
        let status = ControllerStatus::parse("X0A1C3S00H1L0").unwrap();
        assert_eq!(status.system, 0);
        assert_eq!(status.auto_mode, 1);
        assert_eq!(status.auto_heat(), Switch::On);
        assert_eq!(status.control_mode, ControlMode::RemoteUnlocked);
        assert_eq!(status.sweep, 0);
        assert_eq!(status.heater_sensor, Channel::TSorp);
        assert_eq!(status.auto_pid, Switch::Off);

        let status = ControllerStatus::parse("X0A2C3S12H3L1").unwrap();
        assert_eq!(status.auto_heat(), Switch::Off);
        assert_eq!(status.sweep, 12);
        assert_eq!(status.heater_sensor, Channel::T1K);
        assert_eq!(status.auto_pid, Switch::On);
    }

    #[test]
    fn test_parse_status_errors() {
        assert!(ControllerStatus::parse("A1C3S00H1L0").is_err());
        assert!(ControllerStatus::parse("X0A1C3S00H4L0").is_err());
        assert!(ControllerStatus::parse("X0A1C7S00H1L0").is_err());
        assert!(ControllerStatus::parse("X0A1C3S00H1").is_err());
    }
}
