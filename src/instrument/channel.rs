//! Channel identifiers and labelled values returned by the ITC503 client.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named read point on the controller.
///
/// The three sensors follow the usual Heliox wiring: sensor 1 on the sorption
/// pump, sensor 2 on the He-3 pot, sensor 3 on the 1 K pot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Sorption pump temperature (sensor 1).
    TSorp,
    /// He-3 pot temperature (sensor 2).
    THe3,
    /// 1 K pot temperature (sensor 3).
    T1K,
    /// Temperature setpoint.
    Setpoint,
    /// Heater output in percent of maximum.
    HeaterOutput,
}

impl Channel {
    /// Every channel, in declaration order.
    pub const ALL: [Channel; 5] = [
        Channel::TSorp,
        Channel::THe3,
        Channel::T1K,
        Channel::Setpoint,
        Channel::HeaterOutput,
    ];

    /// Canonical channel name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::TSorp => "TSorp",
            Channel::THe3 => "THe3",
            Channel::T1K => "T1K",
            Channel::Setpoint => "Setpoint",
            Channel::HeaterOutput => "HeaterOutput",
        }
    }

    /// `R` command that reads this channel.
    pub fn read_command(&self) -> &'static str {
        match self {
            Channel::Setpoint => "R0",
            Channel::TSorp => "R1",
            Channel::THe3 => "R2",
            Channel::T1K => "R3",
            Channel::HeaterOutput => "R5",
        }
    }

    /// Physical sensor number, for channels that are temperature sensors.
    pub fn sensor_number(&self) -> Option<u8> {
        match self {
            Channel::TSorp => Some(1),
            Channel::THe3 => Some(2),
            Channel::T1K => Some(3),
            Channel::Setpoint | Channel::HeaterOutput => None,
        }
    }

    /// Inverse of [`Channel::sensor_number`].
    pub fn from_sensor_number(number: u8) -> Option<Channel> {
        match number {
            1 => Some(Channel::TSorp),
            2 => Some(Channel::THe3),
            3 => Some(Channel::T1K),
            _ => None,
        }
    }

    /// Whether this channel can drive the heater control loop.
    pub fn is_sensor(&self) -> bool {
        self.sensor_number().is_some()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = DaqError;

    /// Parse a channel name. Matching ignores ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                let valid: Vec<&str> = Channel::ALL.iter().map(|c| c.as_str()).collect();
                DaqError::Configuration(format!(
                    "Unknown channel '{}'. Valid channels: {}",
                    name,
                    valid.join(", ")
                ))
            })
    }
}

/// One labelled scalar value, e.g. `("TSorp", 249.2)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Channel the value was read from.
    pub channel: Channel,
    /// Value in the channel's native unit (K for temperatures, % for heater output).
    pub value: f64,
}

impl Reading {
    /// Create a reading.
    pub fn new(channel: Channel, value: f64) -> Self {
        Self { channel, value }
    }

    /// Channel name of this reading.
    pub fn name(&self) -> &'static str {
        self.channel.as_str()
    }
}

impl From<Reading> for (&'static str, f64) {
    fn from(reading: Reading) -> Self {
        (reading.name(), reading.value)
    }
}

/// Two-valued state of a control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Switch {
    /// Loop enabled.
    On,
    /// Loop disabled.
    Off,
}

impl Switch {
    /// `true` for [`Switch::On`].
    pub fn is_on(&self) -> bool {
        matches!(self, Switch::On)
    }
}

impl From<bool> for Switch {
    fn from(on: bool) -> Self {
        if on {
            Switch::On
        } else {
            Switch::Off
        }
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Switch::On => "On",
            Switch::Off => "Off",
        })
    }
}

/// Independent control axes that can be toggled on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Control {
    /// Automatic heater control.
    AutoHeat,
    /// Automatic PID table selection.
    AutoPid,
}

impl Control {
    /// Label used in status tuples.
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::AutoHeat => "AutoHeat",
            Control::AutoPid => "AutoPID",
        }
    }
}

/// A labelled control state, e.g. `("AutoHeat", On)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStatus {
    /// Which control loop.
    pub control: Control,
    /// Its state as read back from the controller.
    pub state: Switch,
}

impl ControlStatus {
    /// Label of the control loop.
    pub fn name(&self) -> &'static str {
        self.control.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert_eq!("tsorp".parse::<Channel>().unwrap(), Channel::TSorp);
        assert_eq!(" T1K ".parse::<Channel>().unwrap(), Channel::T1K);
    }

    #[test]
    fn test_unknown_channel_is_configuration_error() {
        let err = "TMixingChamber".parse::<Channel>().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(err.to_string().contains("TSorp"));
    }

    #[test]
    fn test_sensor_numbers() {
        assert_eq!(Channel::TSorp.sensor_number(), Some(1));
        assert_eq!(Channel::from_sensor_number(2), Some(Channel::THe3));
        assert_eq!(Channel::from_sensor_number(4), None);
        assert!(!Channel::Setpoint.is_sensor());
        assert_eq!(Channel::HeaterOutput.read_command(), "R5");
    }

    #[test]
    fn test_reading_as_tuple() {
        let pair: (&str, f64) = Reading::new(Channel::TSorp, 249.2).into();
        assert_eq!(pair, ("TSorp", 249.2));
    }

    #[test]
    fn test_switch_display() {
        assert_eq!(Switch::from(true).to_string(), "On");
        assert_eq!(Switch::Off.to_string(), "Off");
        assert_eq!(Control::AutoPid.as_str(), "AutoPID");
    }
}
