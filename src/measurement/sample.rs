//! Timestamped bundle of channel readings produced once per tick.

use crate::instrument::{Channel, Reading};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One tick's worth of readings.
///
/// Immutable once built: the worker constructs it completely before it is
/// enqueued, so consumers never observe a partial sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    sequence: u64,
    timestamp: DateTime<Utc>,
    readings: Vec<Reading>,
}

impl Sample {
    /// Build a sample. `sequence` is the tick number, starting at 1.
    pub fn new(sequence: u64, timestamp: DateTime<Utc>, readings: Vec<Reading>) -> Self {
        Self {
            sequence,
            timestamp,
            readings,
        }
    }

    /// Tick number that produced this sample. Strictly increasing per worker.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wall-clock time read at the start of the tick.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Readings in channel-list order.
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// Number of readings.
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// Whether the sample carries no readings.
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// First value recorded for `channel`.
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.readings
            .iter()
            .find(|r| r.channel == channel)
            .map(|r| r.value)
    }

    /// Channel names in order.
    pub fn channel_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.readings.iter().map(Reading::name)
    }

    /// CSV row: RFC 3339 timestamp, then one value per reading.
    pub fn to_csv_row(&self) -> String {
        let mut row = self.timestamp.to_rfc3339();
        for reading in &self.readings {
            row.push(',');
            row.push_str(&reading.value.to_string());
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sample {
        Sample::new(
            3,
            Utc::now(),
            vec![
                Reading::new(Channel::TSorp, 249.2),
                Reading::new(Channel::THe3, 7.0),
            ],
        )
    }

    #[test]
    fn test_accessors() {
        let s = sample();
        assert_eq!(s.sequence(), 3);
        assert_eq!(s.len(), 2);
        assert_eq!(s.get(Channel::THe3), Some(7.0));
        assert_eq!(s.get(Channel::T1K), None);
        assert_eq!(s.channel_names().collect::<Vec<_>>(), vec!["TSorp", "THe3"]);
    }

    #[test]
    fn test_csv_row() {
        let s = sample();
        let row = s.to_csv_row();
        assert!(row.ends_with(",249.2,7"));
        assert_eq!(row.split(',').count(), 3);
    }

    #[test]
    fn test_serializes_channel_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["readings"][0]["channel"], "TSorp");
        assert_eq!(json["readings"][0]["value"], 249.2);
    }
}
