use serde::ser::{Serialize, SerializeMap, Serializer};
use std::time::{SystemTime, UNIX_EPOCH};

/// One named measurement in a snapshot.
///
/// `value` is `None` when the measurement could not be obtained this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub name: String,
    pub value: Option<f64>,
}

impl Reading {
    /// Create a reading.
    pub fn new(name: impl Into<String>, value: Option<f64>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// The decoded values produced by one polling cycle.
///
/// Readings keep the order they were pushed in, which is the order of the
/// outbound payload schema. Serializes as a single flat object:
///
/// ```text
/// { "<id_field>": "<station id>", "<reading>": 12.5, "<failed reading>": null, ... }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingSnapshot {
    /// Key under which the station identifier is emitted.
    pub id_field: String,

    /// Station identifier tag.
    pub station_id: String,

    /// Unix epoch milliseconds when the cycle started.
    pub timestamp: i64,

    /// Emit `timestamp` as a field of the payload.
    pub include_timestamp: bool,

    readings: Vec<Reading>,
}

impl ReadingSnapshot {
    /// Create an empty snapshot stamped with the current time.
    pub fn new(id_field: impl Into<String>, station_id: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
            station_id: station_id.into(),
            timestamp: current_timestamp_millis(),
            include_timestamp: false,
            readings: Vec::new(),
        }
    }

    /// Emit the cycle timestamp in the payload.
    pub fn with_timestamp(mut self, include: bool) -> Self {
        self.include_timestamp = include;
        self
    }

    /// Append a reading.
    pub fn push(&mut self, reading: Reading) {
        self.readings.push(reading);
    }

    /// Readings in payload order.
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// Look up a reading value by name.
    ///
    /// Returns `None` both for unknown names and for failed readings.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.readings
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| r.value)
    }

    /// Number of readings that hold no value.
    pub fn missing(&self) -> usize {
        self.readings.iter().filter(|r| r.value.is_none()).count()
    }
}

/// Payload key of the cycle timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";

impl Serialize for ReadingSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = if self.include_timestamp { 2 } else { 1 };
        let mut map = serializer.serialize_map(Some(self.readings.len() + extra))?;
        map.serialize_entry(&self.id_field, &self.station_id)?;
        for reading in &self.readings {
            map.serialize_entry(&reading.name, &reading.value)?;
        }
        if self.include_timestamp {
            map.serialize_entry(TIMESTAMP_FIELD, &self.timestamp)?;
        }
        map.end()
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch (should never happen in practice).
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Format a snapshot timestamp as RFC 3339 for logs.
pub fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReadingSnapshot {
        let mut snapshot = ReadingSnapshot::new("weatherStationId", "ws-01");
        snapshot.push(Reading::new("solarRadiation", Some(412.0)));
        snapshot.push(Reading::new("temperature", Some(-3.5)));
        snapshot.push(Reading::new("humidity", None));
        snapshot
    }

    #[test]
    fn test_field_order_preserved() {
        let json = serde_json::to_string(&sample()).unwrap();

        assert_eq!(
            json,
            r#"{"weatherStationId":"ws-01","solarRadiation":412.0,"temperature":-3.5,"humidity":null}"#
        );
    }

    #[test]
    fn test_lookup_and_missing() {
        let snapshot = sample();

        assert_eq!(snapshot.get("temperature"), Some(-3.5));
        assert_eq!(snapshot.get("humidity"), None);
        assert_eq!(snapshot.get("unknown"), None);
        assert_eq!(snapshot.missing(), 1);
        assert_eq!(snapshot.readings().len(), 3);
    }

    #[test]
    fn test_timestamp_field() {
        let mut snapshot = sample().with_timestamp(true);
        snapshot.timestamp = 1_700_000_000_000;

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00+00:00");
    }
}
