//! Module that contains the canonical reading record stored in the database.
use serde::Serialize;

use crate::payload::DecodedPayload;
use crate::topic::TopicAddress;

/// Temperature reported by sensors that currently have no valid measurement.
pub const SENTINEL_TEMPERATURE: f64 = -999.0;

#[derive(Serialize, Debug, Clone, PartialEq)]
/// Device diagnostics stored alongside readings from status reports.
pub struct ReadingMetadata {
    /// Seconds since the device booted.
    pub uptime: Option<i64>,
    /// Free heap memory of the device in bytes.
    pub free_heap: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
/// A single temperature reading as it is written to the `temperature_readings` table.
///
/// The record timestamp is assigned by the database on insert.
pub struct SensorReading
{
    /// The location the reading was taken at.
    pub location: String,
    /// Temperature value in celsius.
    pub temperature: f64,
    /// The device that published the reading.
    pub device_id: String,
    /// WiFi signal strength in dBm.
    pub rssi: Option<i32>,
    /// Battery level in percent, not reported by the current sensors.
    pub battery_level: Option<i32>,
    /// Device diagnostics, only present for readings from status reports.
    pub metadata: Option<ReadingMetadata>,
}

/// Device id used when the publisher did not name itself or sent an empty id.
pub fn default_device_id(location: &str) -> String {
    format!("sensor_{}", location)
}

/// Maps a decoded payload to the reading that should be stored for it.
///
/// Returns `None` for status reports carrying [`SENTINEL_TEMPERATURE`].
pub fn normalize(address: &TopicAddress, decoded: DecodedPayload) -> Option<SensorReading> {
    match decoded {
        DecodedPayload::PlainTemperature(temperature) => Some(SensorReading {
            location: address.location.clone(),
            temperature,
            device_id: default_device_id(&address.location),
            rssi: None,
            battery_level: None,
            metadata: None,
        }),
        DecodedPayload::StatusReport(report) => {
            if report.temperature == SENTINEL_TEMPERATURE {
                return None;
            }
            Some(SensorReading {
                location: address.location.clone(),
                temperature: report.temperature,
                device_id: report
                    .device_id
                    .filter(|device_id| !device_id.is_empty())
                    .unwrap_or_else(|| default_device_id(&address.location)),
                rssi: report.rssi,
                battery_level: None,
                metadata: Some(ReadingMetadata {
                    uptime: report.uptime,
                    free_heap: report.free_heap,
                }),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::StatusReport;
    use crate::topic::MessageKind;

    fn address(location: &str, kind: MessageKind) -> TopicAddress {
        TopicAddress {
            location: location.to_string(),
            kind,
        }
    }

    fn report(temperature: f64) -> StatusReport {
        StatusReport {
            temperature,
            device_id: Some("esp32-a".to_string()),
            rssi: Some(-67),
            uptime: Some(120),
            free_heap: Some(4096),
        }
    }

    #[test]
    fn test_normalize_plain_temperature() {
        let reading = normalize(
            &address("kitchen", MessageKind::Temperature),
            DecodedPayload::PlainTemperature(21.5),
        )
        .unwrap();

        assert_eq!(
            reading,
            SensorReading {
                location: "kitchen".to_string(),
                temperature: 21.5,
                device_id: "sensor_kitchen".to_string(),
                rssi: None,
                battery_level: None,
                metadata: None,
            }
        );
    }

    #[test]
    fn test_normalize_plain_temperature_keeps_sentinel_value() {
        let reading = normalize(
            &address("kitchen", MessageKind::Temperature),
            DecodedPayload::PlainTemperature(SENTINEL_TEMPERATURE),
        );
        assert_eq!(reading.map(|r| r.temperature), Some(SENTINEL_TEMPERATURE));
    }

    #[test]
    fn test_normalize_status_report() {
        let reading = normalize(
            &address("cellar", MessageKind::Status),
            DecodedPayload::StatusReport(report(22.3)),
        )
        .unwrap();

        assert_eq!(reading.location, "cellar");
        assert_eq!(reading.temperature, 22.3);
        assert_eq!(reading.device_id, "esp32-a");
        assert_eq!(reading.rssi, Some(-67));
        assert_eq!(reading.battery_level, None);
        assert_eq!(
            reading.metadata,
            Some(ReadingMetadata {
                uptime: Some(120),
                free_heap: Some(4096),
            })
        );
    }

    #[test]
    fn test_normalize_status_report_defaults_device_id() {
        let mut status = report(18.0);
        status.device_id = None;

        let reading = normalize(
            &address("attic", MessageKind::Status),
            DecodedPayload::StatusReport(status),
        )
        .unwrap();
        assert_eq!(reading.device_id, "sensor_attic");
    }

    #[test]
    fn test_normalize_status_report_defaults_empty_device_id() {
        let mut status = report(20.0);
        status.device_id = Some(String::new());

        let reading = normalize(
            &address("cellar", MessageKind::Status),
            DecodedPayload::StatusReport(status),
        )
        .unwrap();
        assert_eq!(reading.device_id, "sensor_cellar");
    }

    #[test]
    fn test_normalize_status_report_skips_sentinel() {
        let reading = normalize(
            &address("attic", MessageKind::Status),
            DecodedPayload::StatusReport(report(SENTINEL_TEMPERATURE)),
        );
        assert_eq!(reading, None);
    }

    #[test]
    fn test_metadata_serializes_absent_fields_as_null() {
        let metadata = ReadingMetadata {
            uptime: Some(120),
            free_heap: None,
        };
        assert_eq!(
            serde_json::to_value(&metadata).unwrap(),
            serde_json::json!({"uptime": 120, "free_heap": null})
        );
    }
}
