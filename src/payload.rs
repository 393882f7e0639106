//! Module for decoding the raw MQTT payloads of the two heating message kinds.
use serde::de::Error as _;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::topic::MessageKind;

#[derive(Deserialize, Debug, Clone, PartialEq)]
/// Status report published by a sensor device on `heating/<location>/status`.
pub struct StatusReport {
    /// Temperature value in celsius, `-999` if the sensor has no reading.
    pub temperature: f64,
    /// Identifier of the publishing device.
    #[serde(default)]
    pub device_id: Option<String>,
    /// WiFi signal strength in dBm.
    #[serde(default)]
    pub rssi: Option<i32>,
    /// Seconds since the device booted.
    #[serde(default)]
    pub uptime: Option<i64>,
    /// Free heap memory of the device in bytes.
    #[serde(default)]
    pub free_heap: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
/// A payload decoded according to the message kind of its topic.
pub enum DecodedPayload {
    /// Payload of a `temperature` topic.
    PlainTemperature(f64),
    /// Payload of a `status` topic.
    StatusReport(StatusReport),
}

#[derive(Error, Debug)]
/// Reasons a payload can not be decoded.
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("payload '{0}' is not a number")]
    NotANumber(String),
    #[error("payload is not a valid status report: {0}")]
    MalformedStructure(#[from] serde_json::Error),
}

/// Decodes a raw payload using the schema of the given message kind.
///
/// The schema is selected by `kind` only, the payload content is never inspected to guess it.
///
/// # Errors
///
/// * `DecodeError::NotANumber` - A temperature payload that is empty, non numeric or not finite.
///
/// * `DecodeError::MalformedStructure` - A status payload that is no JSON object or lacks a
///     numeric `temperature`.
///
pub fn decode(kind: MessageKind, payload: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let text = std::str::from_utf8(payload)?.trim();

    match kind {
        MessageKind::Temperature => {
            let temperature = text
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| DecodeError::NotANumber(text.to_string()))?;
            Ok(DecodedPayload::PlainTemperature(temperature))
        }
        MessageKind::Status => {
            // Only objects are status reports, arrays would fill the fields by position.
            let value = serde_json::from_str::<Value>(text)?;
            if !value.is_object() {
                let err = serde_json::Error::custom(format!("expected a JSON object, got {}", value));
                return Err(DecodeError::MalformedStructure(err));
            }
            let report = serde_json::from_value::<StatusReport>(value)?;
            Ok(DecodedPayload::StatusReport(report))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_temperature() {
        match decode(MessageKind::Temperature, b"21.5").unwrap() {
            DecodedPayload::PlainTemperature(value) => assert_eq!(value, 21.5),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_plain_temperature_trims_whitespace() {
        match decode(MessageKind::Temperature, b" -3.25\r\n").unwrap() {
            DecodedPayload::PlainTemperature(value) => assert_eq!(value, -3.25),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_plain_temperature_rejects_text() {
        let err = decode(MessageKind::Temperature, b"not-a-number").unwrap_err();
        assert!(matches!(err, DecodeError::NotANumber(ref text) if text == "not-a-number"));

        assert!(matches!(decode(MessageKind::Temperature, b""), Err(DecodeError::NotANumber(_))));
        assert!(matches!(decode(MessageKind::Temperature, b"NaN"), Err(DecodeError::NotANumber(_))));
        assert!(matches!(decode(MessageKind::Temperature, b"inf"), Err(DecodeError::NotANumber(_))));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let err = decode(MessageKind::Temperature, &[0xff, 0xfe, 0x32]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8(_)));
    }

    #[test]
    fn test_decode_full_status_report() {
        let payload = br#"{"temperature": 22.3, "device_id": "esp32-a", "rssi": -67, "uptime": 120, "free_heap": 4096}"#;
        let expected = StatusReport {
            temperature: 22.3,
            device_id: Some("esp32-a".to_string()),
            rssi: Some(-67),
            uptime: Some(120),
            free_heap: Some(4096),
        };
        assert_eq!(
            decode(MessageKind::Status, payload).unwrap(),
            DecodedPayload::StatusReport(expected)
        );
    }

    #[test]
    fn test_decode_status_report_with_missing_optionals() {
        match decode(MessageKind::Status, br#"{"temperature": 19}"#).unwrap() {
            DecodedPayload::StatusReport(report) => {
                assert_eq!(report.temperature, 19.0);
                assert_eq!(report.device_id, None);
                assert_eq!(report.rssi, None);
                assert_eq!(report.uptime, None);
                assert_eq!(report.free_heap, None);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_status_report_ignores_unknown_keys() {
        let payload = br#"{"temperature": 20.0, "firmware": "1.2.0"}"#;
        assert!(decode(MessageKind::Status, payload).is_ok());
    }

    #[test]
    fn test_decode_status_report_requires_temperature() {
        let payload = br#"{"device_id": "esp32-a", "rssi": -70}"#;
        assert!(matches!(
            decode(MessageKind::Status, payload),
            Err(DecodeError::MalformedStructure(_))
        ));
        assert!(matches!(
            decode(MessageKind::Status, br#"{"temperature": null}"#),
            Err(DecodeError::MalformedStructure(_))
        ));
    }

    #[test]
    fn test_decode_status_report_rejects_non_objects() {
        let payloads: [&[u8]; 7] = [
            b"21.5",
            b"[1, 2]",
            b"[21.5]",
            br#"[21.5, "esp32-a"]"#,
            b"\"21.5\"",
            b"{temperature: 1}",
            b"",
        ];
        for payload in payloads.iter() {
            assert!(matches!(
                decode(MessageKind::Status, payload),
                Err(DecodeError::MalformedStructure(_))
            ));
        }
    }
}
