//! Module handling single inbound messages from topic to stored row.
use std::fmt;

use crate::database::ReadingStore;
use crate::payload;
use crate::record;
use crate::topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What happened to a single inbound message.
pub enum Outcome {
    /// The topic is outside the heating hierarchy.
    Filtered,
    /// The payload could not be decoded, the message was dropped.
    DecodeFailed,
    /// The sensor had no reading, nothing to store.
    Skipped,
    /// The insert failed and was rolled back, the message was dropped.
    WriteFailed,
    /// One row was written.
    Stored,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Counters over the outcomes of all handled messages.
pub struct IngestStats {
    pub received: u64,
    pub stored: u64,
    pub filtered: u64,
    pub skipped: u64,
    pub decode_failures: u64,
    pub write_failures: u64,
}

impl IngestStats {
    pub fn record(&mut self, outcome: Outcome) {
        self.received += 1;
        match outcome {
            Outcome::Filtered => self.filtered += 1,
            Outcome::DecodeFailed => self.decode_failures += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::WriteFailed => self.write_failures += 1,
            Outcome::Stored => self.stored += 1,
        }
    }
}

impl fmt::Display for IngestStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "received={} stored={} filtered={} skipped={} decode_failures={} write_failures={}",
               self.received, self.stored, self.filtered, self.skipped, self.decode_failures, self.write_failures)
    }
}

/// Routes, decodes, normalizes and stores a single message.
///
/// Every failure is logged here and ends handling of this message only, the returned
/// outcome is informational.
pub fn handle_message<S>(store: &mut S, topic: &str, payload: &[u8]) -> Outcome
    where S: ReadingStore + ?Sized
{
    let address = match topic::parse(topic) {
        Some(address) => address,
        None => {
            log::trace!(target: "heatlogd::pipeline", "Ignoring message on \'{}\'", topic);
            return Outcome::Filtered;
        }
    };

    log::info!(target: "heatlogd::pipeline", "Received: {} -> {}", topic, String::from_utf8_lossy(payload));

    let decoded = match payload::decode(address.kind, payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            log::error!(target: "heatlogd::pipeline", "Error processing message {}: \'{}\'", topic, err);
            return Outcome::DecodeFailed;
        }
    };

    let reading = match record::normalize(&address, decoded) {
        Some(reading) => reading,
        None => {
            log::debug!(target: "heatlogd::pipeline", "Sensor at \'{}\' has no reading, skipping", address.location);
            return Outcome::Skipped;
        }
    };

    match store.write(&reading) {
        Ok(_) => {
            log::info!(target: "heatlogd::pipeline", "Stored temperature: {} = {}°C ({})",
                       reading.location, reading.temperature, reading.device_id);
            Outcome::Stored
        }
        Err(err) => {
            log::error!(target: "heatlogd::pipeline", "Failed to store temperature: \'{}\'", err);
            Outcome::WriteFailed
        }
    }
}
