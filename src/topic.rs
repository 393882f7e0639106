//! Module for mapping MQTT topics of the heating hierarchy to structured addresses.
//!
//! Only topics of the form `heating/<location>/<kind>` are accepted, everything else is
//! traffic this daemon is not interested in.

/// The first segment every accepted topic must start with.
pub const TOPIC_ROOT: &str = "heating";

/// Topic filters the daemon subscribes to, one per message kind.
pub const SUBSCRIPTION_FILTERS: [&str; 2] = ["heating/+/temperature", "heating/+/status"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The kind of message published on a topic, taken from the last topic segment.
pub enum MessageKind {
    /// Plain numeric temperature in celsius.
    Temperature,
    /// JSON status report of a sensor device.
    Status,
}

impl MessageKind {
    fn from_segment(segment: &str) -> Option<MessageKind> {
        match segment {
            "temperature" => Some(MessageKind::Temperature),
            "status" => Some(MessageKind::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Structured form of an accepted topic.
pub struct TopicAddress {
    /// The location segment of the topic, e.g. `living_room`.
    pub location: String,
    /// The message kind segment of the topic.
    pub kind: MessageKind,
}

/// Parses a topic into a [`TopicAddress`].
///
/// # Returns
///
/// * `Some(address)` - For topics of the form `heating/<location>/{temperature,status}`.
///
/// * `None` - For every other topic. This is not an error, the caller ignores the message.
///
pub fn parse(topic: &str) -> Option<TopicAddress> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() != 3 || segments.iter().any(|segment| segment.is_empty()) {
        return None;
    }
    if segments[0] != TOPIC_ROOT {
        return None;
    }

    let kind = MessageKind::from_segment(segments[2])?;
    Some(TopicAddress {
        location: segments[1].to_string(),
        kind,
    })
}
