//! Module for the MQTT side of the daemon.
//!
//! The paho client delivers messages on its own thread. The callbacks registered here only
//! re-issue the subscriptions and move received messages into the bounded inbound queue,
//! the pipeline runs on the thread draining that queue.
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use paho_mqtt as mqtt;
use serde::{Deserialize, Serialize};

use crate::supervisor::{transition, LinkEvent, SharedLinkState};
use crate::topic::SUBSCRIPTION_FILTERS;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
/// Parameters for the mqtt connection.
pub struct MqttParameters
{
    /// The hostname or ip address of the broker.
    pub address: String,
    /// The port of the broker.
    pub port: u16,
    /// Enable tls encryption.
    pub tls_enable: bool,
    /// Optional TLS parameters for the mqtt connection.
    pub tls_params: Option<MqttTlsParameters>,
    /// The QoS to use for the subscriptions.
    pub qos: i32,
    /// Keep alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Prefix of the client id, the unix timestamp of the start is appended.
    pub client_id_prefix: String,
    /// Shortest wait before the client reconnects after a lost connection.
    pub reconnect_min_secs: u64,
    /// Longest wait before the client reconnects after a lost connection.
    pub reconnect_max_secs: u64,
    /// Wait between attempts of the initial connect.
    pub connect_retry_secs: u64,
    /// Drop retained messages instead of storing them.
    pub ignore_retained: bool,
}

impl Default for MqttParameters {
    fn default() -> Self {
        MqttParameters {
            address: String::from("mosquitto"),
            port: 1883,
            tls_enable: false,
            tls_params: None,
            qos: 0,
            keep_alive_secs: 60,
            client_id_prefix: String::from("heatlogd"),
            reconnect_min_secs: 1,
            reconnect_max_secs: 60,
            connect_retry_secs: 5,
            ignore_retained: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// TLS parametes required for MQTT with TLS.
pub struct MqttTlsParameters {
    /// The path to the CA certificate for TLS encryption.
    pub ca_path: String,
    /// The path to the certificate to use for TLS encryption.
    pub cert_path: String,
    /// The path to the key to use for TLS encryption.
    pub key_path: String,
    /// The password for the ssl private key.
    pub key_pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
/// A message taken off the broker, waiting to be handled by the pipeline.
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl From<&mqtt::Message> for InboundMessage {
    fn from(message: &mqtt::Message) -> Self {
        InboundMessage {
            topic: message.topic().to_string(),
            payload: message.payload().to_vec(),
        }
    }
}

/// URI of the broker, `ssl://` when TLS is enabled.
pub fn server_uri(params: &MqttParameters) -> String {
    match params.tls_enable {
        true => format!("ssl://{}:{}", params.address, params.port),
        false => format!("tcp://{}:{}", params.address, params.port),
    }
}

fn client_id(prefix: &str) -> String {
    let started = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_secs())
        .unwrap_or(0);
    format!("{}-{}", prefix, started)
}

/// Logs the result of a subscription, returns `true` if the broker accepted it.
fn check_subscription<T>(filter: &str, result: Result<T, mqtt::Error>) -> bool {
    match result {
        Ok(_) => {
            log::debug!(target: "heatlogd::mqtt", "Subscribed to topic {}", filter);
            true
        }
        Err(err) => {
            log::error!(target: "heatlogd::mqtt", "Unable to subscribe to topic {}: \'{}\'", filter, err);
            false
        }
    }
}

/// Decides whether a received message is handed to the pipeline.
pub fn should_enqueue(message: &mqtt::Message, ignore_retained: bool) -> bool {
    if ignore_retained && message.retained() {
        log::trace!(target: "heatlogd::mqtt", "Ignoring retained message on \'{}\'", message.topic());
        return false;
    }
    true
}

/// Puts a message into the inbound queue without blocking the client thread.
///
/// Returns `false` if the message was dropped because the queue is full or the
/// pipeline has stopped.
pub fn enqueue(queue: &SyncSender<InboundMessage>, message: InboundMessage) -> bool {
    match queue.try_send(message) {
        Ok(_) => {
            log::trace!(target: "heatlogd::mqtt", "Queued message for the pipeline!");
            true
        }
        Err(TrySendError::Full(message)) => {
            log::warn!(target: "heatlogd::mqtt", "Inbound queue is full, dropping message on \'{}\'", message.topic);
            false
        }
        Err(TrySendError::Disconnected(message)) => {
            log::debug!(target: "heatlogd::mqtt", "Pipeline stopped, dropping message on \'{}\'", message.topic);
            false
        }
    }
}

/// Creates the mqtt client and registers its callbacks.
///
/// # Arguments
///
/// * `params` - Parameters for the mqtt connection.
///
/// * `queue` - The inbound queue received messages are put into.
///
/// * `link` - Connection state of the client, updated from the callbacks.
///
pub fn create_client(params: &MqttParameters, queue: SyncSender<InboundMessage>, link: SharedLinkState)
    -> Result<mqtt::AsyncClient, mqtt::Error>
{
    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(server_uri(params))
        .client_id(client_id(&params.client_id_prefix))
        .finalize();

    let mqtt_client = mqtt::AsyncClient::new(create_opts)?;

    let qos = params.qos;
    let connected_link = Arc::clone(&link);
    mqtt_client.set_connected_callback(move |client: &mqtt::AsyncClient| {
        log::info!(target: "heatlogd::mqtt", "Connected to mqtt broker!");
        let tokens: Vec<(&'static str, mqtt::Token)> = SUBSCRIPTION_FILTERS
            .iter()
            .map(|filter| {
                log::debug!(target: "heatlogd::mqtt", "Subscribing to topic {} with qos {}", filter, qos);
                (*filter, client.subscribe(*filter, qos))
            })
            .collect();

        // Waiting on the tokens in the callback would block the client thread.
        let link = Arc::clone(&connected_link);
        let watcher = thread::Builder::new()
            .name("subscribe".to_string())
            .spawn(move || {
                let mut granted = true;
                for (filter, token) in tokens {
                    granted &= check_subscription(filter, token.wait());
                }
                if granted {
                    transition(&link, LinkEvent::SubscriptionsIssued);
                }
            });
        if let Err(err) = watcher {
            log::error!(target: "heatlogd::mqtt", "Cannot start the subscription thread: \'{}\'", err);
        }
    });

    let lost_link = Arc::clone(&link);
    mqtt_client.set_connection_lost_callback(move |_: &mqtt::AsyncClient| {
        log::warn!(target: "heatlogd::mqtt", "Disconnected from mqtt broker, waiting for reconnect!");
        transition(&lost_link, LinkEvent::ConnectionLost);
    });

    let ignore_retained = params.ignore_retained;
    mqtt_client.set_message_callback(move |_: &mqtt::AsyncClient, message: Option<mqtt::Message>| {
        if let Some(message) = message {
            if should_enqueue(&message, ignore_retained) {
                enqueue(&queue, InboundMessage::from(&message));
            }
        }
    });

    Ok(mqtt_client)
}

/// Builds the connect options, with automatic reconnect after the first successful connect.
pub fn connect_options(params: &MqttParameters) -> Result<mqtt::ConnectOptions, mqtt::Error> {
    let mut builder = mqtt::ConnectOptionsBuilder::new();
    builder
        .keep_alive_interval(Duration::from_secs(params.keep_alive_secs))
        .clean_session(true)
        .connect_timeout(Duration::from_millis(4000))
        .automatic_reconnect(
            Duration::from_secs(params.reconnect_min_secs),
            Duration::from_secs(params.reconnect_max_secs.max(params.reconnect_min_secs)),
        );

    if params.tls_enable {
        let tls_params = params.tls_params.as_ref()
            .ok_or(mqtt::Error::General("TLS enabled but no TLS parameters specified"))?;
        builder.ssl_options(ssl_options(tls_params)?);
    }

    Ok(builder.finalize())
}

fn ssl_options(tls_params: &MqttTlsParameters) -> Result<mqtt::SslOptions, mqtt::Error> {
    let mut builder = mqtt::SslOptionsBuilder::new();
    builder.trust_store(&tls_params.ca_path)?;
    builder.key_store(&tls_params.cert_path)?;
    builder.private_key(&tls_params.key_path)?;
    if let Some(key_pass) = &tls_params.key_pass {
        builder.private_key_password(key_pass);
    }
    Ok(builder.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn message(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_server_uri_scheme_follows_tls() {
        let mut params = MqttParameters::default();
        assert_eq!(server_uri(&params), "tcp://mosquitto:1883");

        params.tls_enable = true;
        params.port = 8883;
        assert_eq!(server_uri(&params), "ssl://mosquitto:8883");
    }

    #[test]
    fn test_client_id_has_prefix() {
        let id = client_id("heatlogd");
        assert!(id.starts_with("heatlogd-"));
        assert!(id["heatlogd-".len()..].parse::<u64>().is_ok());
    }

    #[test]
    fn test_connect_options_require_tls_parameters_when_enabled() {
        let params = MqttParameters {
            tls_enable: true,
            ..MqttParameters::default()
        };
        assert!(connect_options(&params).is_err());
        assert!(connect_options(&MqttParameters::default()).is_ok());
    }

    #[test]
    fn test_enqueue_drops_when_queue_is_full() {
        let (tx, rx) = mpsc::sync_channel(2);
        assert!(enqueue(&tx, message("heating/a/temperature", "1")));
        assert!(enqueue(&tx, message("heating/b/temperature", "2")));
        assert!(!enqueue(&tx, message("heating/c/temperature", "3")));

        assert_eq!(rx.recv().unwrap().topic, "heating/a/temperature");
        assert!(enqueue(&tx, message("heating/d/temperature", "4")));
        assert_eq!(rx.recv().unwrap().topic, "heating/b/temperature");
        assert_eq!(rx.recv().unwrap().topic, "heating/d/temperature");
    }

    #[test]
    fn test_enqueue_after_pipeline_stopped() {
        let (tx, rx) = mpsc::sync_channel(4);
        drop(rx);
        assert!(!enqueue(&tx, message("heating/a/status", "{}")));
    }

    #[test]
    fn test_retained_messages_follow_setting() {
        let live = mqtt::Message::new("heating/kitchen/temperature", "21.5", 0);
        let retained = mqtt::Message::new_retained("heating/kitchen/temperature", "21.5", 0);

        assert!(should_enqueue(&live, false));
        assert!(should_enqueue(&retained, false));
        assert!(should_enqueue(&live, true));
        assert!(!should_enqueue(&retained, true));
    }

    #[test]
    fn test_check_subscription() {
        assert!(check_subscription("heating/+/status", Ok(())));
        assert!(!check_subscription::<()>(
            "heating/+/status",
            Err(mqtt::Error::General("not authorized"))
        ));
    }

    #[test]
    fn test_inbound_message_from_mqtt_message() {
        let mqtt_message = mqtt::Message::new("heating/kitchen/temperature", "21.5", 0);
        assert_eq!(
            InboundMessage::from(&mqtt_message),
            message("heating/kitchen/temperature", "21.5")
        );
    }
}
