//! Module owning the broker and database connections for the lifetime of the daemon.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use paho_mqtt::{AsyncClient, ConnectOptions, DisconnectOptionsBuilder};
use thiserror::Error;

use crate::config::Configuration;
use crate::database::{ConnectError, PostgresStore, ReadingStore};
use crate::mqtt::{self, InboundMessage};
use crate::pipeline::{self, IngestStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Connection state of the broker link.
pub enum LinkState {
    Disconnected,
    Connecting,
    Subscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Events moving the broker link between states.
pub enum LinkEvent {
    /// A connect was started by the supervisor.
    ConnectAttempt,
    /// The initial connect failed.
    ConnectFailed,
    /// A (re)connect succeeded and the broker acknowledged both subscriptions.
    SubscriptionsIssued,
    /// The broker connection dropped.
    ConnectionLost,
    /// The supervisor disconnected the client.
    Shutdown,
}

impl LinkState {
    pub fn on(self, event: LinkEvent) -> LinkState {
        match (self, event) {
            (_, LinkEvent::Shutdown) => LinkState::Disconnected,
            (_, LinkEvent::SubscriptionsIssued) => LinkState::Subscribed,
            (LinkState::Disconnected, LinkEvent::ConnectAttempt) => LinkState::Connecting,
            (LinkState::Connecting, LinkEvent::ConnectFailed) => LinkState::Disconnected,
            (LinkState::Subscribed, LinkEvent::ConnectionLost) => LinkState::Disconnected,
            (state, _) => state,
        }
    }
}

/// Link state shared between the supervisor and the client callbacks.
pub type SharedLinkState = Arc<Mutex<LinkState>>;

/// Applies an event to the shared link state and returns the new state.
pub fn transition(link: &SharedLinkState, event: LinkEvent) -> LinkState {
    let mut state = link.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let next = state.on(event);
    if next != *state {
        log::debug!(target: "heatlogd::supervisor", "Broker link {:?} -> {:?} on {:?}", *state, next, event);
    }
    *state = next;
    next
}

#[derive(Error, Debug)]
/// Failures that keep the daemon from handling messages at all.
pub enum StartupError {
    #[error("{0}")]
    Store(#[from] ConnectError),
    #[error("could not set up the mqtt client: {0}")]
    Transport(#[from] paho_mqtt::Error),
}

/// Handles one message after the other until the termination flag is set or the queue closes.
///
/// Failures of single messages are counted and never end the loop.
pub fn drain<S: ReadingStore>(queue: &Receiver<InboundMessage>, store: &mut S, terminate: &AtomicBool) -> IngestStats {
    let mut stats = IngestStats::default();
    let timeout = Duration::from_millis(100);

    while !terminate.load(Ordering::SeqCst) {
        let message = match queue.recv_timeout(timeout) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!(target: "heatlogd::supervisor", "Inbound queue closed, stopping message loop!");
                break;
            }
        };
        stats.record(pipeline::handle_message(store, &message.topic, &message.payload));
    }
    stats
}

/// Owner of the broker client and the database connection.
pub struct Supervisor {
    configuration: Configuration,
    terminate: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(configuration: Configuration, terminate: Arc<AtomicBool>) -> Supervisor {
        Supervisor { configuration, terminate }
    }

    /// Runs the daemon until the termination flag is set.
    ///
    /// # Errors
    ///
    /// * `StartupError::Store` - The database is not reachable. This is not retried.
    ///
    /// * `StartupError::Transport` - The mqtt client or its options can not be created.
    ///
    pub fn run(&self) -> Result<IngestStats, StartupError> {
        let mut store = PostgresStore::connect(&self.configuration.database)?;

        let capacity = self.configuration.pipeline.queue_capacity.max(1);
        let (queue_tx, queue_rx) = mpsc::sync_channel(capacity);
        let link: SharedLinkState = Arc::new(Mutex::new(LinkState::Disconnected));

        let client_setup = mqtt::create_client(&self.configuration.mqtt, queue_tx, Arc::clone(&link))
            .and_then(|client| Ok((client, mqtt::connect_options(&self.configuration.mqtt)?)));
        let (client, connect_options) = match client_setup {
            Ok(setup) => setup,
            Err(err) => {
                close_store(store);
                return Err(StartupError::Transport(err));
            }
        };

        let stats = if self.connect_transport(&client, &connect_options, &link) {
            log::info!(target: "heatlogd::supervisor", "MQTT to database bridge is running...");
            drain(&queue_rx, &mut store, &self.terminate)
        } else {
            IngestStats::default()
        };

        self.shutdown(client, store, &link);
        Ok(stats)
    }

    /// Connects the client, retrying until it succeeds or the daemon is terminated.
    fn connect_transport(&self, client: &AsyncClient, options: &ConnectOptions, link: &SharedLinkState) -> bool {
        let retry_interval = Duration::from_secs(self.configuration.mqtt.connect_retry_secs.max(1));

        while !self.terminate.load(Ordering::SeqCst) {
            transition(link, LinkEvent::ConnectAttempt);
            match client.connect(options.clone()).wait() {
                Ok(_) => {
                    log::info!(target: "heatlogd::supervisor", "Mqtt client connected to \'{}\'",
                               mqtt::server_uri(&self.configuration.mqtt));
                    return true;
                }
                Err(err) => {
                    transition(link, LinkEvent::ConnectFailed);
                    log::error!(target: "heatlogd::supervisor", "Failed to connect to mqtt broker: \'{}\', retrying in {}s",
                                err, retry_interval.as_secs());
                    self.sleep_unless_terminated(retry_interval);
                }
            }
        }
        false
    }

    fn sleep_unless_terminated(&self, duration: Duration) {
        let step = Duration::from_millis(100);
        let mut waited = Duration::from_millis(0);
        while waited < duration && !self.terminate.load(Ordering::SeqCst) {
            sleep(step);
            waited += step;
        }
    }

    /// Disconnects the client and closes the database, logging instead of failing.
    fn shutdown(&self, client: AsyncClient, store: PostgresStore, link: &SharedLinkState) {
        log::info!(target: "heatlogd::supervisor", "Shutting down...");

        let disconnect_options = DisconnectOptionsBuilder::new()
            .timeout(Duration::from_secs(2))
            .finalize();
        match client.disconnect(disconnect_options).wait() {
            Ok(_) => log::info!(target: "heatlogd::supervisor", "Disconnected from mqtt broker!"),
            Err(err) => log::warn!(target: "heatlogd::supervisor", "Could not disconnect from mqtt broker: \'{}\'", err),
        };
        transition(link, LinkEvent::Shutdown);

        close_store(store);
    }
}

fn close_store(store: PostgresStore) {
    match store.close() {
        Ok(_) => log::info!(target: "heatlogd::supervisor", "Database connection closed!"),
        Err(err) => log::warn!(target: "heatlogd::supervisor", "Could not close database connection: \'{}\'", err),
    }
}
