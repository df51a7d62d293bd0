//! MQTT broker connector
//!
//! Maintains subscriptions on external brokers in response to registry
//! state: one manager (network client) per broker URL, one refcounted
//! subscription per topic. Inbound messages are decoded as SenML packs,
//! matched against the registry and submitted to the storage adapter.
//! Failed subscription setups are retried every ten seconds.
//!
//! Broker sessions sit behind the [`BrokerClient`]/[`BrokerConnection`]
//! traits; [`MqttBrokerClient`] is the production implementation over
//! rumqttc. Session events (reconnects, inbound publishes) flow through a
//! channel into a connector-owned dispatch task, which reinstalls
//! subscriptions after a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::notify::EventListener;
use crate::registry::Registry;
use crate::senml::{Pack, Record};
use crate::types::{MqttSource, Stream};

use super::Storage;

/// Interval between attempts to redo failed subscription setups
const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period for a clean broker disconnect
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events a broker session forwards into the connector
#[derive(Debug)]
pub enum BrokerEvent {
    /// The session (re)connected; subscriptions must be reinstalled
    Connected {
        /// Broker the session belongs to
        broker_url: String,
    },
    /// An inbound message on a subscribed topic
    Message {
        /// Broker the message arrived from
        broker_url: String,
        /// Topic the message was published on
        topic: String,
        /// Raw payload
        payload: Vec<u8>,
    },
}

/// Options for establishing one broker session
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Broker URL, e.g. "tcp://broker:1883"
    pub broker_url: String,
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Optional basic-auth username
    pub username: Option<String>,
    /// Optional basic-auth password
    pub password: Option<String>,
}

/// An established broker session
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Subscribe to a topic
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<()>;

    /// Unsubscribe from a topic
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Disconnect gracefully
    async fn disconnect(&self) -> Result<()>;
}

/// Factory for broker sessions
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connect synchronously. Session events flow into `events` for the
    /// life of the connection.
    async fn connect(
        &self,
        opts: ConnectOptions,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Result<Box<dyn BrokerConnection>>;
}

struct Subscription {
    qos: u8,
    receivers: usize,
}

struct Manager {
    connection: Box<dyn BrokerConnection>,
    subscriptions: HashMap<String, Subscription>,
}

#[derive(Default)]
struct State {
    managers: HashMap<String, Manager>,
    // record-name -> stream snapshot, avoids a registry hit per message
    cache: HashMap<String, Stream>,
    // stream-name -> source, for subscriptions that failed to set up
    failed: HashMap<String, MqttSource>,
}

/// Connector maintaining broker subscriptions from registry state
pub struct MqttConnector {
    storage: Arc<dyn Storage>,
    broker_client: Arc<dyn BrokerClient>,
    client_id: String,
    registry: OnceLock<Arc<dyn Registry>>,
    state: Mutex<State>,
    events_tx: mpsc::Sender<BrokerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<BrokerEvent>>>,
}

impl MqttConnector {
    /// Create a connector. [`MqttConnector::start`] wires the registry and
    /// spawns the dispatch and retry tasks.
    pub fn new(
        storage: Arc<dyn Storage>,
        broker_client: Arc<dyn BrokerClient>,
        client_id: impl Into<String>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            storage,
            broker_client,
            client_id: client_id.into(),
            registry: OnceLock::new(),
            state: Mutex::new(State::default()),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
        })
    }

    fn registry(&self) -> Option<&Arc<dyn Registry>> {
        self.registry.get()
    }

    /// Page through the registry, subscribe every MQTT-sourced stream and
    /// spawn the retry and dispatch tasks. Registration failures are
    /// recorded for retry instead of failing startup.
    pub async fn start(self: Arc<Self>, registry: Arc<dyn Registry>) -> Result<()> {
        self.registry
            .set(registry.clone())
            .map_err(|_| Error::Internal("connector already started".into()))?;

        let per_page = 100;
        let mut page = 1;
        loop {
            let (streams, total) = registry.get_many(page, per_page).await?;
            for stream in &streams {
                let Some(source) = stream.source.mqtt() else {
                    continue;
                };
                let mut state = self.state.lock().await;
                if let Err(e) = self.register(&mut state, source).await {
                    warn!(stream = %stream.name, error = %e,
                        "subscription setup failed, will retry");
                    state.failed.insert(stream.name.clone(), source.clone());
                }
            }
            if page * per_page >= total {
                break;
            }
            page += 1;
        }

        let connector = self.clone();
        tokio::spawn(async move { connector.retry_loop().await });

        let mut rx = self
            .events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("connector already started".into()))?;
        let connector = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                connector.dispatch(event).await;
            }
        });

        Ok(())
    }

    async fn retry_loop(&self) {
        loop {
            tokio::time::sleep(RETRY_INTERVAL).await;
            let mut state = self.state.lock().await;
            let pending: Vec<(String, MqttSource)> = state
                .failed
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (name, source) in pending {
                match self.register(&mut state, &source).await {
                    Ok(()) => {
                        state.failed.remove(&name);
                        info!(stream = %name, "subscription established after retry");
                    }
                    Err(e) => {
                        warn!(stream = %name, error = %e,
                            "subscription setup failed, will retry");
                    }
                }
            }
            crate::metrics::FAILED_REGISTRATIONS.set(state.failed.len() as i64);
        }
    }

    /// Add a subscription, creating the broker session on first use.
    /// Refcounts subscriptions shared by several streams.
    async fn register(&self, state: &mut State, source: &MqttSource) -> Result<()> {
        if let Some(manager) = state.managers.get_mut(&source.url) {
            if let Some(sub) = manager.subscriptions.get_mut(&source.topic) {
                sub.receivers += 1;
                return Ok(());
            }
            manager.connection.subscribe(&source.topic, source.qos).await?;
            manager.subscriptions.insert(
                source.topic.clone(),
                Subscription { qos: source.qos, receivers: 1 },
            );
            info!(broker = %source.url, topic = %source.topic, "subscribed");
            return Ok(());
        }

        let opts = ConnectOptions {
            broker_url: source.url.clone(),
            client_id: format!("HDS-{}", self.client_id),
            username: source.username.clone(),
            password: source.password.clone(),
        };
        let connection = self
            .broker_client
            .connect(opts, self.events_tx.clone())
            .await?;
        connection.subscribe(&source.topic, source.qos).await?;

        let mut subscriptions = HashMap::new();
        subscriptions.insert(
            source.topic.clone(),
            Subscription { qos: source.qos, receivers: 1 },
        );
        state.managers.insert(
            source.url.clone(),
            Manager { connection, subscriptions },
        );
        info!(broker = %source.url, topic = %source.topic, "connected and subscribed");
        Ok(())
    }

    /// Drop one receiver of a subscription; unsubscribe on the last one
    /// and disconnect the session when no topics remain.
    async fn unregister(&self, state: &mut State, source: &MqttSource) -> Result<()> {
        // a failed registration at startup leaves no manager behind
        let Some(manager) = state.managers.get_mut(&source.url) else {
            return Ok(());
        };
        let Some(sub) = manager.subscriptions.get_mut(&source.topic) else {
            return Ok(());
        };

        sub.receivers -= 1;
        if sub.receivers == 0 {
            manager.connection.unsubscribe(&source.topic).await?;
            manager.subscriptions.remove(&source.topic);
            info!(broker = %source.url, topic = %source.topic, "unsubscribed");
        }
        if manager.subscriptions.is_empty() {
            manager.connection.disconnect().await?;
            state.managers.remove(&source.url);
            info!(broker = %source.url, "disconnected");
        }
        Ok(())
    }

    async fn dispatch(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected { broker_url } => {
                crate::metrics::BROKER_RECONNECTS
                    .with_label_values(&[broker_url.as_str()])
                    .inc();
                let state = self.state.lock().await;
                let Some(manager) = state.managers.get(&broker_url) else {
                    return;
                };
                for (topic, sub) in &manager.subscriptions {
                    match manager.connection.subscribe(topic, sub.qos).await {
                        Ok(()) => info!(broker = %broker_url, %topic, "resubscribed"),
                        Err(e) => {
                            error!(broker = %broker_url, %topic, error = %e,
                                "resubscribe failed")
                        }
                    }
                }
            }
            BrokerEvent::Message { broker_url, topic, payload } => {
                self.handle_message(&broker_url, &topic, &payload).await;
            }
        }
    }

    /// Decode, match and submit one inbound message. Errors never
    /// propagate upward: offending records are logged and dropped, and
    /// broker QoS alone governs redelivery.
    async fn handle_message(&self, broker_url: &str, topic: &str, payload: &[u8]) {
        let dropped = |reason: &str| {
            crate::metrics::RECORDS_DROPPED
                .with_label_values(&["mqtt", reason])
                .inc();
        };

        let records = match Pack::decode(payload).and_then(|p| p.normalize()) {
            Ok(records) => records,
            Err(e) => {
                dropped("malformed");
                warn!(code = 400, %topic, error = %e, "dropping undecodable message");
                return;
            }
        };

        let mut data: HashMap<String, Vec<Record>> = HashMap::new();
        let mut streams: HashMap<String, Stream> = HashMap::new();
        for record in records {
            let Some(stream) = self.resolve(&record.name).await else {
                continue;
            };

            let Some(mqtt) = stream.source.mqtt() else {
                dropped("unwanted");
                warn!(code = 406, stream = %record.name,
                    "ignoring message for stream without an mqtt source");
                continue;
            };
            if mqtt.url != broker_url {
                dropped("unwanted");
                warn!(code = 406, stream = %record.name, broker = %broker_url,
                    "ignoring message from unwanted broker");
                continue;
            }
            if mqtt.topic != topic {
                dropped("unwanted");
                warn!(code = 406, stream = %record.name, %topic,
                    "ignoring message with unwanted topic");
                continue;
            }

            if !stream.value_type.matches(&record) {
                dropped("type-mismatch");
                warn!(code = 400, stream = %record.name, expected = %stream.value_type,
                    "value is empty or does not match the registered type");
                continue;
            }

            data.entry(stream.id.clone()).or_default().push(record);
            streams.entry(stream.id.clone()).or_insert(stream);
        }

        if data.is_empty() {
            return;
        }
        let record_count: usize = data.values().map(Vec::len).sum();
        match self.storage.submit(data, streams).await {
            Ok(()) => {
                crate::metrics::RECORDS_INGESTED
                    .with_label_values(&["mqtt"])
                    .inc_by(record_count as f64);
                debug!(code = 202, %topic, "message stored");
            }
            Err(e) => error!(code = 500, %topic, error = %e, "error writing message records"),
        }
    }

    /// Resolve a record name to a stream via the snapshot cache, falling
    /// back to the registry. Lookup failures drop the record.
    async fn resolve(&self, name: &str) -> Option<Stream> {
        {
            let state = self.state.lock().await;
            if let Some(stream) = state.cache.get(name) {
                return Some(stream.clone());
            }
        }
        let Some(registry) = self.registry() else {
            error!(code = 500, stream = %name, "connector has no registry yet");
            return None;
        };
        match registry.get_by_name(name).await {
            Ok(stream) => {
                let mut state = self.state.lock().await;
                state.cache.insert(name.to_string(), stream.clone());
                Some(stream)
            }
            Err(e) if e.is_not_found() => {
                crate::metrics::RECORDS_DROPPED
                    .with_label_values(&["mqtt", "unknown-stream"])
                    .inc();
                warn!(code = 404, stream = %name, "record for unknown stream");
                None
            }
            Err(e) => {
                error!(code = 500, stream = %name, error = %e, "stream lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl EventListener for MqttConnector {
    fn name(&self) -> &'static str {
        "mqtt-connector"
    }

    async fn on_create(&self, stream: &Stream) -> Result<()> {
        let Some(source) = stream.source.mqtt() else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        // an unreachable broker must not veto the creation: record the
        // source and let the retry task establish the subscription
        if let Err(e) = self.register(&mut state, source).await {
            warn!(stream = %stream.name, error = %e,
                "subscription setup failed, will retry");
            state.failed.insert(stream.name.clone(), source.clone());
        }
        Ok(())
    }

    async fn on_update(&self, old: &Stream, new: &Stream) -> Result<()> {
        let mut state = self.state.lock().await;

        // retention feeds the storage adapter's write path through the
        // cached snapshots, so a change invalidates all of them
        if old.retention != new.retention {
            state.cache.clear();
        }

        if old.source != new.source {
            if let Some(source) = old.source.mqtt() {
                self.unregister(&mut state, source).await.map_err(|e| {
                    Error::Unavailable(format!("error removing subscription: {e}"))
                })?;
            }
            state.failed.remove(&old.name);
            if let Some(source) = new.source.mqtt() {
                if let Err(e) = self.register(&mut state, source).await {
                    warn!(stream = %new.name, error = %e,
                        "subscription setup failed, will retry");
                    state.failed.insert(new.name.clone(), source.clone());
                }
            }
        }
        Ok(())
    }

    async fn on_delete(&self, stream: &Stream) -> Result<()> {
        let mut state = self.state.lock().await;
        state.cache.remove(&stream.name);
        if let Some(source) = stream.source.mqtt() {
            self.unregister(&mut state, source).await.map_err(|e| {
                Error::Unavailable(format!("error removing subscription: {e}"))
            })?;
            state.failed.remove(&stream.name);
        }
        Ok(())
    }
}

// ============================================================================
// rumqttc-backed broker client
// ============================================================================

/// Production broker client over rumqttc
#[derive(Default)]
pub struct MqttBrokerClient;

impl MqttBrokerClient {
    /// Create the client factory
    pub fn new() -> Self {
        Self
    }
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

struct MqttConnection {
    client: AsyncClient,
    session: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    async fn subscribe(&self, topic: &str, qos: u8) -> Result<()> {
        self.client
            .subscribe(topic, to_qos(qos))
            .await
            .map_err(|e| Error::Unavailable(format!("subscribe failed: {e}")))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| Error::Unavailable(format!("unsubscribe failed: {e}")))
    }

    async fn disconnect(&self) -> Result<()> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| Error::Unavailable(format!("disconnect failed: {e}")));
        tokio::time::sleep(DISCONNECT_GRACE).await;
        self.session.abort();
        result
    }
}

#[async_trait]
impl BrokerClient for MqttBrokerClient {
    async fn connect(
        &self,
        opts: ConnectOptions,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Result<Box<dyn BrokerConnection>> {
        let url = Url::parse(&opts.broker_url)
            .map_err(|e| Error::BadRequest(format!("invalid broker url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::BadRequest("broker url must include a host".into()))?;
        let port = url.port().unwrap_or(1883);

        let mut mqtt_opts = MqttOptions::new(opts.client_id.clone(), host, port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        if let Some(user) = &opts.username {
            mqtt_opts.set_credentials(user.clone(), opts.password.as_deref().unwrap_or_default());
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_opts, 64);

        // connect synchronously: poll until the first ConnAck or failure
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => continue,
                Err(e) => {
                    return Err(Error::Unavailable(format!(
                        "error connecting to broker {}: {e}",
                        opts.broker_url
                    )))
                }
            }
        }
        let _ = events
            .send(BrokerEvent::Connected { broker_url: opts.broker_url.clone() })
            .await;

        let broker_url = opts.broker_url.clone();
        let session = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(broker = %broker_url, "reconnected");
                        if events
                            .send(BrokerEvent::Connected { broker_url: broker_url.clone() })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if events
                            .send(BrokerEvent::Message {
                                broker_url: broker_url.clone(),
                                topic: publish.topic.clone(),
                                payload: publish.payload.to_vec(),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(broker = %broker_url, error = %e,
                            "broker connection lost, reconnecting");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Box::new(MqttConnection { client, session }))
    }
}
