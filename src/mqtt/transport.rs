//! Transport adapter around the MQTT client library.
//!
//! The background dispatch task owned by a transport only ever touches the
//! [`LinkState`] atomics and the inbound queue. It never publishes, never
//! subscribes and never reconnects; all of that happens on the control loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ConnectOptions;
use super::message::MqttMessage;

/// Grace period between a deliberate disconnect and tearing down the event loop,
/// long enough for the outgoing DISCONNECT packet to be flushed.
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport has no active client")]
    NotStarted,

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Flags shared between the control loop and the transport's dispatch task.
///
/// Every write coming from a dispatch task carries the generation it was
/// started with; writes from a superseded connection are dropped.
#[derive(Debug)]
pub struct LinkState {
    generation: AtomicU64,
    connected: AtomicBool,
    failed: AtomicBool,
    disconnect_hook: AtomicBool,
    reconnect_pending: AtomicBool,
    epoch: Instant,
    last_traffic_ms: AtomicU64,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            disconnect_hook: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            epoch: Instant::now(),
            last_traffic_ms: AtomicU64::new(0),
        }
    }

    /// Starts a new connection attempt and returns its generation.
    pub fn begin_attempt(&self) -> u64 {
        self.invalidate()
    }

    /// Orphans whatever dispatch task is still running and clears the link flags.
    pub fn invalidate(&self) -> u64 {
        self.connected.store(false, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn mark_connected(&self, generation: u64, now: Instant) {
        if self.is_current(generation) {
            self.failed.store(false, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            self.touch(now);
        }
    }

    /// The attempt ended before the broker acknowledged it.
    pub fn mark_failed(&self, generation: u64) {
        if self.is_current(generation) {
            self.connected.store(false, Ordering::SeqCst);
            self.failed.store(true, Ordering::SeqCst);
        }
    }

    /// An established link went away. Only flags a reconnect when the
    /// disconnect hook is armed.
    pub fn mark_lost(&self, generation: u64) {
        if self.is_current(generation) {
            self.connected.store(false, Ordering::SeqCst);
            if self.disconnect_hook.load(Ordering::SeqCst) {
                self.reconnect_pending.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn arm_disconnect_hook(&self) {
        self.disconnect_hook.store(true, Ordering::SeqCst);
    }

    pub fn disarm_disconnect_hook(&self) {
        self.disconnect_hook.store(false, Ordering::SeqCst);
    }

    pub fn request_reconnect(&self) {
        self.reconnect_pending.store(true, Ordering::SeqCst);
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending.load(Ordering::SeqCst)
    }

    /// Clears the pending flag, returning whether it was set.
    pub fn take_reconnect(&self) -> bool {
        self.reconnect_pending.swap(false, Ordering::SeqCst)
    }

    pub fn touch(&self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_traffic_ms.store(elapsed, Ordering::SeqCst);
    }

    pub fn last_traffic(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_traffic_ms.load(Ordering::SeqCst))
    }
}

/// Leaf adapter over a publish/subscribe client.
///
/// Requests are non-blocking: they are queued with the client and the
/// outcome of the connection is reported through [`LinkState`].
pub trait Transport: Send {
    /// Drops any previous client and starts a fresh one with background dispatch.
    fn start(
        &mut self,
        options: &ConnectOptions,
        link: Arc<LinkState>,
        generation: u64,
        inbound: mpsc::UnboundedSender<MqttMessage>,
    ) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, payload: String) -> Result<(), TransportError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Closes the connection, best effort.
    fn stop(&mut self);
}

/// [`Transport`] backed by `rumqttc`'s async client.
pub struct RumqttTransport {
    client: Option<AsyncClient>,
    dispatch: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    retiring: Option<CancellationToken>,
    qos: QoS,
    capacity: usize,
}

impl Default for RumqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self {
            client: None,
            dispatch: None,
            cancel: None,
            retiring: None,
            qos: QoS::AtMostOnce,
            capacity: 100,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client.as_ref().ok_or(TransportError::NotStarted)
    }

    fn teardown_now(&mut self) {
        if let Some(token) = self.retiring.take() {
            token.cancel();
        }
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        if let Some(handle) = self.dispatch.take() {
            handle.abort();
        }
        self.client = None;
    }
}

impl Transport for RumqttTransport {
    fn start(
        &mut self,
        options: &ConnectOptions,
        link: Arc<LinkState>,
        generation: u64,
        inbound: mpsc::UnboundedSender<MqttMessage>,
    ) -> Result<(), TransportError> {
        self.teardown_now();

        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options
            .set_keep_alive(options.keep_alive.max(Duration::from_secs(5)))
            .set_clean_session(true);
        if let Some(credentials) = &options.credentials {
            mqtt_options.set_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }
        if let Some(will) = &options.last_will {
            mqtt_options.set_last_will(rumqttc::LastWill::new(
                will.topic.clone(),
                will.payload.clone().into_bytes(),
                self.qos,
                false,
            ));
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, self.capacity);
        let cancel = CancellationToken::new();
        let broker = options.broker_address();
        let dispatch = tokio::spawn(run_dispatch(
            event_loop,
            link,
            generation,
            inbound,
            cancel.clone(),
            broker,
        ));

        debug!("Started transport for {}", options.broker_address());
        self.client = Some(client);
        self.cancel = Some(cancel);
        self.dispatch = Some(dispatch);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: String) -> Result<(), TransportError> {
        let qos = self.qos;
        self.client()?
            .try_publish(topic, qos, false, payload.into_bytes())?;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let qos = self.qos;
        self.client()?.try_subscribe(topic, qos)?;
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?.try_unsubscribe(topic)?;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }
        self.dispatch = None;
        if let Some(token) = self.cancel.take() {
            self.retiring = Some(token.clone());
            tokio::spawn(async move {
                tokio::time::sleep(STOP_GRACE).await;
                token.cancel();
            });
        }
    }
}

async fn run_dispatch(
    mut event_loop: rumqttc::EventLoop,
    link: Arc<LinkState>,
    generation: u64,
    inbound: mpsc::UnboundedSender<MqttMessage>,
    cancel: CancellationToken,
    broker: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Dispatch for {} cancelled", broker);
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Broker {} acknowledged connection", broker);
                    link.mark_connected(generation, Instant::now());
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    link.touch(Instant::now());
                    let message = MqttMessage::from_bytes(publish.topic, &publish.payload);
                    if inbound.send(message).is_err() {
                        warn!("Inbound queue closed, stopping dispatch");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker {} closed the connection", broker);
                    link.mark_lost(generation);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if link.is_connected() {
                        warn!("Connection to {} lost: {}", broker, e);
                        link.mark_lost(generation);
                    } else {
                        error!("Connection to {} failed: {}", broker, e);
                        link.mark_failed(generation);
                    }
                    break;
                }
            }
        }
    }
}
