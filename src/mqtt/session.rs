use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerSettings, ConnectOptions, LastWill, SessionTiming};
use super::message::{MqttMessage, Payload, Topics, PRESENCE_CONNECTED, PRESENCE_DISCONNECTED};
use super::registry::{Handler, SubscriptionRegistry};
use super::transport::{LinkState, Transport, TransportError};

/// Progress reported while a connect attempt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connecting,
    Connected,
    Failed,
}

enum ConnectWait {
    Connected,
    Refused,
    TimedOut,
    Cancelled,
}

/// Owns the transport and the subscription registry.
///
/// Every method runs on the control loop. The transport's dispatch task only
/// reaches the session through [`LinkState`] and the inbound queue, which is
/// drained by [`SessionManager::take_deliveries`].
pub struct SessionManager {
    broker: BrokerSettings,
    timing: SessionTiming,
    topics: Topics,
    transport: Box<dyn Transport>,
    link: Arc<LinkState>,
    registry: SubscriptionRegistry,
    inbound_tx: mpsc::UnboundedSender<MqttMessage>,
    inbound_rx: mpsc::UnboundedReceiver<MqttMessage>,
    connected: bool,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        broker: BrokerSettings,
        timing: SessionTiming,
        topics: Topics,
        transport: Box<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            broker,
            timing,
            topics,
            transport,
            link: Arc::new(LinkState::new()),
            registry: SubscriptionRegistry::new(),
            inbound_tx,
            inbound_rx,
            connected: false,
            shutdown,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn timing(&self) -> &SessionTiming {
        &self.timing
    }

    pub fn client_id(&self) -> &str {
        self.topics.client_id()
    }

    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.broker.host, self.broker.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.registry.is_subscribed(topic)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            client_id: self.topics.client_id().to_string(),
            host: self.broker.host.clone(),
            port: self.broker.port,
            credentials: self.broker.credentials.clone(),
            keep_alive: self.broker.keep_alive,
            last_will: Some(LastWill {
                topic: self.topics.presence(),
                payload: PRESENCE_DISCONNECTED.to_string(),
            }),
        }
    }

    pub async fn connect(&mut self) -> bool {
        self.connect_with_progress(&mut |_| {}).await
    }

    /// Opens a fresh connection. A no-op success while already connected.
    ///
    /// Never fails hard: a refused, timed out or cancelled attempt is logged,
    /// reported as [`ConnectProgress::Failed`] and leaves the session disconnected.
    pub async fn connect_with_progress(
        &mut self,
        progress: &mut dyn FnMut(ConnectProgress),
    ) -> bool {
        if self.connected {
            debug!("Connect requested while already connected");
            return true;
        }

        progress(ConnectProgress::Connecting);
        let options = self.connect_options();
        self.link.disarm_disconnect_hook();
        let generation = self.link.begin_attempt();
        info!(
            "Connecting to {} as {}",
            options.broker_address(),
            options.client_id
        );

        if let Err(e) = self.transport.start(
            &options,
            Arc::clone(&self.link),
            generation,
            self.inbound_tx.clone(),
        ) {
            error!(
                "Could not start transport for {} as {}: {}",
                options.broker_address(),
                options.client_id,
                e
            );
            progress(ConnectProgress::Failed);
            return false;
        }

        match self.await_connack().await {
            ConnectWait::Connected => {}
            outcome => {
                match outcome {
                    ConnectWait::Refused => error!(
                        "Broker {} refused client {}",
                        options.broker_address(),
                        options.client_id
                    ),
                    ConnectWait::TimedOut => error!(
                        "Connecting to {} as {} timed out after {:?}",
                        options.broker_address(),
                        options.client_id,
                        self.timing.connect_timeout
                    ),
                    _ => info!("Connect to {} cancelled", options.broker_address()),
                }
                self.transport.stop();
                self.link.invalidate();
                progress(ConnectProgress::Failed);
                return false;
            }
        }

        self.connected = true;
        self.link.take_reconnect();
        self.link.touch(Instant::now());
        if let Err(e) = self
            .transport
            .publish(&self.topics.presence(), PRESENCE_CONNECTED.to_string())
        {
            warn!("Could not announce presence: {}", e);
        }
        self.link.arm_disconnect_hook();
        info!("Connected to {} as {}", options.broker_address(), options.client_id);
        progress(ConnectProgress::Connected);
        true
    }

    async fn await_connack(&self) -> ConnectWait {
        let deadline = Instant::now() + self.timing.connect_timeout;
        loop {
            if self.link.is_connected() {
                return ConnectWait::Connected;
            }
            if self.link.has_failed() {
                return ConnectWait::Refused;
            }
            if Instant::now() >= deadline {
                return ConnectWait::TimedOut;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return ConnectWait::Cancelled,
                _ = sleep(self.timing.connect_poll) => {}
            }
        }
    }

    /// Deliberate disconnect. Retained topics stay registered for the next replay.
    pub fn disconnect(&mut self) {
        self.link.disarm_disconnect_hook();
        if self.link.is_connected() {
            if let Err(e) = self
                .transport
                .publish(&self.topics.presence(), PRESENCE_DISCONNECTED.to_string())
            {
                debug!("Could not announce departure: {}", e);
            }
        }
        self.unsubscribe_all();
        self.transport.stop();
        self.link.invalidate();
        self.connected = false;
        info!("Disconnected from {}", self.broker_address());
    }

    pub fn subscribe<T: AsRef<str>>(&mut self, topics: &[T], handler: Handler, retain: bool) {
        for topic in topics {
            let topic = topic.as_ref();
            if self.registry.is_subscribed(topic) {
                warn!("Already subscribed to {}", topic);
                continue;
            }
            if retain {
                self.registry.retain(topic, handler);
            }
            if !self.link.is_connected() {
                debug!("Not connected, deferring subscribe to {}", topic);
                continue;
            }
            match self.transport.subscribe(topic) {
                Ok(()) => {
                    self.registry.insert(topic, handler);
                    debug!("Subscribed to {}", topic);
                }
                Err(e) => warn!(
                    "Subscribe to {} on {} failed: {}",
                    topic,
                    self.broker_address(),
                    e
                ),
            }
        }
    }

    pub fn unsubscribe<T: AsRef<str>>(&mut self, topics: &[T]) {
        for topic in topics {
            let topic = topic.as_ref();
            if !self.registry.remove(topic) {
                warn!("Not subscribed to {}", topic);
                continue;
            }
            self.transport_unsubscribe(topic);
        }
    }

    /// Drops every active subscription. Retained flags survive.
    pub fn unsubscribe_all(&mut self) {
        for topic in self.registry.clear_active() {
            self.transport_unsubscribe(&topic);
        }
    }

    fn transport_unsubscribe(&mut self, topic: &str) {
        if !self.link.is_connected() {
            return;
        }
        match self.transport.unsubscribe(topic) {
            Ok(()) => debug!("Unsubscribed from {}", topic),
            Err(e) => warn!("Unsubscribe from {} failed: {}", topic, e),
        }
    }

    /// Subscribes every retained topic that is not currently active.
    pub fn replay_retained(&mut self) -> usize {
        let mut replayed = 0;
        for (topic, handler) in self.registry.retained() {
            if self.registry.is_subscribed(&topic) {
                continue;
            }
            self.subscribe(&[topic.as_str()], handler, false);
            if self.registry.is_subscribed(&topic) {
                replayed += 1;
            }
        }
        info!("Replayed {} retained subscriptions", replayed);
        replayed
    }

    pub fn publish(&mut self, topic: &str, payload: impl Into<Payload>) -> Result<(), TransportError> {
        if !self.link.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let encoded = payload.into().encode();
        self.transport.publish(topic, encoded).map_err(|e| {
            warn!(
                "Publish to {} on {} as {} failed: {}",
                topic,
                self.broker_address(),
                self.client_id(),
                e
            );
            e
        })
    }

    /// Watchdog, called once per tick.
    pub fn update(&mut self, now: Instant) {
        if !self.connected {
            return;
        }
        if !self.link.is_connected() || self.link.reconnect_pending() {
            warn!("Lost connection to {}", self.broker_address());
            self.connected = false;
            self.link.request_reconnect();
            return;
        }
        if let Some(window) = self.timing.watchdog_silence {
            let silent = now.saturating_duration_since(self.link.last_traffic());
            if silent >= window {
                warn!(
                    "No traffic from {} for {}s, forcing reconnect",
                    self.broker_address(),
                    silent.as_secs()
                );
                self.connected = false;
                self.link.request_reconnect();
            }
        }
    }

    pub fn reconnect_pending(&self) -> bool {
        self.link.reconnect_pending()
    }

    pub fn request_reconnect(&self) {
        info!("Reconnect requested");
        self.link.request_reconnect();
    }

    /// Clears the pending flag; returns whether a reconnect was requested.
    pub fn take_reconnect(&self) -> bool {
        self.link.take_reconnect()
    }

    /// Drains the inbound queue, pairing each message with its registered handler.
    pub fn take_deliveries(&mut self) -> Vec<(Handler, MqttMessage)> {
        let mut deliveries = Vec::new();
        while let Ok(message) = self.inbound_rx.try_recv() {
            match self.registry.lookup(&message.topic) {
                Some(handler) => deliveries.push((handler, message)),
                None => debug!("Dropping message on unsubscribed topic {}", message.topic),
            }
        }
        deliveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::mock::{Call, ConnectOutcome, MockTransport};
    use crate::windows::WindowId;
    use std::time::Duration;

    fn session(mock: &MockTransport) -> SessionManager {
        SessionManager::new(
            BrokerSettings::default(),
            SessionTiming::default(),
            Topics::new("miniplayer", "0xabc"),
            Box::new(mock.clone()),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connect_announces_presence() {
        let mock = MockTransport::new();
        let mut session = session(&mock);

        let mut reported = Vec::new();
        assert!(session.connect_with_progress(&mut |p| reported.push(p)).await);
        assert!(session.is_connected());
        assert_eq!(
            reported,
            vec![ConnectProgress::Connecting, ConnectProgress::Connected]
        );
        assert_eq!(
            mock.published_to("miniplayer/connection/0xabc"),
            vec!["connected".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connected_is_a_noop() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        assert!(session.connect().await);
        assert!(session.connect().await);
        assert_eq!(mock.starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connect_returns_before_timeout() {
        let mock = MockTransport::scripted(&[ConnectOutcome::Refuse]);
        let mut session = session(&mock);
        let started = Instant::now();
        assert!(!session.connect().await);
        assert!(!session.is_connected());
        assert!(Instant::now() - started < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_times_out() {
        let mock = MockTransport::scripted(&[ConnectOutcome::Silent]);
        let mut session = session(&mock);
        let started = Instant::now();
        assert!(!session.connect().await);
        let waited = Instant::now() - started;
        assert!(waited >= Duration::from_secs(10));
        assert!(waited < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_connect_wait() {
        let mock = MockTransport::scripted(&[ConnectOutcome::Silent]);
        let mut session = session(&mock);
        let token = session.shutdown_token().clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let started = Instant::now();
        assert!(!session.connect().await);
        assert!(Instant::now() - started < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_subscribe_delivers_once() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.connect().await;

        let handler = Handler::Window(WindowId(0));
        session.subscribe(&["miniplayer/spotify/response"], handler, false);
        session.subscribe(&["miniplayer/spotify/response"], handler, false);
        assert_eq!(mock.subscribed(), vec!["miniplayer/spotify/response".to_string()]);

        mock.deliver("miniplayer/spotify/response", "{}");
        let deliveries = session.take_deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, handler);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_unsubscribe_is_ignored() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.connect().await;
        session.unsubscribe(&["never/subscribed"]);
        assert!(!mock
            .calls()
            .iter()
            .any(|call| matches!(call, Call::Unsubscribe(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_keeps_retained_and_skips_reconnect() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.connect().await;
        session.subscribe(&["miniplayer/window"], Handler::Navigation, true);
        session.subscribe(&["miniplayer/weather/local/response"], Handler::Window(WindowId(0)), false);

        session.disconnect();
        assert!(!session.is_connected());
        assert!(!session.reconnect_pending());
        assert!(session.registry().is_empty());
        assert!(session.registry().is_retained("miniplayer/window"));
        assert_eq!(
            mock.published_to("miniplayer/connection/0xabc"),
            vec!["connected".to_string(), "disconnected".to_string()]
        );
        let unsubscribed = mock
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Unsubscribe(_)))
            .count();
        assert_eq!(unsubscribed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_subscribes_only_retained_topics() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.connect().await;
        session.subscribe(&["a", "b"], Handler::Navigation, true);
        session.subscribe(&["c"], Handler::Window(WindowId(2)), false);
        session.disconnect();

        assert!(session.connect().await);
        mock.clear_calls();
        assert_eq!(session.replay_retained(), 2);
        assert_eq!(mock.subscribed(), vec!["a".to_string(), "b".to_string()]);
        assert!(!session.is_subscribed("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_disconnected_is_deferred() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.subscribe(&["miniplayer/window"], Handler::Navigation, true);
        assert!(mock.subscribed().is_empty());
        assert!(!session.is_subscribed("miniplayer/window"));

        session.connect().await;
        session.replay_retained();
        assert!(session.is_subscribed("miniplayer/window"));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_normalizes_text_payloads() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        assert!(matches!(
            session.publish("x", "y"),
            Err(TransportError::NotConnected)
        ));
        session.connect().await;
        session.publish("miniplayer/spotify/action", "{'skip': 0}").unwrap();
        assert_eq!(
            mock.published_to("miniplayer/spotify/action"),
            vec!["{\"skip\": 0}".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_fires_after_silence() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.connect().await;

        tokio::time::advance(Duration::from_secs(600)).await;
        mock.deliver("miniplayer/window", "music");
        session.update(Instant::now());
        assert!(session.is_connected());

        tokio::time::advance(Duration::from_secs(899)).await;
        session.update(Instant::now());
        assert!(session.is_connected());

        tokio::time::advance(Duration::from_secs(1)).await;
        session.update(Instant::now());
        assert!(!session.is_connected());
        assert!(session.reconnect_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_watchdog_never_fires() {
        let mock = MockTransport::new();
        let mut session = SessionManager::new(
            BrokerSettings::default(),
            SessionTiming {
                watchdog_silence: None,
                ..SessionTiming::default()
            },
            Topics::new("miniplayer", "0xabc"),
            Box::new(mock.clone()),
            CancellationToken::new(),
        );
        session.connect().await;
        tokio::time::advance(Duration::from_secs(86_400)).await;
        session.update(Instant::now());
        assert!(session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_is_noticed_on_next_update() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        session.connect().await;
        mock.drop_link();
        assert!(session.reconnect_pending());
        session.update(Instant::now());
        assert!(!session.is_connected());
        assert!(session.take_reconnect());
    }
}
