//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::config::ConnectOptions;
use super::message::MqttMessage;
use super::transport::{LinkState, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
    /// The broker never answers; the connect wait runs into its timeout.
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(String),
    Publish(String, String),
    Subscribe(String),
    Unsubscribe(String),
    Stop,
}

#[derive(Default)]
struct Shared {
    calls: Vec<Call>,
    outcomes: VecDeque<ConnectOutcome>,
    link: Option<(Arc<LinkState>, u64)>,
    inbound: Option<mpsc::UnboundedSender<MqttMessage>>,
}

/// Transport whose connect outcomes are scripted up front. Once the script
/// runs out every further attempt is accepted.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(outcomes: &[ConnectOutcome]) -> Self {
        let mock = Self::new();
        mock.lock().outcomes.extend(outcomes.iter().copied());
        mock
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Subscribe(topic) => Some(topic),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish(topic, payload) => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn starts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Start(_)))
            .count()
    }

    /// Simulates a broker delivery through the dispatch path.
    pub fn deliver(&self, topic: &str, payload: &str) {
        let shared = self.lock();
        if let Some((link, _)) = &shared.link {
            link.touch(Instant::now());
        }
        if let Some(inbound) = &shared.inbound {
            let _ = inbound.send(MqttMessage::from_topic(topic, payload));
        }
    }

    /// Simulates the broker dropping an established link.
    pub fn drop_link(&self) {
        let shared = self.lock();
        if let Some((link, generation)) = &shared.link {
            link.mark_lost(*generation);
        }
    }
}

impl Transport for MockTransport {
    fn start(
        &mut self,
        options: &ConnectOptions,
        link: Arc<LinkState>,
        generation: u64,
        inbound: mpsc::UnboundedSender<MqttMessage>,
    ) -> Result<(), TransportError> {
        let mut shared = self.lock();
        shared.calls.push(Call::Start(options.client_id.clone()));
        let outcome = shared.outcomes.pop_front().unwrap_or(ConnectOutcome::Accept);
        match outcome {
            ConnectOutcome::Accept => link.mark_connected(generation, Instant::now()),
            ConnectOutcome::Refuse => link.mark_failed(generation),
            ConnectOutcome::Silent => {}
        }
        shared.link = Some((link, generation));
        shared.inbound = Some(inbound);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: String) -> Result<(), TransportError> {
        self.lock()
            .calls
            .push(Call::Publish(topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.lock().calls.push(Call::Subscribe(topic.to_string()));
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.lock().calls.push(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }

    fn stop(&mut self) {
        let mut shared = self.lock();
        shared.calls.push(Call::Stop);
        shared.link = None;
        shared.inbound = None;
    }
}
