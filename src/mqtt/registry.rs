use std::collections::HashMap;

use crate::windows::WindowId;

/// Who receives deliveries for a subscribed topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    Window(WindowId),
    /// Remote window selection, handled by the control loop itself.
    Navigation,
}

/// Topic to handler map plus the set of topics replayed after a reconnect.
///
/// Only the control loop mutates or reads the registry.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    active: HashMap<String, Handler>,
    retained: HashMap<String, Handler>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an active subscription. Returns `false` if the topic is already subscribed.
    pub fn insert(&mut self, topic: &str, handler: Handler) -> bool {
        if self.active.contains_key(topic) {
            return false;
        }
        self.active.insert(topic.to_string(), handler);
        true
    }

    pub fn retain(&mut self, topic: &str, handler: Handler) {
        self.retained.insert(topic.to_string(), handler);
    }

    /// Drops the topic from both the active set and the retained set.
    /// Returns `false` if the registry never heard of it.
    pub fn remove(&mut self, topic: &str) -> bool {
        let active = self.active.remove(topic).is_some();
        let retained = self.retained.remove(topic).is_some();
        active || retained
    }

    /// Forgets every active subscription, keeping the retained set intact.
    pub fn clear_active(&mut self) -> Vec<String> {
        self.active.drain().map(|(topic, _)| topic).collect()
    }

    pub fn lookup(&self, topic: &str) -> Option<Handler> {
        self.active.get(topic).copied()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.active.contains_key(topic)
    }

    pub fn is_retained(&self, topic: &str) -> bool {
        self.retained.contains_key(topic)
    }

    pub fn retained(&self) -> Vec<(String, Handler)> {
        let mut entries: Vec<(String, Handler)> = self
            .retained
            .iter()
            .map(|(topic, handler)| (topic.clone(), *handler))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_keeps_first_handler() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.insert("miniplayer/window", Handler::Navigation));
        assert!(!registry.insert("miniplayer/window", Handler::Window(WindowId(1))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("miniplayer/window"), Some(Handler::Navigation));
    }

    #[test]
    fn remove_clears_retained_flag() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", Handler::Navigation);
        registry.retain("a", Handler::Navigation);
        assert!(registry.remove("a"));
        assert!(!registry.is_retained("a"));
        assert!(!registry.remove("a"));
    }

    #[test]
    fn clear_active_keeps_retained_topics() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a", Handler::Navigation);
        registry.retain("a", Handler::Navigation);
        registry.insert("b", Handler::Window(WindowId(0)));

        let mut cleared = registry.clear_active();
        cleared.sort();
        assert_eq!(cleared, vec!["a".to_string(), "b".to_string()]);
        assert!(registry.is_empty());
        assert_eq!(registry.retained(), vec![("a".to_string(), Handler::Navigation)]);
    }
}
