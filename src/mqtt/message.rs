use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// One inbound delivery, stamped with the local time it was taken off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(32).collect();
        write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
    }
}

impl MqttMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn from_bytes(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::from_topic(topic, String::from_utf8_lossy(payload).into_owned())
    }

    /// Decodes the payload as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Outbound payload.
///
/// Structured data goes out as compact JSON. Free text is sent verbatim apart
/// from single quotes, which are rewritten to double quotes so that dict-like
/// strings assembled by hand still parse as JSON on the other side.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
}

impl Payload {
    pub fn encode(&self) -> String {
        match self {
            Payload::Text(text) => normalize_quotes(text),
            Payload::Json(value) => value.to_string(),
        }
    }
}

pub fn normalize_quotes(text: &str) -> String {
    text.replace('\'', "\"")
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<bool> for Payload {
    fn from(flag: bool) -> Self {
        Payload::Json(Value::Bool(flag))
    }
}

impl From<i64> for Payload {
    fn from(number: i64) -> Self {
        Payload::Json(Value::from(number))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Builds topics following `<namespace>/<domain>/<purpose>[/<client id>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
    client_id: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into().trim_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Presence topic carrying `connected` / `disconnected`.
    pub fn presence(&self) -> String {
        format!("{}/connection/{}", self.namespace, self.client_id)
    }

    /// Remote window selection.
    pub fn window_change(&self) -> String {
        format!("{}/window", self.namespace)
    }

    pub fn domain(&self, domain: &str, purpose: &str) -> String {
        format!("{}/{}/{}", self.namespace, domain, purpose)
    }

    /// Per-client activity flag for a domain, e.g. `miniplayer/spotify/active/<id>`.
    pub fn active(&self, domain: &str) -> String {
        format!("{}/{}/active/{}", self.namespace, domain, self.client_id)
    }
}

pub const PRESENCE_CONNECTED: &str = "connected";
pub const PRESENCE_DISCONNECTED: &str = "disconnected";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_payload_normalizes_single_quotes() {
        let payload = Payload::from("{'skip': 0}");
        assert_eq!(payload.encode(), "{\"skip\": 0}");
    }

    #[test]
    fn scalar_payloads_are_bare() {
        assert_eq!(Payload::from("connected").encode(), "connected");
        assert_eq!(Payload::from(true).encode(), "true");
        assert_eq!(Payload::from(55i64).encode(), "55");
    }

    #[test]
    fn json_payload_keeps_apostrophes_inside_strings() {
        let payload = Payload::from(json!({ "name": "Don't Stop" }));
        let decoded: Value = serde_json::from_str(&payload.encode()).unwrap();
        assert_eq!(decoded["name"], "Don't Stop");
    }

    #[test]
    fn topics_follow_namespace_convention() {
        let topics = Topics::new("/miniplayer/", "0xb827eb000001");
        assert_eq!(topics.presence(), "miniplayer/connection/0xb827eb000001");
        assert_eq!(topics.active("spotify"), "miniplayer/spotify/active/0xb827eb000001");
        assert_eq!(topics.domain("spotify", "action"), "miniplayer/spotify/action");
        assert_eq!(topics.window_change(), "miniplayer/window");
    }

    #[test]
    fn malformed_json_is_reported() {
        let message = MqttMessage::from_topic("miniplayer/weather/local/response", "{not json");
        assert!(message.json::<Value>().is_err());
    }
}
