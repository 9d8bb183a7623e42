use std::fmt;
use std::time::Duration;

/// Username/password pair handed to the broker on connect.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Message the broker publishes on our behalf when the link drops uncleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
}

/// Everything the transport needs to open one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub last_will: Option<LastWill>,
}

impl ConnectOptions {
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Broker parameters injected into the session manager at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "homeassistant.local".to_string(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(5),
        }
    }
}

/// Timing parameters for the session manager.
///
/// `retry_base` doubles after every failed reconnect attempt until it reaches
/// `retry_cap`. With the defaults (9s, 1800s) the sequence lands on the cap
/// after eight doublings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTiming {
    pub connect_timeout: Duration,
    pub connect_poll: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// `None` disables the traffic watchdog.
    pub watchdog_silence: Option<Duration>,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_poll: Duration::from_millis(250),
            retry_base: Duration::from_secs(9),
            retry_cap: Duration::from_secs(1800),
            watchdog_silence: Some(Duration::from_millis(900_000)),
        }
    }
}
