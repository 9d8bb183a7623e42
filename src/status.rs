//! Transient, colour-coded status line shown at the bottom of the screen.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_STATUS_DURATION: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTone {
    Success,
    Progress,
    Info,
    Error,
}

impl StatusTone {
    pub fn rgb(self) -> (u8, u8, u8) {
        match self {
            StatusTone::Success => (24, 216, 97),
            StatusTone::Progress => (200, 140, 0),
            StatusTone::Info => (3, 140, 252),
            StatusTone::Error => (251, 105, 98),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub text: String,
    pub tone: StatusTone,
    pub expires_at: Instant,
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (r, g, b) = self.tone.rgb();
        write!(f, "\x1b[38;2;{};{};{}m{}\x1b[0m", r, g, b, self.text)
    }
}

/// Holds at most one status message.
///
/// A regular post only lands when nothing is showing or the current message
/// has expired; [`StatusBoard::force`] always replaces.
#[derive(Debug, Default)]
pub struct StatusBoard {
    current: Option<StatusMessage>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, text: impl Into<String>, tone: StatusTone, now: Instant) -> bool {
        self.post_for(text, tone, DEFAULT_STATUS_DURATION, now)
    }

    pub fn post_for(
        &mut self,
        text: impl Into<String>,
        tone: StatusTone,
        duration: Duration,
        now: Instant,
    ) -> bool {
        if self.current(now).is_some() {
            return false;
        }
        self.force(text, tone, duration, now);
        true
    }

    pub fn force(
        &mut self,
        text: impl Into<String>,
        tone: StatusTone,
        duration: Duration,
        now: Instant,
    ) {
        let text = text.into();
        debug!("Status: {}", text);
        self.current = Some(StatusMessage {
            text,
            tone,
            expires_at: now + duration,
        });
    }

    /// The message still on screen at `now`, if any.
    pub fn current(&self, now: Instant) -> Option<&StatusMessage> {
        self.current.as_ref().filter(|message| now < message.expires_at)
    }

    pub fn expire(&mut self, now: Instant) {
        if self.current(now).is_none() {
            self.current = None;
        }
    }
}
