//! Optimistic remote commands.
//!
//! The bus has no request/response correlation. A command counts as done once
//! a later state broadcast shows its effect, judged by a predicate captured
//! when the command was sent. Broadcasts that do not show the effect leave the
//! command pending until its deadline.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::mqtt::transport::TransportError;

/// A command whose effect can be recognised in later state.
pub trait Confirmable {
    type State;

    /// Human readable name, e.g. `Skip` or `Volume +`.
    fn label(&self) -> String;

    fn is_confirmed_by(&self, state: &Self::State) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction<A> {
    pub action: A,
    pub issued_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutNotice {
    pub label: String,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Confirmed { label: String, elapsed: Duration },
    TimedOut { label: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{pending} is still awaiting confirmation")]
    AlreadyPending { pending: String },

    #[error("Could not send {label}: {source}")]
    Publish {
        label: String,
        #[source]
        source: TransportError,
    },
}

/// Tracks the single in-flight command of one window.
#[derive(Debug)]
pub struct ActionTracker<A> {
    timeout: Duration,
    notice_window: Duration,
    pending: Option<PendingAction<A>>,
    notice: Option<TimeoutNotice>,
    timed_out: bool,
}

impl<A: Confirmable> ActionTracker<A> {
    pub fn new(timeout: Duration, notice_window: Duration) -> Self {
        Self {
            timeout,
            notice_window,
            pending: None,
            notice: None,
            timed_out: false,
        }
    }

    /// Sends `action` through `publish` and starts waiting for its effect.
    ///
    /// Rejected without publishing while another action is pending. A failed
    /// publish records nothing.
    pub fn request_action<F>(&mut self, action: A, now: Instant, publish: F) -> Result<(), ActionError>
    where
        F: FnOnce(&A) -> Result<(), TransportError>,
    {
        if let Some(pending) = &self.pending {
            let pending = pending.action.label();
            warn!("Ignoring {}: {} still pending", action.label(), pending);
            return Err(ActionError::AlreadyPending { pending });
        }
        let label = action.label();
        publish(&action).map_err(|source| ActionError::Publish {
            label: label.clone(),
            source,
        })?;
        info!("Requested {}", label);
        self.pending = Some(PendingAction {
            action,
            issued_at: now,
            deadline: now + self.timeout,
        });
        Ok(())
    }

    /// Checks a fresh authoritative state against the pending action.
    pub fn on_state_update(&mut self, state: &A::State, now: Instant) -> Option<ActionOutcome> {
        let confirmed = self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.action.is_confirmed_by(state));
        if !confirmed {
            return None;
        }
        let pending = self.pending.take()?;
        let label = pending.action.label();
        let elapsed = now.saturating_duration_since(pending.issued_at);
        info!("{} confirmed after {}ms", label, elapsed.as_millis());
        self.timed_out = false;
        self.notice = None;
        Some(ActionOutcome::Confirmed { label, elapsed })
    }

    /// Times out an overdue action and expires an old timeout notice.
    pub fn tick(&mut self, now: Instant) -> Option<ActionOutcome> {
        if self
            .notice
            .as_ref()
            .is_some_and(|notice| now >= notice.expires_at)
        {
            self.notice = None;
        }

        let overdue = self
            .pending
            .as_ref()
            .is_some_and(|pending| now >= pending.deadline);
        if !overdue {
            return None;
        }
        let pending = self.pending.take()?;
        let label = pending.action.label();
        warn!("{} timed out", label);
        self.timed_out = true;
        self.notice = Some(TimeoutNotice {
            label: label.clone(),
            expires_at: now + self.notice_window,
        });
        Some(ActionOutcome::TimedOut { label })
    }

    pub fn pending(&self) -> Option<&PendingAction<A>> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// How long a timeout stays on screen.
    pub fn notice_window(&self) -> Duration {
        self.notice_window
    }

    pub fn timeout_notice(&self, now: Instant) -> Option<&TimeoutNotice> {
        self.notice.as_ref().filter(|notice| now < notice.expires_at)
    }

    /// Forgets the pending action, e.g. when the window stops.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}
