//! Reconnect sequence with exponential backoff.
//!
//! ```text
//! Disconnecting ──► Connecting ──► Reconnected
//!                     │    ▲
//!                     ▼    │
//!                  BackoffWait
//! ```
//!
//! The sequence runs on the control loop's own turn. Holding the session by
//! `&mut` for the whole run is what keeps a second sequence from starting.

use std::time::Duration;

use statum::{machine, state};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::SessionTiming;
use super::session::{ConnectProgress, SessionManager};
use crate::status::{StatusBoard, StatusTone};
use crate::windows::{Services, WindowController};

/// Retry delay that doubles after every failed attempt, saturating at `cap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            cap,
            current: base.min(cap),
        }
    }

    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.cap);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected { attempts: u32 },
    Cancelled,
}

#[state]
#[derive(Debug, Clone)]
pub enum ReconnectState {
    Disconnecting,
    Connecting,
    BackoffWait,
    Reconnected,
}

#[machine]
pub struct ReconnectSequence<S: ReconnectState> {
    backoff: Backoff,
    attempts: u32,
}

impl ReconnectSequence<Disconnecting> {
    pub fn begin(timing: &SessionTiming) -> Self {
        Self::new(Backoff::new(timing.retry_base, timing.retry_cap), 0)
    }

    /// Suspends the active windows for later resume and drops the old link.
    pub fn tear_down(
        self,
        session: &mut SessionManager,
        windows: &mut WindowController,
        status: &mut StatusBoard,
    ) -> ReconnectSequence<Connecting> {
        let mut services = Services::new(session, status, Instant::now());
        let suspended = windows.suspend_all(true, &mut services);
        info!("Suspended {:?} for reconnect", suspended);
        windows.set_allow_screensaver(false);
        session.disconnect();
        self.transition()
    }
}

impl ReconnectSequence<Connecting> {
    pub async fn attempt(
        mut self,
        session: &mut SessionManager,
        status: &mut StatusBoard,
    ) -> Result<ReconnectSequence<Reconnected>, ReconnectSequence<BackoffWait>> {
        self.attempts += 1;
        info!("Reconnect attempt {}", self.attempts);
        let connected = session
            .connect_with_progress(&mut |progress| report_progress(status, progress))
            .await;
        if connected {
            Ok(self.transition())
        } else {
            Err(self.transition())
        }
    }
}

impl ReconnectSequence<BackoffWait> {
    /// Sleeps out the current delay with a once-per-second countdown.
    /// Returns `None` when shutdown interrupts the wait.
    pub async fn wait(
        mut self,
        shutdown: &CancellationToken,
        status: &mut StatusBoard,
    ) -> Option<ReconnectSequence<Connecting>> {
        let delay = self.backoff.delay();
        warn!(
            "Reconnect attempt {} failed, retrying in {}s",
            self.attempts,
            delay.as_secs()
        );
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                break;
            }
            status.force(
                format!("Reconnecting (retry in {})", format_countdown(remaining)),
                StatusTone::Progress,
                Duration::from_millis(1100),
                now,
            );
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = sleep(remaining.min(Duration::from_secs(1))) => {}
            }
        }
        self.backoff.advance();
        Some(self.transition())
    }
}

impl ReconnectSequence<Reconnected> {
    /// Replays retained topics, then restarts the suspended windows.
    ///
    /// With the settings overlay open the windows stay suspended and closing
    /// the overlay resumes them.
    pub fn restore(
        self,
        session: &mut SessionManager,
        windows: &mut WindowController,
        status: &mut StatusBoard,
    ) -> u32 {
        session.replay_retained();
        if windows.settings_open() {
            info!("Settings open, windows resume when it closes");
        } else {
            windows.set_allow_screensaver(true);
            let mut services = Services::new(session, status, Instant::now());
            windows.resume_retained(&mut services);
        }
        info!("Reconnected after {} attempt(s)", self.attempts);
        self.attempts
    }
}

pub(crate) fn report_progress(status: &mut StatusBoard, progress: ConnectProgress) {
    let now = Instant::now();
    match progress {
        ConnectProgress::Connecting => status.force(
            "Connecting...",
            StatusTone::Progress,
            Duration::from_secs(15),
            now,
        ),
        ConnectProgress::Connected => {
            status.force("Connected", StatusTone::Success, Duration::from_secs(2), now)
        }
        ConnectProgress::Failed => status.force(
            "Connection failed",
            StatusTone::Error,
            Duration::from_secs(2),
            now,
        ),
    }
}

/// `M:SS`, rounding partial seconds up.
fn format_countdown(remaining: Duration) -> String {
    let secs = remaining.as_millis().div_ceil(1000);
    format!("{}:{:02}", secs / 60, secs % 60)
}

impl SessionManager {
    /// Runs the full reconnect sequence. Retries until the broker comes back or
    /// shutdown is requested.
    pub async fn reconnect(
        &mut self,
        windows: &mut WindowController,
        status: &mut StatusBoard,
    ) -> ReconnectOutcome {
        self.take_reconnect();
        info!("Starting reconnect to {}", self.broker_address());
        let shutdown = self.shutdown_token().clone();
        let mut connecting =
            ReconnectSequence::<Disconnecting>::begin(self.timing()).tear_down(self, windows, status);
        loop {
            match connecting.attempt(self, status).await {
                Ok(reconnected) => {
                    let attempts = reconnected.restore(self, windows, status);
                    return ReconnectOutcome::Reconnected { attempts };
                }
                Err(waiting) => match waiting.wait(&shutdown, status).await {
                    Some(next) => connecting = next,
                    None => {
                        info!("Reconnect cancelled by shutdown");
                        return ReconnectOutcome::Cancelled;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::BrokerSettings;
    use crate::mqtt::message::Topics;
    use crate::mqtt::mock::{ConnectOutcome, MockTransport};
    use crate::mqtt::registry::Handler;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(9), Duration::from_secs(1800));
        let mut delays = Vec::new();
        for _ in 0..10 {
            delays.push(backoff.delay().as_secs());
            backoff.advance();
        }
        assert_eq!(
            delays,
            vec![9, 18, 36, 72, 144, 288, 576, 1152, 1800, 1800]
        );
    }

    #[test]
    fn backoff_base_above_cap_is_clamped() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(backoff.delay(), Duration::from_secs(30));
    }

    #[test]
    fn countdown_formats_minutes_and_seconds() {
        assert_eq!(format_countdown(Duration::from_secs(9)), "0:09");
        assert_eq!(format_countdown(Duration::from_millis(72_500)), "1:13");
        assert_eq!(format_countdown(Duration::from_secs(1800)), "30:00");
    }

    fn session(mock: &MockTransport, shutdown: CancellationToken) -> SessionManager {
        SessionManager::new(
            BrokerSettings::default(),
            SessionTiming::default(),
            Topics::new("miniplayer", "0xabc"),
            Box::new(mock.clone()),
            shutdown,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_growing_delay_until_connected() {
        let mock = MockTransport::scripted(&[ConnectOutcome::Refuse, ConnectOutcome::Refuse]);
        let mut session = session(&mock, CancellationToken::new());
        let mut windows = WindowController::new(Duration::from_secs(60), true);
        let mut status = StatusBoard::new();
        session.subscribe(&["miniplayer/window"], Handler::Navigation, true);
        session.request_reconnect();

        let started = Instant::now();
        let outcome = session.reconnect(&mut windows, &mut status).await;
        assert_eq!(outcome, ReconnectOutcome::Reconnected { attempts: 3 });
        assert_eq!(Instant::now() - started, Duration::from_secs(9 + 18));
        assert!(session.is_connected());
        assert!(!session.reconnect_pending());
        assert!(session.is_subscribed("miniplayer/window"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_backoff() {
        let shutdown = CancellationToken::new();
        let mock = MockTransport::scripted(&[ConnectOutcome::Refuse; 4]);
        let mut session = session(&mock, shutdown.clone());
        let mut windows = WindowController::new(Duration::from_secs(60), true);
        let mut status = StatusBoard::new();

        let token = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(20)).await;
            token.cancel();
        });
        let outcome = session.reconnect(&mut windows, &mut status).await;
        assert_eq!(outcome, ReconnectOutcome::Cancelled);
        assert!(!session.is_connected());
        assert_eq!(mock.starts(), 2);
    }
}
