//! Application context and the control loop.
//!
//! [`App`] owns the session, the window controller and the status line.
//! Everything that touches them runs on one task: input events are applied
//! as they arrive and everything else happens once per tick.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MiniplayerConfig, UserSettings};
use crate::input::InputEvent;
use crate::mqtt::message::{MqttMessage, Topics};
use crate::mqtt::reconnect::{report_progress, ReconnectOutcome};
use crate::mqtt::registry::Handler;
use crate::mqtt::session::SessionManager;
use crate::mqtt::transport::Transport;
use crate::status::{StatusBoard, StatusTone};
use crate::windows::music::MusicWindow;
use crate::windows::printer::PrinterWindow;
use crate::windows::weather::WeatherWindow;
use crate::windows::{Services, Window, WindowController, WindowId};

pub struct App {
    session: SessionManager,
    windows: WindowController,
    status: StatusBoard,
    settings: UserSettings,
    tick: Duration,
    frame: String,
}

fn build_window(name: &str, config: &MiniplayerConfig) -> Option<Box<dyn Window>> {
    let window: Box<dyn Window> = match name.to_ascii_lowercase().as_str() {
        "music" => Box::new(MusicWindow::new(
            config.action_timeout(),
            config.timeout_notice(),
        )),
        "weather" => Box::new(WeatherWindow::new()),
        "printer" => Box::new(PrinterWindow::new()),
        _ => return None,
    };
    Some(window)
}

impl App {
    pub fn new(
        config: &MiniplayerConfig,
        client_id: String,
        transport: Box<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let session = SessionManager::new(
            config.broker_settings(),
            config.session_timing(),
            Topics::new(config.namespace.clone(), client_id),
            transport,
            shutdown,
        );

        let mut windows =
            WindowController::new(config.screensaver_delay(), config.settings.screensaver);
        for name in &config.windows {
            match build_window(name, config) {
                Some(window) => {
                    windows.register(window);
                }
                None => warn!("Unknown window {} in config, skipping", name),
            }
        }
        if windows.is_empty() {
            return Err(eyre!("None of the configured windows {:?} exist", config.windows));
        }

        Ok(Self::from_parts(
            session,
            windows,
            config.settings.clone(),
            config.tick(),
        ))
    }

    pub fn from_parts(
        session: SessionManager,
        windows: WindowController,
        settings: UserSettings,
        tick: Duration,
    ) -> Self {
        Self {
            session,
            windows,
            status: StatusBoard::new(),
            settings,
            tick,
            frame: String::new(),
        }
    }

    /// Connects, registers the remote window switch and shows the first window.
    ///
    /// A failed first connect is not fatal; the next tick starts the reconnect
    /// sequence instead.
    pub async fn start(&mut self, default_window: Option<&str>) {
        let status = &mut self.status;
        let connected = self
            .session
            .connect_with_progress(&mut |progress| report_progress(status, progress))
            .await;
        if !connected {
            self.session.request_reconnect();
        }

        let window_change = self.session.topics().window_change();
        self.session
            .subscribe(&[window_change], Handler::Navigation, true);

        let first = default_window
            .and_then(|name| self.windows.find(name))
            .unwrap_or(WindowId(0));
        let mut services = Services::new(&mut self.session, &mut self.status, Instant::now());
        self.windows.set_active_window(first, &mut services);
    }

    /// Applies one input event. Any event also counts as pointer activity.
    pub fn handle_input(&mut self, event: InputEvent) {
        debug!("Input: {}", event);
        let mut services = Services::new(&mut self.session, &mut self.status, Instant::now());
        let windows = &mut self.windows;
        match event {
            InputEvent::Left => {
                windows.move_left(&mut services);
            }
            InputEvent::Right => {
                windows.move_right(&mut services);
            }
            InputEvent::Touch => {}
            InputEvent::OpenSettings => windows.open_settings(&mut services),
            InputEvent::CloseSettings => windows.close_settings(&mut services),
            InputEvent::ToggleScreensaver => {
                self.settings.screensaver = windows.toggle_screensaver_setting();
            }
            InputEvent::Reconnect => {
                windows.close_settings(&mut services);
                services.session.request_reconnect();
            }
            InputEvent::ToggleConnection => {
                if services.session.is_connected() {
                    let suspended = windows.suspend_all(true, &mut services);
                    info!("Disconnecting on request, suspended {:?}", suspended);
                    services.session.disconnect();
                    services
                        .status
                        .force("Disconnected", StatusTone::Info, Duration::from_secs(2), services.now);
                } else {
                    services.session.request_reconnect();
                }
            }
            InputEvent::Window(name) => match windows.find(&name) {
                Some(id) => {
                    windows.set_active_window(id, &mut services);
                }
                None => warn!("No window named {}", name),
            },
            InputEvent::Command(command) => {
                windows.command(command, &mut services);
            }
            InputEvent::Quit => services.session.shutdown_token().cancel(),
        }
    }

    fn navigate(&mut self, message: &MqttMessage) {
        let name = message.payload.trim().trim_matches('"');
        if !self.settings.remote_window_change {
            debug!("Ignoring remote switch to {}", name);
            return;
        }
        match self.windows.find(name) {
            Some(id) => {
                info!("Remote switch to {}", name);
                let mut services =
                    Services::new(&mut self.session, &mut self.status, Instant::now());
                self.windows.set_active_window(id, &mut services);
            }
            None => warn!("Remote switch to unknown window {}", name),
        }
    }

    /// One turn of the control loop.
    pub async fn tick(&mut self, pointer_moved: bool) -> Option<ReconnectOutcome> {
        let mut outcome = None;
        if self.session.reconnect_pending() {
            let result = self
                .session
                .reconnect(&mut self.windows, &mut self.status)
                .await;
            if result == ReconnectOutcome::Cancelled {
                return Some(result);
            }
            outcome = Some(result);
        }

        for (handler, message) in self.session.take_deliveries() {
            match handler {
                Handler::Navigation => self.navigate(&message),
                Handler::Window(id) => {
                    let mut services =
                        Services::new(&mut self.session, &mut self.status, Instant::now());
                    self.windows.deliver(id, &message, &mut services);
                }
            }
        }

        let mut services = Services::new(&mut self.session, &mut self.status, Instant::now());
        self.windows.update(pointer_moved, &mut services);

        let now = Instant::now();
        self.session.update(now);
        self.status.expire(now);
        outcome
    }

    fn present(&mut self) {
        let frame = self.windows.render(Instant::now(), &self.status);
        if frame != self.frame {
            println!("{}", frame);
            self.frame = frame;
        }
    }

    /// Runs until the shutdown token is cancelled.
    pub async fn run(mut self, mut input: mpsc::Receiver<InputEvent>) -> Result<()> {
        let shutdown = self.session.shutdown_token().clone();
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pointer_moved = false;
        info!("Control loop running at {}ms per tick", self.tick.as_millis());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = input.recv() => {
                    self.handle_input(event);
                    pointer_moved = true;
                }
                _ = ticker.tick() => {
                    if self.tick(pointer_moved).await == Some(ReconnectOutcome::Cancelled) {
                        break;
                    }
                    pointer_moved = false;
                    self.present();
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Stops every window and leaves the broker cleanly.
    pub fn shutdown(&mut self) {
        info!("Shutting down");
        let mut services = Services::new(&mut self.session, &mut self.status, Instant::now());
        self.windows.shutdown(&mut services);
        self.session.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::{BrokerSettings, SessionTiming};
    use crate::mqtt::mock::{ConnectOutcome, MockTransport};
    use crate::windows::music::tests::playback;
    use crate::windows::tests::Probe;
    use crate::windows::Command;

    const MUSIC: WindowId = WindowId(1);
    const ACTION_TOPIC: &str = "miniplayer/spotify/action";
    const RESPONSE_TOPIC: &str = "miniplayer/spotify/response";

    fn app(mock: &MockTransport, settings: UserSettings) -> App {
        let session = SessionManager::new(
            BrokerSettings::default(),
            SessionTiming::default(),
            Topics::new("miniplayer", "0xabc"),
            Box::new(mock.clone()),
            CancellationToken::new(),
        );
        let mut windows = WindowController::new(Duration::from_secs(60), true);
        windows.register(Box::new(Probe::new("weather").0));
        windows.register(Box::new(MusicWindow::new(
            Duration::from_millis(12_000),
            Duration::from_millis(5_000),
        )));
        windows.register(Box::new(Probe::new("printer").0));
        App::from_parts(session, windows, settings, Duration::from_millis(66))
    }

    async fn started(mock: &MockTransport) -> App {
        let mut app = app(mock, UserSettings::default());
        app.start(Some("music")).await;
        assert_eq!(app.windows.active_windows(), vec![MUSIC]);
        app
    }

    async fn advance_ticking(app: &mut App, seconds: u64) {
        for _ in 0..seconds {
            tokio::time::advance(Duration::from_secs(1)).await;
            app.tick(false).await;
        }
    }

    fn status_text(app: &App) -> Option<String> {
        app.status
            .current(Instant::now())
            .map(|message| message.text.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_disconnect_resumes_only_the_retained_window() {
        let mock = MockTransport::scripted(&[
            ConnectOutcome::Accept,
            ConnectOutcome::Refuse,
            ConnectOutcome::Refuse,
            ConnectOutcome::Accept,
        ]);
        let mut app = started(&mock).await;
        mock.clear_calls();

        mock.drop_link();
        assert!(app.session.reconnect_pending());
        assert_eq!(
            app.tick(false).await,
            Some(ReconnectOutcome::Reconnected { attempts: 3 })
        );
        assert!(app.session.is_connected());
        assert_eq!(app.windows.active_windows(), vec![MUSIC]);

        let subscribed = mock.subscribed();
        assert_eq!(
            subscribed
                .iter()
                .filter(|topic| *topic == "miniplayer/window")
                .count(),
            1
        );
        assert!(subscribed.contains(&RESPONSE_TOPIC.to_string()));
        assert!(!subscribed.contains(&"miniplayer/weather/response".to_string()));
        assert!(!subscribed.contains(&"miniplayer/printer/response".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_is_confirmed_once_the_track_changes() {
        let mock = MockTransport::new();
        let mut app = started(&mock).await;
        mock.deliver(RESPONSE_TOPIC, &playback("t1", true, 40));
        app.tick(false).await;

        app.handle_input(InputEvent::Command(Command::Skip));
        let sent = mock.published_to(ACTION_TOPIC);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"skip\":0"));
        assert!(sent[0].contains("dev-1"));

        mock.deliver(RESPONSE_TOPIC, &playback("t1", true, 40));
        app.tick(false).await;
        assert_ne!(status_text(&app).as_deref(), Some("Skip confirmed"));

        tokio::time::advance(Duration::from_secs(3)).await;
        mock.deliver(RESPONSE_TOPIC, &playback("t2", true, 40));
        app.tick(false).await;
        let message = app.status.current(Instant::now()).cloned();
        assert_eq!(message.as_ref().map(|m| m.text.as_str()), Some("Skip confirmed"));
        assert_eq!(message.map(|m| m.tone), Some(StatusTone::Success));

        // Nothing pending any more, so the next skip goes out.
        app.handle_input(InputEvent::Command(Command::Skip));
        assert_eq!(mock.published_to(ACTION_TOPIC).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_skip_times_out_and_frees_the_tracker() {
        let mock = MockTransport::new();
        let mut app = started(&mock).await;
        mock.deliver(RESPONSE_TOPIC, &playback("t1", true, 40));
        app.tick(false).await;

        app.handle_input(InputEvent::Command(Command::Skip));
        app.handle_input(InputEvent::Command(Command::Skip));
        assert_eq!(mock.published_to(ACTION_TOPIC).len(), 1);

        advance_ticking(&mut app, 11).await;
        assert_eq!(status_text(&app), None);

        advance_ticking(&mut app, 1).await;
        let message = app.status.current(Instant::now()).cloned();
        assert_eq!(message.as_ref().map(|m| m.text.as_str()), Some("Skip timed out!"));
        assert_eq!(message.map(|m| m.tone), Some(StatusTone::Error));

        advance_ticking(&mut app, 4).await;
        assert_eq!(status_text(&app).as_deref(), Some("Skip timed out!"));
        advance_ticking(&mut app, 1).await;
        assert_eq!(status_text(&app), None);

        app.handle_input(InputEvent::Command(Command::Skip));
        assert_eq!(mock.published_to(ACTION_TOPIC).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_confirmation_replaces_timeout_notice() {
        let mock = MockTransport::new();
        let mut app = started(&mock).await;
        mock.deliver(RESPONSE_TOPIC, &playback("t1", true, 40));
        app.tick(false).await;

        app.handle_input(InputEvent::Command(Command::Skip));
        advance_ticking(&mut app, 12).await;
        assert_eq!(status_text(&app).as_deref(), Some("Skip timed out!"));

        app.handle_input(InputEvent::Command(Command::Skip));
        assert_eq!(mock.published_to(ACTION_TOPIC).len(), 2);
        mock.deliver(RESPONSE_TOPIC, &playback("t2", true, 40));
        app.tick(false).await;
        let message = app.status.current(Instant::now()).cloned();
        assert_eq!(message.as_ref().map(|m| m.text.as_str()), Some("Skip confirmed"));
        assert_eq!(message.map(|m| m.tone), Some(StatusTone::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_window_change_follows_setting() {
        let mock = MockTransport::new();
        let mut app = started(&mock).await;
        mock.deliver("miniplayer/window", "printer");
        app.tick(false).await;
        assert_eq!(app.windows.active_windows(), vec![WindowId(2)]);

        mock.deliver("miniplayer/window", "\"teapot\"");
        app.tick(false).await;
        assert_eq!(app.windows.active_windows(), vec![WindowId(2)]);

        let mut app = self::app(
            &mock,
            UserSettings {
                remote_window_change: false,
                ..UserSettings::default()
            },
        );
        app.start(Some("weather")).await;
        mock.deliver("miniplayer/window", "music");
        app.tick(false).await;
        assert_eq!(app.windows.active_windows(), vec![WindowId(0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_disconnects_and_reconnects_through_the_sequence() {
        let mock = MockTransport::new();
        let mut app = started(&mock).await;

        app.handle_input(InputEvent::ToggleConnection);
        assert!(!app.session.is_connected());
        assert!(app.windows.active_windows().is_empty());
        assert!(!app.session.reconnect_pending());
        assert_eq!(app.tick(false).await, None);

        app.handle_input(InputEvent::ToggleConnection);
        assert_eq!(
            app.tick(false).await,
            Some(ReconnectOutcome::Reconnected { attempts: 1 })
        );
        assert_eq!(app.windows.active_windows(), vec![MUSIC]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_connect_schedules_reconnect() {
        let mock = MockTransport::scripted(&[ConnectOutcome::Refuse]);
        let mut app = app(&mock, UserSettings::default());
        app.start(None).await;
        assert!(!app.session.is_connected());
        assert!(app.session.reconnect_pending());

        assert_eq!(
            app.tick(false).await,
            Some(ReconnectOutcome::Reconnected { attempts: 1 })
        );
        assert_eq!(app.windows.active_windows(), vec![WindowId(0)]);
        assert!(app.session.is_subscribed("miniplayer/window"));
    }

    #[tokio::test(start_paused = true)]
    async fn settings_reconnect_entry_closes_overlay() {
        let mock = MockTransport::new();
        let mut app = started(&mock).await;
        app.handle_input(InputEvent::OpenSettings);
        assert!(app.windows.active_windows().is_empty());

        app.handle_input(InputEvent::Reconnect);
        assert!(!app.windows.settings_open());
        assert!(app.session.reconnect_pending());
        assert_eq!(
            app.tick(false).await,
            Some(ReconnectOutcome::Reconnected { attempts: 1 })
        );
        assert_eq!(app.windows.active_windows(), vec![MUSIC]);
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_under_open_settings_keeps_windows_suspended() {
        let mock = MockTransport::new();
        let mut app = started(&mock).await;
        app.handle_input(InputEvent::OpenSettings);

        mock.drop_link();
        assert_eq!(
            app.tick(false).await,
            Some(ReconnectOutcome::Reconnected { attempts: 1 })
        );
        assert!(app.session.is_connected());
        assert!(app.windows.settings_open());
        assert!(app.windows.active_windows().is_empty());
        assert!(!app.windows.allow_screensaver());
        assert!(!app.session.is_subscribed(RESPONSE_TOPIC));

        app.handle_input(InputEvent::CloseSettings);
        assert!(app.windows.allow_screensaver());
        assert_eq!(app.windows.active_windows(), vec![MUSIC]);
        assert!(app.session.is_subscribed(RESPONSE_TOPIC));
    }

    #[tokio::test(start_paused = true)]
    async fn quit_cancels_and_shutdown_leaves_cleanly() {
        let mock = MockTransport::new();
        let mut app = started(&mock).await;
        app.handle_input(InputEvent::Quit);
        assert!(app.session.shutdown_token().is_cancelled());

        app.shutdown();
        assert!(app.windows.active_windows().is_empty());
        assert_eq!(
            mock.published_to("miniplayer/connection/0xabc"),
            vec!["connected".to_string(), "disconnected".to_string()]
        );
    }

    #[test]
    fn unknown_config_windows_are_skipped() {
        let config = MiniplayerConfig {
            windows: vec!["music".to_string(), "clock".to_string()],
            ..MiniplayerConfig::default()
        };
        let app = App::new(
            &config,
            "0xabc".to_string(),
            Box::new(MockTransport::new()),
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(app.windows.len(), 1);

        let config = MiniplayerConfig {
            windows: vec!["clock".to_string()],
            ..MiniplayerConfig::default()
        };
        assert!(App::new(
            &config,
            "0xabc".to_string(),
            Box::new(MockTransport::new()),
            CancellationToken::new(),
        )
        .is_err());
    }
}
