//! # Window Lifecycle
//!
//! A window is one logical screen bound to a handful of bus topics. The
//! [`WindowController`] keeps at most one of them running, moves between
//! them, suspends and resumes them around reconnects and overlays, and drives
//! the screensaver.
//!
//! ```text
//! windows/
//! ├── mod.rs          - Window trait, call context, controller
//! ├── screensaver.rs  - idle detection state machine
//! ├── music.rs        - playback state and remote player commands
//! ├── weather.rs      - local weather report
//! └── printer.rs      - 3D printer progress
//! ```
//!
//! Windows only ever talk to the bus through [`WindowContext`], which scopes
//! subscriptions to the calling window.

pub mod music;
pub mod printer;
pub mod screensaver;
pub mod weather;

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::ActionError;
use crate::mqtt::message::{MqttMessage, Payload, Topics};
use crate::mqtt::registry::Handler;
use crate::mqtt::session::SessionManager;
use crate::mqtt::transport::TransportError;
use crate::status::StatusBoard;
use screensaver::Screensaver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub usize);

#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error("Malformed payload on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("Publish failed: {0}")]
    Publish(#[from] TransportError),

    #[error("Action rejected: {0}")]
    Action(#[from] ActionError),
}

impl WindowError {
    pub fn malformed(message: &MqttMessage, reason: impl ToString) -> Self {
        WindowError::Malformed {
            topic: message.topic.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Remote commands a window may act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play,
    Pause,
    Skip,
    Rewind,
    Shuffle,
    Repeat,
    VolumeUp,
    VolumeDown,
}

/// When a window last saw good data, or what went wrong.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Freshness {
    #[default]
    Pending,
    Fresh(String),
    Failed(String),
}

impl Freshness {
    pub fn fresh() -> Self {
        Freshness::Fresh(chrono::Local::now().format("%H:%M").to_string())
    }

    pub fn failed(reason: impl ToString) -> Self {
        Freshness::Failed(reason.to_string())
    }

    pub fn stamp(&self) -> String {
        match self {
            Freshness::Pending => "--:--".to_string(),
            Freshness::Fresh(time) => time.clone(),
            Freshness::Failed(reason) => format!("ERR: {}", reason),
        }
    }

    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            Freshness::Pending => (252, 252, 153),
            Freshness::Fresh(_) => (18, 115, 53),
            Freshness::Failed(_) => (251, 105, 98),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Freshness::Fresh(_))
    }
}

/// Shared collaborators handed to the controller for one call.
pub struct Services<'a> {
    pub session: &'a mut SessionManager,
    pub status: &'a mut StatusBoard,
    pub now: Instant,
}

impl<'a> Services<'a> {
    pub fn new(session: &'a mut SessionManager, status: &'a mut StatusBoard, now: Instant) -> Self {
        Self {
            session,
            status,
            now,
        }
    }

    fn context(&mut self, id: WindowId) -> WindowContext<'_> {
        WindowContext {
            session: &mut *self.session,
            status: &mut *self.status,
            now: self.now,
            id,
        }
    }
}

/// What a window sees of the rest of the application during a callback.
pub struct WindowContext<'a> {
    session: &'a mut SessionManager,
    pub status: &'a mut StatusBoard,
    pub now: Instant,
    id: WindowId,
}

impl WindowContext<'_> {
    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn topics(&self) -> &Topics {
        self.session.topics()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn subscribe(&mut self, topics: &[String]) {
        self.session
            .subscribe(topics, Handler::Window(self.id), false);
    }

    pub fn unsubscribe(&mut self, topics: &[String]) {
        self.session.unsubscribe(topics);
    }

    pub fn publish(
        &mut self,
        topic: &str,
        payload: impl Into<Payload>,
    ) -> Result<(), TransportError> {
        self.session.publish(topic, payload)
    }

    /// Publishes this client's activity flag for `domain`. Best effort.
    pub fn announce(&mut self, domain: &str, active: bool) {
        let topic = self.topics().active(domain);
        if let Err(e) = self.session.publish(&topic, active) {
            debug!("Could not publish {} to {}: {}", active, topic, e);
        }
    }

    /// Subscribes again to any of `topics` the registry lost while connected.
    pub fn heal(&mut self, topics: &[String]) {
        if !self.session.is_connected() {
            return;
        }
        let missing: Vec<String> = topics
            .iter()
            .filter(|topic| !self.session.is_subscribed(topic))
            .cloned()
            .collect();
        if !missing.is_empty() {
            warn!("Resubscribing to {:?}", missing);
            self.subscribe(&missing);
        }
    }
}

/// One logical screen.
///
/// Start and stop are guarded by the controller; implementations can assume
/// they are called alternately.
pub trait Window: Send {
    fn name(&self) -> &str;

    fn on_start(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError>;

    fn on_stop(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError>;

    /// Handles one delivery on a topic this window subscribed to.
    fn receive(
        &mut self,
        ctx: &mut WindowContext<'_>,
        message: &MqttMessage,
    ) -> Result<(), WindowError>;

    /// Called once per tick while the window is active.
    fn update(&mut self, _ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        Ok(())
    }

    /// Returns `true` if the window knows the command.
    fn command(
        &mut self,
        _ctx: &mut WindowContext<'_>,
        _command: Command,
    ) -> Result<bool, WindowError> {
        Ok(false)
    }

    fn suppresses_screensaver(&self) -> bool {
        false
    }

    /// One-line summary of what the window currently shows.
    fn caption(&self) -> String;

    fn freshness(&self) -> &Freshness;
}

struct Slot {
    window: Box<dyn Window>,
    active: bool,
}

pub struct WindowController {
    slots: Vec<Slot>,
    current: Option<WindowId>,
    retained: Vec<WindowId>,
    screensaver: Screensaver,
    allow_screensaver: bool,
    screensaver_enabled: bool,
    settings_open: bool,
}

impl WindowController {
    pub fn new(screensaver_delay: Duration, screensaver_enabled: bool) -> Self {
        Self {
            slots: Vec::new(),
            current: None,
            retained: Vec::new(),
            screensaver: Screensaver::new(screensaver_delay),
            allow_screensaver: true,
            screensaver_enabled,
            settings_open: false,
        }
    }

    /// Appends a window to the navigation order.
    pub fn register(&mut self, window: Box<dyn Window>) -> WindowId {
        let id = WindowId(self.slots.len());
        debug!("Registered window {} as {:?}", window.name(), id);
        self.slots.push(Slot {
            window,
            active: false,
        });
        id
    }

    pub fn find(&self, name: &str) -> Option<WindowId> {
        self.slots
            .iter()
            .position(|slot| slot.window.name().eq_ignore_ascii_case(name))
            .map(WindowId)
    }

    pub fn name(&self, id: WindowId) -> Option<&str> {
        self.slots.get(id.0).map(|slot| slot.window.name())
    }

    pub fn window(&self, id: WindowId) -> Option<&dyn Window> {
        self.slots.get(id.0).map(|slot| slot.window.as_ref())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current(&self) -> Option<WindowId> {
        self.current
    }

    pub fn is_active(&self, id: WindowId) -> bool {
        self.slots.get(id.0).is_some_and(|slot| slot.active)
    }

    pub fn active_windows(&self) -> Vec<WindowId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.active)
            .map(|(index, _)| WindowId(index))
            .collect()
    }

    pub fn retained(&self) -> &[WindowId] {
        &self.retained
    }

    fn start(&mut self, id: WindowId, services: &mut Services<'_>) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return;
        };
        if slot.active {
            warn!("{} is already started", slot.window.name());
            return;
        }
        slot.active = true;
        info!("Starting {}", slot.window.name());
        if let Err(e) = slot.window.on_start(&mut services.context(id)) {
            warn!("{} failed to start cleanly: {}", slot.window.name(), e);
        }
    }

    fn stop(&mut self, id: WindowId, services: &mut Services<'_>) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return;
        };
        if !slot.active {
            warn!("{} is already stopped", slot.window.name());
            return;
        }
        slot.active = false;
        info!("Stopping {}", slot.window.name());
        if let Err(e) = slot.window.on_stop(&mut services.context(id)) {
            warn!("{} failed to stop cleanly: {}", slot.window.name(), e);
        }
    }

    /// Stops whatever runs and starts `next`. While windows are suspended the
    /// switch only retargets the pending resume.
    pub fn set_active_window(&mut self, next: WindowId, services: &mut Services<'_>) -> bool {
        if next.0 >= self.slots.len() {
            warn!("Unknown window {:?}", next);
            return false;
        }
        if !self.retained.is_empty() {
            info!("Windows suspended, {} will start on resume", self.slots[next.0].window.name());
            self.retained = vec![next];
            self.current = Some(next);
            return true;
        }
        if self.current == Some(next) && self.is_active(next) {
            debug!("{} is already the active window", self.slots[next.0].window.name());
            return true;
        }
        for id in self.active_windows() {
            self.stop(id, services);
        }
        self.current = Some(next);
        self.start(next, services);
        true
    }

    pub fn move_left(&mut self, services: &mut Services<'_>) -> bool {
        match self.current {
            Some(WindowId(index)) if index > 0 => {
                self.set_active_window(WindowId(index - 1), services)
            }
            _ => false,
        }
    }

    pub fn move_right(&mut self, services: &mut Services<'_>) -> bool {
        match self.current {
            Some(WindowId(index)) if index + 1 < self.slots.len() => {
                self.set_active_window(WindowId(index + 1), services)
            }
            _ => false,
        }
    }

    /// Stops every active window, remembering them for [`Self::resume_retained`]
    /// when `retain` is set.
    pub fn suspend_all(&mut self, retain: bool, services: &mut Services<'_>) -> Vec<String> {
        let active = self.active_windows();
        let mut names = Vec::with_capacity(active.len());
        for id in active {
            self.stop(id, services);
            if let Some(name) = self.name(id) {
                names.push(name.to_string());
            }
            if retain && !self.retained.contains(&id) {
                self.retained.push(id);
            }
        }
        names
    }

    pub fn resume_retained(&mut self, services: &mut Services<'_>) {
        let retained = std::mem::take(&mut self.retained);
        for id in retained {
            self.start(id, services);
        }
    }

    /// Hands a delivery to its window. Errors stay inside the window.
    pub fn deliver(&mut self, id: WindowId, message: &MqttMessage, services: &mut Services<'_>) {
        let Some(slot) = self.slots.get_mut(id.0) else {
            warn!("Delivery for unknown window {:?}", id);
            return;
        };
        if !slot.active {
            debug!("{} inactive, dropping {}", slot.window.name(), message.topic);
            return;
        }
        if let Err(e) = slot.window.receive(&mut services.context(id), message) {
            warn!("{} could not handle {}: {}", slot.window.name(), message.topic, e);
        }
    }

    pub fn command(&mut self, command: Command, services: &mut Services<'_>) -> bool {
        let Some(id) = self.current.filter(|id| self.is_active(*id)) else {
            debug!("No active window for {:?}", command);
            return false;
        };
        let slot = &mut self.slots[id.0];
        match slot.window.command(&mut services.context(id), command) {
            Ok(handled) => {
                if !handled {
                    debug!("{} ignores {:?}", slot.window.name(), command);
                }
                handled
            }
            Err(e) => {
                warn!("{} failed on {:?}: {}", slot.window.name(), command, e);
                false
            }
        }
    }

    /// Per-tick update of the active window, then the screensaver.
    pub fn update(&mut self, pointer_moved: bool, services: &mut Services<'_>) {
        let mut suppressed = false;
        for id in self.active_windows() {
            let slot = &mut self.slots[id.0];
            if let Err(e) = slot.window.update(&mut services.context(id)) {
                warn!("{} update failed: {}", slot.window.name(), e);
            }
            suppressed |= slot.window.suppresses_screensaver();
        }
        let permitted = self.allow_screensaver
            && self.screensaver_enabled
            && !self.settings_open
            && !suppressed;
        self.screensaver.update(services.now, pointer_moved, permitted);
    }

    pub fn allow_screensaver(&self) -> bool {
        self.allow_screensaver
    }

    pub fn set_allow_screensaver(&mut self, allow: bool) {
        if self.allow_screensaver != allow {
            debug!("Screensaver {}", if allow { "allowed" } else { "held off" });
        }
        self.allow_screensaver = allow;
    }

    pub fn screensaver_enabled(&self) -> bool {
        self.screensaver_enabled
    }

    pub fn toggle_screensaver_setting(&mut self) -> bool {
        self.screensaver_enabled = !self.screensaver_enabled;
        info!(
            "Screensaver setting {}",
            if self.screensaver_enabled { "on" } else { "off" }
        );
        self.screensaver_enabled
    }

    pub fn screensaver_active(&self) -> bool {
        self.screensaver.is_active()
    }

    pub fn settings_open(&self) -> bool {
        self.settings_open
    }

    /// Full-screen overlay: suspends the running windows until closed.
    pub fn open_settings(&mut self, services: &mut Services<'_>) {
        if self.settings_open {
            return;
        }
        info!("Opened settings");
        self.settings_open = true;
        self.set_allow_screensaver(false);
        self.suspend_all(true, services);
    }

    pub fn close_settings(&mut self, services: &mut Services<'_>) {
        if !self.settings_open {
            return;
        }
        info!("Closed settings");
        self.settings_open = false;
        self.set_allow_screensaver(true);
        self.resume_retained(services);
    }

    pub fn shutdown(&mut self, services: &mut Services<'_>) {
        self.retained.clear();
        self.suspend_all(false, services);
    }

    /// Text view of the current screen.
    pub fn render(&self, now: Instant, status: &StatusBoard) -> String {
        if self.screensaver.is_active() {
            return "[screensaver]".to_string();
        }
        if self.settings_open {
            return format!(
                "[settings] screensaver: {}",
                if self.screensaver_enabled { "on" } else { "off" }
            );
        }
        let mut line = match self.current.and_then(|id| self.slots.get(id.0)) {
            Some(slot) => format!(
                "[{}] {} | {}",
                slot.window.name(),
                slot.window.caption(),
                slot.window.freshness().stamp()
            ),
            None => "[no window]".to_string(),
        };
        if let Some(message) = status.current(now) {
            line.push_str(&format!(" | {}", message));
        }
        line
    }
}
