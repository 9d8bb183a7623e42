//! Music playback window.
//!
//! Shows the state broadcast on `<ns>/spotify/response` and sends player
//! commands to `<ns>/spotify/action`. Every command goes through an
//! [`ActionTracker`] so the next broadcast confirms or the deadline fails it.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Command, Freshness, Window, WindowContext, WindowError};
use crate::action::{ActionOutcome, ActionTracker, Confirmable};
use crate::mqtt::message::MqttMessage;
use crate::status::{StatusTone, DEFAULT_STATUS_DURATION};

const DOMAIN: &str = "spotify";
const VOLUME_STEP: u8 = 5;
const PROGRESS_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    Context,
    Track,
}

impl RepeatMode {
    pub fn next(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::Context,
            RepeatMode::Context => RepeatMode::Track,
            RepeatMode::Track => RepeatMode::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RepeatMode::Off => "off",
            RepeatMode::Context => "context",
            RepeatMode::Track => "track",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Album {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Artist {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub album: Album,
    #[serde(default)]
    pub artists: Vec<Artist>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub volume_percent: u8,
}

/// One playback broadcast. An empty object on the wire means nothing plays.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    #[serde(default)]
    pub shuffle_state: bool,
    #[serde(default)]
    pub repeat_state: RepeatMode,
    #[serde(default)]
    pub progress_ms: u64,
    pub item: Track,
    pub device: Device,
}

impl PlaybackState {
    /// `None` for the empty "nothing playing" object.
    pub fn parse(payload: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: Value = serde_json::from_str(payload)?;
        if value.as_object().is_some_and(|object| object.is_empty()) {
            return Ok(None);
        }
        let mut state: PlaybackState = serde_json::from_value(value)?;
        state.item.name = shorten(&state.item.name);
        state.item.album.name = shorten(&state.item.album.name);
        Ok(Some(state))
    }
}

/// A player command together with what it expects to change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerAction {
    Play,
    Pause,
    Skip { from_track: String },
    Rewind { from_track: String },
    Shuffle { from: bool },
    Repeat { from: RepeatMode },
    VolumeUp { from: u8 },
    VolumeDown { from: u8 },
}

impl PlayerAction {
    fn kind(&self) -> &'static str {
        match self {
            PlayerAction::Play => "play",
            PlayerAction::Pause => "pause",
            PlayerAction::Skip { .. } => "skip",
            PlayerAction::Rewind { .. } => "rewind",
            PlayerAction::Shuffle { .. } => "shuffle",
            PlayerAction::Repeat { .. } => "repeat",
            PlayerAction::VolumeUp { .. } => "volume_+",
            PlayerAction::VolumeDown { .. } => "volume_-",
        }
    }

    fn params(&self) -> Vec<Value> {
        match self {
            PlayerAction::Shuffle { from } => vec![json!((!from).to_string())],
            PlayerAction::Repeat { from } => vec![json!(from.next().as_str())],
            PlayerAction::VolumeUp { from } => vec![json!(from.saturating_add(VOLUME_STEP).min(100))],
            PlayerAction::VolumeDown { from } => vec![json!(from.saturating_sub(VOLUME_STEP))],
            _ => Vec::new(),
        }
    }

    /// `{"<kind>": 0, "params": [..., {"device_id": ...}]}`
    pub fn payload(&self, device_id: Option<&str>) -> Value {
        let mut params = self.params();
        params.push(json!({ "device_id": device_id }));
        let mut payload = serde_json::Map::new();
        payload.insert(self.kind().to_string(), json!(0));
        payload.insert("params".to_string(), Value::Array(params));
        Value::Object(payload)
    }
}

impl fmt::Display for PlayerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlayerAction::Play => "Play",
            PlayerAction::Pause => "Pause",
            PlayerAction::Skip { .. } => "Skip",
            PlayerAction::Rewind { .. } => "Rewind",
            PlayerAction::Shuffle { .. } => "Shuffle",
            PlayerAction::Repeat { .. } => "Repeat",
            PlayerAction::VolumeUp { .. } => "Volume +",
            PlayerAction::VolumeDown { .. } => "Volume -",
        };
        f.write_str(label)
    }
}

impl Confirmable for PlayerAction {
    type State = PlaybackState;

    fn label(&self) -> String {
        self.to_string()
    }

    fn is_confirmed_by(&self, state: &PlaybackState) -> bool {
        match self {
            PlayerAction::Play => state.is_playing,
            PlayerAction::Pause => !state.is_playing,
            PlayerAction::Skip { from_track } | PlayerAction::Rewind { from_track } => {
                state.item.id != *from_track
            }
            PlayerAction::Shuffle { from } => state.shuffle_state != *from,
            PlayerAction::Repeat { from } => state.repeat_state != *from,
            PlayerAction::VolumeUp { from } => state.device.volume_percent > *from,
            PlayerAction::VolumeDown { from } => state.device.volume_percent < *from,
        }
    }
}

/// Drops bracketed segments such as `(Remastered 2011)` or `[Live]`.
pub fn shorten(text: &str) -> String {
    let mut depth = 0usize;
    let mut kept = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => kept.push(c),
            _ => {}
        }
    }
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clock(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
    } else {
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

pub struct MusicWindow {
    state: Option<PlaybackState>,
    progress_stepped_at: Instant,
    tracker: ActionTracker<PlayerAction>,
    freshness: Freshness,
}

impl MusicWindow {
    pub fn new(action_timeout: Duration, notice_window: Duration) -> Self {
        Self {
            state: None,
            progress_stepped_at: Instant::now(),
            tracker: ActionTracker::new(action_timeout, notice_window),
            freshness: Freshness::Pending,
        }
    }

    pub fn state(&self) -> Option<&PlaybackState> {
        self.state.as_ref()
    }

    pub fn pending_action(&self) -> Option<&PlayerAction> {
        self.tracker.pending().map(|pending| &pending.action)
    }

    fn response_topic(ctx: &WindowContext<'_>) -> String {
        ctx.topics().domain(DOMAIN, "response")
    }

    fn action_for(&self, command: Command) -> Option<PlayerAction> {
        let state = self.state.as_ref()?;
        let action = match command {
            Command::Play if !state.is_playing => PlayerAction::Play,
            Command::Pause if state.is_playing => PlayerAction::Pause,
            Command::Skip => PlayerAction::Skip {
                from_track: state.item.id.clone(),
            },
            Command::Rewind => PlayerAction::Rewind {
                from_track: state.item.id.clone(),
            },
            Command::Shuffle => PlayerAction::Shuffle {
                from: state.shuffle_state,
            },
            Command::Repeat => PlayerAction::Repeat {
                from: state.repeat_state,
            },
            Command::VolumeUp if state.device.volume_percent < 100 => PlayerAction::VolumeUp {
                from: state.device.volume_percent,
            },
            Command::VolumeDown if state.device.volume_percent > 0 => PlayerAction::VolumeDown {
                from: state.device.volume_percent,
            },
            _ => return None,
        };
        Some(action)
    }

    fn advance_progress(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.progress_stepped_at);
        if elapsed < PROGRESS_STEP {
            return;
        }
        let steps = (elapsed.as_millis() / PROGRESS_STEP.as_millis()) as u32;
        self.progress_stepped_at += PROGRESS_STEP * steps;
        if let Some(state) = self.state.as_mut().filter(|state| state.is_playing) {
            let advanced = state.progress_ms + PROGRESS_STEP.as_millis() as u64 * steps as u64;
            state.progress_ms = advanced.min(state.item.duration_ms);
        }
    }

    /// Replaces whatever shows, so a confirmation also clears a timeout notice.
    fn report(ctx: &mut WindowContext<'_>, outcome: ActionOutcome, notice_window: Duration) {
        match outcome {
            ActionOutcome::Confirmed { label, .. } => {
                ctx.status.force(
                    format!("{} confirmed", label),
                    StatusTone::Success,
                    DEFAULT_STATUS_DURATION,
                    ctx.now,
                );
            }
            ActionOutcome::TimedOut { label } => {
                ctx.status.force(
                    format!("{} timed out!", label),
                    StatusTone::Error,
                    notice_window,
                    ctx.now,
                );
            }
        }
    }
}

impl Window for MusicWindow {
    fn name(&self) -> &str {
        "music"
    }

    fn on_start(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        self.state = None;
        self.progress_stepped_at = ctx.now;
        let topic = Self::response_topic(ctx);
        ctx.subscribe(&[topic]);
        ctx.announce(DOMAIN, true);
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        ctx.announce(DOMAIN, false);
        let topic = Self::response_topic(ctx);
        ctx.unsubscribe(&[topic]);
        self.tracker.clear();
        Ok(())
    }

    fn receive(
        &mut self,
        ctx: &mut WindowContext<'_>,
        message: &MqttMessage,
    ) -> Result<(), WindowError> {
        if message.topic != Self::response_topic(ctx) {
            return Ok(());
        }
        match PlaybackState::parse(&message.payload) {
            Ok(Some(state)) => {
                if let Some(outcome) = self.tracker.on_state_update(&state, ctx.now) {
                    Self::report(ctx, outcome, self.tracker.notice_window());
                }
                self.state = Some(state);
                self.progress_stepped_at = ctx.now;
                self.freshness = Freshness::fresh();
                Ok(())
            }
            Ok(None) => {
                debug!("Nothing playing");
                self.state = None;
                self.freshness = Freshness::fresh();
                Ok(())
            }
            Err(e) => {
                self.freshness = Freshness::failed(&e);
                Err(WindowError::malformed(message, e))
            }
        }
    }

    fn update(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        let topic = Self::response_topic(ctx);
        ctx.heal(&[topic]);
        self.advance_progress(ctx.now);
        if let Some(outcome) = self.tracker.tick(ctx.now) {
            Self::report(ctx, outcome, self.tracker.notice_window());
        }
        Ok(())
    }

    fn command(&mut self, ctx: &mut WindowContext<'_>, command: Command) -> Result<bool, WindowError> {
        let Some(action) = self.action_for(command) else {
            if self.state.is_none() {
                ctx.status.post("Nothing playing", StatusTone::Info, ctx.now);
            }
            debug!("{:?} does not apply to the current playback", command);
            return Ok(true);
        };
        let device_id = self
            .state
            .as_ref()
            .and_then(|state| state.device.id.clone());
        let topic = ctx.topics().domain(DOMAIN, "action");
        let now = ctx.now;
        self.tracker.request_action(action, now, |action| {
            info!("Sending {} to {}", action, topic);
            ctx.publish(&topic, action.payload(device_id.as_deref()))
        })?;
        Ok(true)
    }

    fn suppresses_screensaver(&self) -> bool {
        self.state.as_ref().is_some_and(|state| state.is_playing)
    }

    fn caption(&self) -> String {
        let Some(state) = &self.state else {
            return "Nothing playing".to_string();
        };
        let artists = state
            .item
            .artists
            .iter()
            .map(|artist| artist.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let mut caption = format!(
            "{} {} - {} ({}/{}) vol {}%",
            if state.is_playing { ">" } else { "||" },
            state.item.name,
            artists,
            clock(state.progress_ms),
            clock(state.item.duration_ms),
            state.device.volume_percent
        );
        if let Some(action) = self.pending_action() {
            caption.push_str(&format!(" [{}...]", action));
        }
        caption
    }

    fn freshness(&self) -> &Freshness {
        &self.freshness
    }
}
