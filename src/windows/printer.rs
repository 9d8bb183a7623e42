use serde::Deserialize;

use super::{Freshness, Window, WindowContext, WindowError};
use crate::mqtt::message::MqttMessage;

const DOMAIN: &str = "octoprint";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StateFlags {
    #[serde(default)]
    pub operational: bool,
    #[serde(default)]
    pub printing: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrinterState {
    pub text: String,
    #[serde(default)]
    pub flags: StateFlags,
}

impl Default for PrinterState {
    fn default() -> Self {
        Self {
            text: "Unknown".to_string(),
            flags: StateFlags::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(default)]
    pub completion: Option<f64>,
    #[serde(default)]
    pub print_time: Option<u64>,
    #[serde(default)]
    pub print_time_left: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PrintJob {
    #[serde(default)]
    pub path: String,
    pub progress: Progress,
    pub state: PrinterState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct PositionReport {
    position: Position,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Heater {
    pub actual: f64,
    pub target: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Temperatures {
    pub bed: Heater,
    pub tool: Heater,
}

/// 3D printer status, assembled from three separate topics.
#[derive(Default)]
pub struct PrinterWindow {
    job: PrintJob,
    position: Position,
    temperatures: Temperatures,
    freshness: Freshness,
}

impl PrinterWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self) -> &PrintJob {
        &self.job
    }

    fn topics(ctx: &WindowContext<'_>) -> [String; 3] {
        [
            ctx.topics().domain(DOMAIN, "progress/printing"),
            ctx.topics().domain(DOMAIN, "position"),
            ctx.topics().domain(DOMAIN, "temperature"),
        ]
    }

    fn reset(&mut self) {
        self.job = PrintJob::default();
        self.position = Position::default();
        self.temperatures = Temperatures::default();
    }

    fn apply(&mut self, index: usize, payload: &str) -> Result<(), serde_json::Error> {
        match index {
            0 => self.job = serde_json::from_str(payload)?,
            1 => self.position = serde_json::from_str::<PositionReport>(payload)?.position,
            _ => self.temperatures = serde_json::from_str(payload)?,
        }
        Ok(())
    }
}

impl Window for PrinterWindow {
    fn name(&self) -> &str {
        "printer"
    }

    fn on_start(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        self.reset();
        let topics = Self::topics(ctx);
        ctx.subscribe(&topics);
        ctx.announce(DOMAIN, true);
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut WindowContext<'_>) -> Result<(), WindowError> {
        ctx.announce(DOMAIN, false);
        let topics = Self::topics(ctx);
        ctx.unsubscribe(&topics);
        Ok(())
    }

    fn receive(
        &mut self,
        ctx: &mut WindowContext<'_>,
        message: &MqttMessage,
    ) -> Result<(), WindowError> {
        let Some(index) = Self::topics(ctx)
            .iter()
            .position(|topic| *topic == message.topic)
        else {
            return Ok(());
        };
        match self.apply(index, &message.payload) {
            Ok(()) => {
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
        let topics = Self::topics(ctx);
        ctx.heal(&topics);
        Ok(())
    }

    fn suppresses_screensaver(&self) -> bool {
        self.job.state.flags.printing
    }

    fn caption(&self) -> String {
        format!(
            "{}: {}% | tool {:.0}/{:.0}°C bed {:.0}/{:.0}°C | x{:.1} y{:.1} z{:.1}",
            self.job.state.text,
            self.job.progress.completion.unwrap_or(0.0).round(),
            self.temperatures.tool.actual,
            self.temperatures.tool.target,
            self.temperatures.bed.actual,
            self.temperatures.bed.target,
            self.position.x,
            self.position.y,
            self.position.z
        )
    }

    fn freshness(&self) -> &Freshness {
        &self.freshness
    }
}
