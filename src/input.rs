//! Line oriented command surface on stdin.
//!
//! Every line is parsed into an [`InputEvent`] and queued for the control
//! loop. Any event counts as pointer activity for the screensaver.

use std::fmt;
use std::io::BufRead;
use std::str::FromStr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::windows::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Left,
    Right,
    /// Pointer activity without any other effect.
    Touch,
    OpenSettings,
    CloseSettings,
    ToggleScreensaver,
    Reconnect,
    ToggleConnection,
    Window(String),
    Command(Command),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseInputError {
    #[error("empty input")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("`window` needs a window name")]
    MissingWindow,
}

impl FromStr for InputEvent {
    type Err = ParseInputError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Err(ParseInputError::Empty);
        };
        let event = match head.to_ascii_lowercase().as_str() {
            "left" => InputEvent::Left,
            "right" => InputEvent::Right,
            "touch" => InputEvent::Touch,
            "settings" => InputEvent::OpenSettings,
            "close" => InputEvent::CloseSettings,
            "screensaver" => InputEvent::ToggleScreensaver,
            "reconnect" => InputEvent::Reconnect,
            "toggle" => InputEvent::ToggleConnection,
            "window" => {
                let name = words.collect::<Vec<_>>().join(" ");
                if name.is_empty() {
                    return Err(ParseInputError::MissingWindow);
                }
                InputEvent::Window(name)
            }
            "play" => InputEvent::Command(Command::Play),
            "pause" => InputEvent::Command(Command::Pause),
            "skip" => InputEvent::Command(Command::Skip),
            "rewind" => InputEvent::Command(Command::Rewind),
            "shuffle" => InputEvent::Command(Command::Shuffle),
            "repeat" => InputEvent::Command(Command::Repeat),
            "vol+" => InputEvent::Command(Command::VolumeUp),
            "vol-" => InputEvent::Command(Command::VolumeDown),
            "quit" | "exit" => InputEvent::Quit,
            other => return Err(ParseInputError::Unknown(other.to_string())),
        };
        Ok(event)
    }
}

impl fmt::Display for InputEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputEvent::Window(name) => write!(f, "window {}", name),
            InputEvent::Command(command) => write!(f, "{:?}", command),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Parses one line. `quit` cancels `shutdown` and yields nothing.
fn interpret(line: &str, shutdown: &CancellationToken) -> Option<InputEvent> {
    match line.parse::<InputEvent>() {
        Ok(InputEvent::Quit) => {
            info!("Quit requested");
            shutdown.cancel();
            None
        }
        Ok(event) => Some(event),
        Err(ParseInputError::Empty) => None,
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

/// Reads stdin on a dedicated thread.
///
/// A blocking read cannot be interrupted, so the thread is left detached and
/// does not hold up runtime shutdown.
pub fn spawn_stdin_reader(
    events: mpsc::Sender<InputEvent>,
    shutdown: CancellationToken,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("stdin-input".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if shutdown.is_cancelled() {
                    break;
                }
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to read input: {}", e);
                        break;
                    }
                };
                if let Some(event) = interpret(&line, &shutdown) {
                    if events.blocking_send(event).is_err() {
                        break;
                    }
                }
                if shutdown.is_cancelled() {
                    break;
                }
            }
            debug!("Input reader finished");
        })
}
