use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreensaverState {
    Awake,
    IdleTiming { deadline: Instant },
    Active,
}

/// Idle detection.
///
/// `permitted` folds together the global allow flag, the user setting and the
/// active window's suppression; losing it drops straight back to `Awake`.
#[derive(Debug, Clone)]
pub struct Screensaver {
    delay: Duration,
    state: ScreensaverState,
}

impl Screensaver {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: ScreensaverState::Awake,
        }
    }

    pub fn state(&self) -> ScreensaverState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ScreensaverState::Active
    }

    pub fn update(&mut self, now: Instant, pointer_moved: bool, permitted: bool) {
        let next = if !permitted {
            ScreensaverState::Awake
        } else if pointer_moved {
            ScreensaverState::IdleTiming {
                deadline: now + self.delay,
            }
        } else {
            match self.state {
                ScreensaverState::Awake => ScreensaverState::IdleTiming {
                    deadline: now + self.delay,
                },
                ScreensaverState::IdleTiming { deadline } if now >= deadline => {
                    ScreensaverState::Active
                }
                state => state,
            }
        };

        match (self.is_active(), next == ScreensaverState::Active) {
            (false, true) => info!("Started screensaver"),
            (true, false) => info!("Stopped screensaver"),
            _ => {}
        }
        self.state = next;
    }
}
