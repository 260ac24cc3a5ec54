// THEORY:
// The kiosk screen is in one of three states. It starts `Connecting` with a
// placeholder on screen, becomes `Live` when the first frame is shown, and falls
// back to `Blanked` (same placeholder) when the camera has been silent for a
// while. The machine is pure: callers pass in the current time and apply the
// returned command, which keeps it trivially testable without a clock.

use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_BLANK_AFTER: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayState {
    Connecting,
    Live,
    Blanked,
}

/// A change of what the screen shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayCommand {
    ShowLive,
    ShowPlaceholder,
}

#[derive(Debug)]
pub struct DisplayStateMachine {
    state: DisplayState,
    blank_after: Duration,
    idle_deadline: Option<Instant>,
}

impl DisplayStateMachine {
    pub fn new(blank_after: Duration) -> Self {
        Self {
            state: DisplayState::Connecting,
            blank_after,
            idle_deadline: None,
        }
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    /// When the idle timer fires next, if it is armed.
    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    /// A frame was decoded and presented at `now`.
    pub fn frame_presented(&mut self, now: Instant) -> Option<DisplayCommand> {
        self.idle_deadline = Some(now + self.blank_after);
        match self.state {
            DisplayState::Live => None,
            DisplayState::Connecting | DisplayState::Blanked => {
                self.state = DisplayState::Live;
                Some(DisplayCommand::ShowLive)
            }
        }
    }

    /// The idle timer woke up at `now`. Early wake-ups are ignored.
    pub fn idle_timer_fired(&mut self, now: Instant) -> Option<DisplayCommand> {
        match self.idle_deadline {
            Some(deadline) if now >= deadline => self.idle_deadline = None,
            _ => return None,
        }
        match self.state {
            DisplayState::Live => {
                self.state = DisplayState::Blanked;
                Some(DisplayCommand::ShowPlaceholder)
            }
            DisplayState::Connecting | DisplayState::Blanked => None,
        }
    }
}

impl Default for DisplayStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_BLANK_AFTER)
    }
}
