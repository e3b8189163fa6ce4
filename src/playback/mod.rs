//! Playback scheduling for streamed audio

mod clock;
mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{ActiveItem, PlaybackItem, PlaybackScheduler, ScheduledSlot};

/// How often the render clock retires finished items
pub const RENDER_TICK: std::time::Duration = std::time::Duration::from_millis(20);
