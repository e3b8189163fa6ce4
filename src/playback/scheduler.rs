use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use super::clock::Clock;
use crate::audio_sink::{AudioError, AudioSink};
use crate::codec::AudioBuffer;

/// A decoded buffer with its place on the playback timeline
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub id: u64,
    pub buffer: AudioBuffer,
    pub start: Duration,
    pub duration: Duration,
}

impl PlaybackItem {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Where an enqueued buffer landed on the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSlot {
    pub id: u64,
    pub start: Duration,
    pub end: Duration,
}

/// The item currently being rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveItem {
    pub id: u64,
    pub start: Duration,
    pub elapsed: Duration,
    pub remaining: Duration,
}

struct SchedulerState {
    queue: VecDeque<PlaybackItem>,
    last_scheduled_end: Duration,
    next_id: u64,
    accepting: bool,
}

/// Gapless playback scheduling with cancellation on interrupt.
///
/// Every buffer starts at `max(now, end of the previous buffer)`, so
/// consecutive buffers are contiguous regardless of arrival jitter. Samples
/// are handed to the sink at enqueue time and the sink renders them at its
/// own real-time pace; the queue mirrors what the sink still has to play.
/// Queue, timeline and sink writes all happen under one lock, which makes
/// `on_interrupt` atomic with respect to `enqueue`.
pub struct PlaybackScheduler {
    clock: Arc<dyn Clock>,
    sink: Arc<dyn AudioSink>,
    state: Mutex<SchedulerState>,
    speaking: watch::Sender<bool>,
}

impl PlaybackScheduler {
    pub fn new(clock: Arc<dyn Clock>, sink: Arc<dyn AudioSink>) -> Self {
        let now = clock.now();
        let (speaking, _) = watch::channel(false);
        Self {
            clock,
            sink,
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                last_scheduled_end: now,
                next_id: 0,
                accepting: true,
            }),
            speaking,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule `buffer` right after everything already queued.
    ///
    /// Returns `None` when the scheduler is stopped or the buffer is empty.
    pub fn enqueue(&self, buffer: AudioBuffer) -> Result<Option<ScheduledSlot>, AudioError> {
        let duration = buffer.duration();
        let mut state = self.lock();
        if !state.accepting || buffer.is_empty() {
            return Ok(None);
        }

        let now = self.clock.now();
        Self::retire_finished(&mut state, now);

        let start = now.max(state.last_scheduled_end);
        let end = start + duration;

        self.sink.write(&buffer.to_mono(), buffer.sample_rate)?;

        let id = state.next_id;
        state.next_id += 1;
        state.queue.push_back(PlaybackItem {
            id,
            buffer,
            start,
            duration,
        });
        state.last_scheduled_end = end;

        log::debug!(
            "🔊 Scheduled item {} at {:?} for {:?} ({} queued)",
            id,
            start,
            duration,
            state.queue.len()
        );
        self.publish_speaking(true);

        Ok(Some(ScheduledSlot { id, start, end }))
    }

    /// Stop the current item and discard everything queued.
    ///
    /// Returns how many items were cancelled.
    pub fn on_interrupt(&self) -> usize {
        let mut state = self.lock();
        let cancelled = self.cancel_locked(&mut state);
        if cancelled > 0 {
            log::info!("🛑 Playback interrupted, cancelled {} item(s)", cancelled);
        }
        cancelled
    }

    /// Render-clock step: retire played items and report what is playing now
    pub fn poll(&self) -> Option<ActiveItem> {
        let mut state = self.lock();
        let now = self.clock.now();
        Self::retire_finished(&mut state, now);

        self.publish_speaking(!state.queue.is_empty());

        state
            .queue
            .front()
            .filter(|item| item.start <= now)
            .map(|item| ActiveItem {
                id: item.id,
                start: item.start,
                elapsed: now - item.start,
                remaining: item.end() - now,
            })
    }

    /// Cancel everything and refuse further buffers until `reset`
    pub fn stop(&self) {
        let mut state = self.lock();
        state.accepting = false;
        let cancelled = self.cancel_locked(&mut state);
        log::debug!("🔊 Playback stopped, cancelled {} item(s)", cancelled);
    }

    /// Accept buffers again on a fresh timeline
    pub fn reset(&self) {
        let mut state = self.lock();
        state.queue.clear();
        state.last_scheduled_end = self.clock.now();
        state.accepting = true;
        self.publish_speaking(false);
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    /// Items not yet fully played, in playback order
    pub fn pending(&self) -> Vec<ScheduledSlot> {
        self.lock()
            .queue
            .iter()
            .map(|item| ScheduledSlot {
                id: item.id,
                start: item.start,
                end: item.end(),
            })
            .collect()
    }

    pub fn last_scheduled_end(&self) -> Duration {
        self.lock().last_scheduled_end
    }

    /// Clear queue, sink and timeline. The caller holds the state lock, so no
    /// `enqueue` can land between the clear and whatever the caller does next.
    fn cancel_locked(&self, state: &mut SchedulerState) -> usize {
        let now = self.clock.now();
        Self::retire_finished(state, now);

        let cancelled = state.queue.len();
        state.queue.clear();
        self.sink.clear();
        state.last_scheduled_end = now;
        self.publish_speaking(false);
        cancelled
    }

    fn retire_finished(state: &mut SchedulerState, now: Duration) {
        while state.queue.front().is_some_and(|item| item.end() <= now) {
            if let Some(item) = state.queue.pop_front() {
                log::trace!("🔊 Item {} finished at {:?}", item.id, item.end());
            }
        }
    }

    fn publish_speaking(&self, speaking: bool) {
        self.speaking.send_if_modified(|current| {
            if *current != speaking {
                *current = speaking;
                true
            } else {
                false
            }
        });
    }
}
