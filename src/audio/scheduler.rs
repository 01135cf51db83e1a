//! Gapless playback scheduling with barge-in flush
//!
//! Buffers are laid back to back on the output device's timeline. The
//! cursor only moves forward, except on [`PlaybackScheduler::flush`],
//! which halts everything in flight and lets the next buffer start "now".

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio::playback::{OutputDevice, VoiceId};
use crate::codec::DecodedBuffer;
use crate::error::AudioError;

/// Buffers currently scheduled or playing, keyed by a scheduler-local id.
/// The device id is filled in once `schedule` returns.
type ActiveSet = Arc<Mutex<HashMap<u64, Option<VoiceId>>>>;

/// Per-session playback scheduler
pub struct PlaybackScheduler<O: OutputDevice> {
    output: Arc<O>,
    next_start_time: f64,
    active: ActiveSet,
    next_key: u64,
}

impl<O: OutputDevice> PlaybackScheduler<O> {
    pub fn new(output: Arc<O>) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_key: 0,
        }
    }

    /// Schedule a buffer right after the previous one, or now if the
    /// timeline has caught up. Returns the start time used.
    pub fn schedule_buffer(&mut self, buffer: &DecodedBuffer) -> Result<f64, AudioError> {
        let now = self.output.now();
        let start_time = self.next_start_time.max(now);

        let key = self.next_key;
        self.next_key += 1;
        self.active.lock().insert(key, None);

        let active = self.active.clone();
        let on_ended = Box::new(move || {
            active.lock().remove(&key);
        });

        match self
            .output
            .schedule(buffer.shared_samples(), buffer.sample_rate(), start_time, on_ended)
        {
            Ok(id) => {
                // The hook may already have fired for a very short buffer
                if let Some(slot) = self.active.lock().get_mut(&key) {
                    *slot = Some(id);
                }
            }
            Err(e) => {
                self.active.lock().remove(&key);
                return Err(e);
            }
        }

        self.next_start_time = start_time + buffer.duration();
        tracing::trace!(
            "Scheduled {:.3}s buffer at {:.3} (now {:.3})",
            buffer.duration(),
            start_time,
            now
        );
        Ok(start_time)
    }

    /// Halt every active buffer and reset the cursor
    pub fn flush(&mut self) {
        let drained: Vec<VoiceId> = self
            .active
            .lock()
            .drain()
            .filter_map(|(_, id)| id)
            .collect();

        for id in &drained {
            self.output.stop(*id);
        }
        self.next_start_time = 0.0;

        if !drained.is_empty() {
            tracing::debug!("Flushed {} buffers", drained.len());
        }
    }

    /// Earliest time the next buffer may begin
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Output device with a hand-driven clock
    #[derive(Default)]
    pub(crate) struct ManualOutput {
        pub clock: Mutex<f64>,
        pub scheduled: Mutex<Vec<(VoiceId, f64, f64)>>,
        pub stopped: Mutex<Vec<VoiceId>>,
        hooks: Mutex<HashMap<VoiceId, crate::audio::playback::EndedHook>>,
        next_id: Mutex<VoiceId>,
    }

    impl ManualOutput {
        pub fn advance(&self, seconds: f64) {
            *self.clock.lock() += seconds;
        }

        /// Fire the completion hook as the device would at end of playback
        pub fn finish(&self, id: VoiceId) {
            let hook = self.hooks.lock().remove(&id);
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    impl OutputDevice for ManualOutput {
        fn now(&self) -> f64 {
            *self.clock.lock()
        }

        fn schedule(
            &self,
            samples: Arc<[f32]>,
            sample_rate: u32,
            start_time: f64,
            on_ended: crate::audio::playback::EndedHook,
        ) -> Result<VoiceId, AudioError> {
            let id = {
                let mut next = self.next_id.lock();
                *next += 1;
                *next
            };
            let duration = samples.len() as f64 / sample_rate as f64;
            self.scheduled.lock().push((id, start_time, duration));
            self.hooks.lock().insert(id, on_ended);
            Ok(id)
        }

        fn stop(&self, id: VoiceId) {
            self.stopped.lock().push(id);
            self.finish(id);
        }

        fn stop_all(&self) {
            let ids: Vec<VoiceId> = self.hooks.lock().keys().copied().collect();
            for id in ids {
                self.stop(id);
            }
        }
    }

    fn buffer(seconds: f64) -> DecodedBuffer {
        DecodedBuffer::new(vec![0.0; (seconds * 1000.0).round() as usize], 1000)
    }

    #[test]
    fn test_back_to_back_scheduling() {
        let output = Arc::new(ManualOutput::default());
        let mut scheduler = PlaybackScheduler::new(output.clone());

        assert_eq!(scheduler.schedule_buffer(&buffer(0.5)).unwrap(), 0.0);
        assert_eq!(scheduler.schedule_buffer(&buffer(0.25)).unwrap(), 0.5);
        assert_eq!(scheduler.schedule_buffer(&buffer(1.0)).unwrap(), 0.75);
        assert_eq!(scheduler.active_count(), 3);
        assert!((scheduler.next_start_time() - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_late_buffer_starts_now() {
        let output = Arc::new(ManualOutput::default());
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule_buffer(&buffer(0.5)).unwrap();
        output.advance(2.0);
        assert_eq!(scheduler.schedule_buffer(&buffer(0.5)).unwrap(), 2.0);
    }

    #[test]
    fn test_completion_hook_removes_buffer() {
        let output = Arc::new(ManualOutput::default());
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule_buffer(&buffer(0.5)).unwrap();
        scheduler.schedule_buffer(&buffer(0.5)).unwrap();
        assert_eq!(scheduler.active_count(), 2);

        let (first, _, _) = output.scheduled.lock()[0];
        output.finish(first);
        assert_eq!(scheduler.active_count(), 1);
    }

    #[test]
    fn test_flush_stops_active_and_resets_cursor() {
        let output = Arc::new(ManualOutput::default());
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule_buffer(&buffer(1.0)).unwrap();
        scheduler.schedule_buffer(&buffer(1.0)).unwrap();
        output.advance(0.3);

        scheduler.flush();
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(output.stopped.lock().len(), 2);
        assert_eq!(scheduler.next_start_time(), 0.0);

        // Never inherits the pre-flush cursor of 2.0
        let start = scheduler.schedule_buffer(&buffer(0.5)).unwrap();
        assert!((start - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_flush_skips_finished_buffers() {
        let output = Arc::new(ManualOutput::default());
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler.schedule_buffer(&buffer(0.1)).unwrap();
        let (first, _, _) = output.scheduled.lock()[0];
        output.finish(first);

        scheduler.flush();
        assert!(output.stopped.lock().is_empty());
    }

    proptest! {
        #[test]
        fn prop_no_overlap_no_gap(durations in proptest::collection::vec(1u32..2000, 1..40)) {
            let output = Arc::new(ManualOutput::default());
            let mut scheduler = PlaybackScheduler::new(output.clone());

            let mut previous: Option<(f64, f64)> = None;
            for ms in durations {
                let b = buffer(ms as f64 / 1000.0);
                let start = scheduler.schedule_buffer(&b).unwrap();
                if let Some((prev_start, prev_duration)) = previous {
                    // Clock never advanced, so each buffer starts exactly where the last ended
                    prop_assert!((start - (prev_start + prev_duration)).abs() < 1e-9);
                }
                previous = Some((start, b.duration()));
            }
        }

        #[test]
        fn prop_start_times_respect_clock(
            steps in proptest::collection::vec((1u32..500, 0u32..800), 1..40)
        ) {
            let output = Arc::new(ManualOutput::default());
            let mut scheduler = PlaybackScheduler::new(output.clone());

            let mut previous_end = 0.0f64;
            for (ms, advance_ms) in steps {
                output.advance(advance_ms as f64 / 1000.0);
                let b = buffer(ms as f64 / 1000.0);
                let start = scheduler.schedule_buffer(&b).unwrap();
                prop_assert!(start >= output.now() - 1e-12);
                prop_assert!(start >= previous_end - 1e-9);
                previous_end = start + b.duration();
            }
        }
    }
}
