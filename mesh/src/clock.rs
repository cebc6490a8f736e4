//! Frame pacing.
//!
//! The coordinator advances exactly one frame per update. Members estimate the
//! coordinator's input frame from the last frame it sent plus half the round
//! trip, and run slightly fast or slow to converge on it. A member that falls
//! far behind catches up in bounded bursts; a member that is ahead slows down
//! but never steps back.

use shared::{Frame, MeshConfig};
use std::time::Duration;

/// Rate change per frame of error before clamping to the panic rate.
const RATE_GAIN_PER_FRAME: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
struct Observation {
    /// Estimated coordinator frame at `at`.
    frame: f64,
    at: Duration,
}

#[derive(Debug)]
pub struct FrameClock {
    tick: Duration,
    panic_rate: f64,
    snap_frames: f64,
    max_catch_up: u32,
    accumulated: f64,
    now: Duration,
    observation: Option<Observation>,
}

impl FrameClock {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            tick: config.tick_duration(),
            panic_rate: config.clock_panic_rate,
            snap_frames: config.clock_snap_frames,
            max_catch_up: config.max_catch_up_ticks.max(1),
            accumulated: 0.0,
            now: Duration::ZERO,
            observation: None,
        }
    }

    fn frames_in(&self, span: Duration) -> f64 {
        span.as_secs_f64() / self.tick.as_secs_f64()
    }

    /// Records that the coordinator reported `frame` over a link with `rtt`.
    pub fn observe(&mut self, frame: Frame, rtt: Duration) {
        let estimate = frame as f64 + self.frames_in(rtt / 2);
        let newer = self
            .observation
            .map_or(true, |seen| estimate >= seen.frame + self.frames_in(self.now - seen.at));
        if newer {
            self.observation = Some(Observation {
                frame: estimate,
                at: self.now,
            });
        }
    }

    /// Estimated coordinator frame right now, if it has ever been observed.
    pub fn estimate(&self) -> Option<f64> {
        self.observation
            .map(|seen| seen.frame + self.frames_in(self.now - seen.at))
    }

    pub fn forget(&mut self) {
        self.observation = None;
    }

    fn drain(&mut self, budget: u32) -> u32 {
        let whole = self.accumulated.floor().max(0.0);
        let ticks = (whole as u32).min(budget);
        self.accumulated -= ticks as f64;
        ticks
    }

    /// The coordinator's clock is the update loop itself.
    pub fn coordinator_ticks(&mut self, elapsed: Duration) -> u32 {
        self.now += elapsed;
        self.accumulated = 0.0;
        1
    }

    /// Ticks a member at `local_frame` should run after `elapsed`.
    pub fn member_ticks(&mut self, local_frame: Frame, elapsed: Duration) -> u32 {
        self.now += elapsed;
        let target = match self.estimate() {
            Some(target) => target,
            None => {
                self.accumulated += self.frames_in(elapsed);
                return self.drain(self.max_catch_up);
            }
        };

        let behind = target - local_frame as f64;
        if behind > self.snap_frames {
            self.accumulated = 0.0;
            return (behind.ceil() as u32).min(self.max_catch_up);
        }

        let rate = 1.0 + (behind * RATE_GAIN_PER_FRAME).clamp(-self.panic_rate, self.panic_rate);
        self.accumulated += self.frames_in(elapsed) * rate;
        self.drain(self.max_catch_up)
    }
}
