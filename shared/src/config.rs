//! Tunables for a mesh session.

use crate::MAX_INPUT_SLOTS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Must match exactly between peers.
    pub app_version: u32,
    /// Opaque build signature, compared byte for byte.
    pub app_signature: Vec<u8>,
    /// Bits each input value occupies on the wire (1..=32).
    pub input_bits: u8,
    /// Number of input slots handed out (1..=MAX_INPUT_SLOTS).
    pub max_slots: usize,
    pub tick_rate: u32,
    /// Frames between local input collection and local simulation.
    pub local_frame_delay: i32,

    /// Window the accused peer has to dispute a disconnect report.
    pub dispute_timeout: Duration,
    /// How long a tentative migration waits for contradicting reports.
    pub migration_grace: Duration,
    /// How long a member waits for the elected coordinator's migration message.
    pub host_migration_timeout: Duration,

    /// Frames a remote slot may hold back NCF before its peer is flagged.
    pub remote_stall_frames: i32,
    /// Frames our own slot may hold back NCF before it is treated as a bug.
    pub local_stall_frames: i32,
    pub max_frames_ahead: i32,
    pub max_buffered_migration_messages: usize,
    pub max_queued_messages: usize,
    pub desync_dump_max_frames: usize,
    pub desync_dump_max_bytes: usize,
    /// Trim floor lag that indicates a bug rather than a slow network.
    pub retention_backstop_frames: i32,

    /// Max fractional speed-up or slow-down of the member clock.
    pub clock_panic_rate: f64,
    /// Behind by more than this many frames, the member clock jumps forward.
    pub clock_snap_frames: f64,
    pub max_catch_up_ticks: u32,

    /// Reject joins that do not present a registered side-channel token.
    pub require_side_channel: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            app_version: 1,
            app_signature: Vec::new(),
            input_bits: 8,
            max_slots: 4,
            tick_rate: 60,
            local_frame_delay: 2,
            dispute_timeout: Duration::from_secs(12),
            migration_grace: Duration::from_millis(500),
            host_migration_timeout: Duration::from_secs(10),
            remote_stall_frames: 60 * 10,
            local_stall_frames: 60 * 60,
            max_frames_ahead: 60 * 30,
            max_buffered_migration_messages: 16,
            max_queued_messages: 256,
            desync_dump_max_frames: 30,
            desync_dump_max_bytes: 512 * 1024,
            retention_backstop_frames: 60 * 120,
            clock_panic_rate: 0.1,
            clock_snap_frames: 30.0,
            max_catch_up_ticks: 10,
            require_side_channel: false,
        }
    }
}

impl MeshConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    /// Clamps out-of-range values into something usable.
    pub fn sanitized(mut self) -> Self {
        self.input_bits = self.input_bits.clamp(1, 32);
        self.max_slots = self.max_slots.clamp(1, MAX_INPUT_SLOTS);
        self.tick_rate = self.tick_rate.max(1);
        self.local_frame_delay = self.local_frame_delay.max(0);
        self.desync_dump_max_frames = self.desync_dump_max_frames.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = MeshConfig::default();
        assert!(config.dispute_timeout > Duration::from_secs(5));
        assert!(config.local_stall_frames > config.remote_stall_frames);
        assert!(config.max_slots <= MAX_INPUT_SLOTS);
    }

    #[test]
    fn test_sanitize_clamps() {
        let config = MeshConfig {
            input_bits: 0,
            max_slots: 99,
            tick_rate: 0,
            local_frame_delay: -3,
            ..MeshConfig::default()
        }
        .sanitized();
        assert_eq!(config.input_bits, 1);
        assert_eq!(config.max_slots, MAX_INPUT_SLOTS);
        assert_eq!(config.tick_rate, 1);
        assert_eq!(config.local_frame_delay, 0);
    }

    #[test]
    fn test_config_serializes() {
        let config = MeshConfig::default();
        let bytes = bincode::serialize(&config).unwrap();
        let back: MeshConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.max_slots, config.max_slots);
        assert_eq!(back.dispute_timeout, config.dispute_timeout);
    }
}
