//! Configuration for a presence session.

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for one presence session. Constructed by the host
/// application; there is no file or CLI loading here.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Minimum gap between network writes, in milliseconds.
    pub throttle_ms: u64,
    /// After this much time without local input, broadcasts are
    /// suppressed so a frozen cursor is not re-written forever.
    pub idle_threshold_ms: u64,
    /// Cursor movement below this distance (per axis, pixels) is not
    /// worth a write on its own.
    pub min_change_threshold_px: f64,
    /// Whether broadcast rows carry a velocity for dead-reckoning
    /// interpolation on the receiving side.
    pub include_velocity: bool,
    /// Whether `stop()` deletes the local row (explicit leave).
    pub leave_on_stop: bool,
    /// Buffer size of the session event channel.
    pub event_buffer: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 80,
            idle_threshold_ms: 5_000,
            min_change_threshold_px: 4.0,
            include_velocity: true,
            leave_on_stop: true,
            event_buffer: 256,
        }
    }
}
