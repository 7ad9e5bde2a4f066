//! Dead-reckoning interpolation for remote cursors.
//!
//! Network writes arrive tens of milliseconds apart at best; renderers
//! run at 60+ Hz. Predicting position from the last known sample plus
//! velocity bridges the gap, and linear damping brings a cursor to a
//! full stop once updates stop arriving (remote tab backgrounded,
//! participant idle) instead of extrapolating off-screen.

use crate::detect::CursorPos;
use crate::table::CursorEntry;

/// Velocity in pixels per second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
}

/// A predicted cursor sample. Never stored; rendering input only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predicted {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

/// Milliseconds of extrapolation after which velocity is fully damped.
const DAMPING_WINDOW_MS: f64 = 2_000.0;

/// Predict a cursor's current position from its last known position,
/// velocity, and the time elapsed since that sample.
///
/// Both the extrapolation and the damping are driven by the elapsed
/// fraction of the damping window: position advances by that fraction
/// of the velocity, and the velocity decays linearly to a full stop at
/// the end of the window.
pub fn predict(last: CursorPos, velocity: Velocity, elapsed_ms: f64) -> Predicted {
    let progress = elapsed_ms / DAMPING_WINDOW_MS;
    let damping = (1.0 - progress).max(0.0);
    Predicted {
        x: last.x + velocity.vx * progress,
        y: last.y + velocity.vy * progress,
        vx: velocity.vx * damping,
        vy: velocity.vy * damping,
    }
}

/// Predicted view of a stored cursor entry at wall-clock `now_ms`.
///
/// Entries without a velocity are returned as-is. The returned entry
/// has its `interpolated` flag set so consumers can tell a derived
/// sample from a real one; the stored table is never mutated.
pub fn predict_entry(entry: &CursorEntry, now_ms: u64) -> CursorEntry {
    let (Some(vx), Some(vy)) = (entry.row.vx, entry.row.vy) else {
        return entry.clone();
    };
    if vx == 0.0 && vy == 0.0 {
        return entry.clone();
    }

    let elapsed_ms = now_ms.saturating_sub(entry.last_update_ms) as f64;
    let predicted = predict(
        CursorPos {
            x: entry.row.x,
            y: entry.row.y,
        },
        Velocity { vx, vy },
        elapsed_ms,
    );

    let mut out = entry.clone();
    out.row.x = predicted.x;
    out.row.y = predicted.y;
    out.row.vx = Some(predicted.vx);
    out.row.vy = Some(predicted.vy);
    out.interpolated = true;
    out
}
