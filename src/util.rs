//! Small helpers shared across modules.

use std::time::Duration;

/// Unity gain expressed in decibels.
pub const ZERO_DB: f32 = 0.0;

/// Lossy conversion into `f32` for values that only feed DSP arithmetic.
pub trait ToF32 {
    fn to_f32_lossy(self) -> f32;
}

impl ToF32 for u32 {
    #[expect(clippy::cast_precision_loss)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

impl ToF32 for usize {
    #[expect(clippy::cast_precision_loss)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

/// Fractional seconds of `duration`, rounded down to whole milliseconds.
///
/// Offsets are persisted as seconds; millisecond precision is plenty for
/// resuming and keeps the stored JSON readable.
#[must_use]
pub fn as_secs_rounded(duration: Duration) -> f64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    #[expect(clippy::cast_precision_loss)]
    let millis = millis as f64;
    millis / 1000.0
}
