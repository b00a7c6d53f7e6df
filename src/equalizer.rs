//! Three-band equalizer.
//!
//! The equalizer is a chain of three second-order IIR filters designed after
//! the Audio EQ Cookbook by Robert Bristow-Johnson:
//! * bass: low shelf at 200 Hz
//! * mid: peaking at 1 kHz
//! * treble: high shelf at 3 kHz
//!
//! Gains are shared between the audio thread and the session through an
//! [`EqualizerHandle`]. The filter polls them once per block and recomputes
//! its coefficients when they changed, so gains can be adjusted while
//! playing without rebuilding the chain.
//!
//! # Example
//!
//! ```no_run
//! use murattal::equalizer::{equalizer, Band, EqualizerHandle};
//!
//! let handle = EqualizerHandle::default();
//! let filtered = equalizer(source, handle.clone());
//! handle.set_gain(Band::Bass, 6.0);
//! ```

use std::{
    f32::consts::{PI, SQRT_2},
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use rodio::{source::SeekError, Source};

use crate::{
    error::{Error, Result},
    util::{ToF32, ZERO_DB},
};

/// Largest boost or cut of a band in dB.
pub const MAX_GAIN_DB: f32 = 12.0;

/// Quality factor of the peaking band.
const PEAKING_Q: f32 = 1.0;

/// Samples between two polls of the shared gains.
const POLL_INTERVAL: usize = 512;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Band {
    Bass,
    Mid,
    Treble,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::Bass, Band::Mid, Band::Treble];

    /// Center or corner frequency in Hz.
    #[must_use]
    pub fn frequency(self) -> f32 {
        match self {
            Self::Bass => 200.0,
            Self::Mid => 1_000.0,
            Self::Treble => 3_000.0,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Bass => 0,
            Self::Mid => 1,
            Self::Treble => 2,
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bass => write!(f, "bass"),
            Self::Mid => write!(f, "mid"),
            Self::Treble => write!(f, "treble"),
        }
    }
}

impl FromStr for Band {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bass" => Ok(Self::Bass),
            "mid" => Ok(Self::Mid),
            "treble" => Ok(Self::Treble),
            other => Err(Error::invalid_argument(format!("unknown band {other}"))),
        }
    }
}

/// Named gain settings.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Preset {
    #[default]
    Flat,
    BassBoost,
    /// Lifts the range of the human voice.
    Vocal,
    Treble,
}

impl Preset {
    /// Gains in dB for bass, mid and treble.
    #[must_use]
    pub fn gains(self) -> [f32; 3] {
        match self {
            Self::Flat => [ZERO_DB; 3],
            Self::BassBoost => [6.0, 0.0, -1.0],
            Self::Vocal => [-2.0, 4.0, 2.0],
            Self::Treble => [-1.0, 0.0, 6.0],
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::BassBoost => write!(f, "bass-boost"),
            Self::Vocal => write!(f, "vocal"),
            Self::Treble => write!(f, "treble"),
        }
    }
}

impl FromStr for Preset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flat" => Ok(Self::Flat),
            "bass-boost" => Ok(Self::BassBoost),
            "vocal" => Ok(Self::Vocal),
            "treble" => Ok(Self::Treble),
            other => Err(Error::invalid_argument(format!("unknown preset {other}"))),
        }
    }
}

/// Shared, live-adjustable band gains.
///
/// Cloning yields another handle to the same gains.
#[derive(Clone, Debug, Default)]
pub struct EqualizerHandle {
    // `f32` bit patterns; 0 is 0.0 dB.
    gains: Arc<[AtomicU32; 3]>,
}

impl EqualizerHandle {
    #[must_use]
    pub fn new(gains: [f32; 3]) -> Self {
        let handle = Self::default();
        handle.set_gains(gains);
        handle
    }

    /// Sets the gain of `band`, clamped to `±MAX_GAIN_DB`. Returns the
    /// gain that was applied.
    pub fn set_gain(&self, band: Band, db: f32) -> f32 {
        let db = if db.is_nan() {
            ZERO_DB
        } else {
            db.clamp(-MAX_GAIN_DB, MAX_GAIN_DB)
        };
        self.gains[band.index()].store(db.to_bits(), Ordering::Relaxed);
        db
    }

    pub fn set_gains(&self, gains: [f32; 3]) {
        for (band, db) in Band::ALL.into_iter().zip(gains) {
            self.set_gain(band, db);
        }
    }

    pub fn apply_preset(&self, preset: Preset) {
        debug!("applying equalizer preset {preset}");
        self.set_gains(preset.gains());
    }

    #[must_use]
    pub fn gain(&self, band: Band) -> f32 {
        f32::from_bits(self.gains[band.index()].load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn gains(&self) -> [f32; 3] {
        Band::ALL.map(|band| self.gain(band))
    }
}

/// Normalized biquad coefficients.
#[derive(Copy, Clone, Debug, PartialEq)]
struct Coefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl Coefficients {
    fn new(band: Band, gain_db: f32, sample_rate: u32) -> Self {
        let a = f32::powf(10.0, gain_db / 40.0);
        let w0 = 2.0 * PI * band.frequency() / sample_rate.to_f32_lossy();
        let (sin, cos) = w0.sin_cos();

        let (b0, b1, b2, a0, a1, a2) = match band {
            Band::Mid => {
                let alpha = sin / (2.0 * PEAKING_Q);
                (
                    1.0 + alpha * a,
                    -2.0 * cos,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cos,
                    1.0 - alpha / a,
                )
            }
            Band::Bass => {
                // Shelf slope of 1.
                let beta = 2.0 * a.sqrt() * sin / SQRT_2;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos + beta),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
                    a * ((a + 1.0) - (a - 1.0) * cos - beta),
                    (a + 1.0) + (a - 1.0) * cos + beta,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos),
                    (a + 1.0) + (a - 1.0) * cos - beta,
                )
            }
            Band::Treble => {
                let beta = 2.0 * a.sqrt() * sin / SQRT_2;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos + beta),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
                    a * ((a + 1.0) + (a - 1.0) * cos - beta),
                    (a + 1.0) - (a - 1.0) * cos + beta,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos),
                    (a + 1.0) - (a - 1.0) * cos - beta,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Direct form I history of one band on one channel.
#[derive(Copy, Clone, Debug, Default)]
struct State {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl State {
    #[inline]
    fn process(&mut self, c: &Coefficients, x: f32) -> f32 {
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// Creates an equalizer filter over `input` driven by `handle`.
pub fn equalizer<I>(input: I, handle: EqualizerHandle) -> Equalizer<I>
where
    I: Source<Item = f32>,
{
    let sample_rate = input.sample_rate();
    let channels = usize::from(input.channels()).max(1);
    let applied = handle.gains();

    Equalizer {
        input,
        handle,
        coefficients: coefficients(applied, sample_rate),
        applied,
        sample_rate,
        states: vec![[State::default(); 3]; channels],
        position: 0,
    }
}

fn coefficients(gains: [f32; 3], sample_rate: u32) -> [Coefficients; 3] {
    Band::ALL.map(|band| Coefficients::new(band, gains[band.index()], sample_rate))
}

/// Audio filter applying the three equalizer bands in series.
#[derive(Clone, Debug)]
pub struct Equalizer<I>
where
    I: Source<Item = f32>,
{
    input: I,
    handle: EqualizerHandle,

    /// Gains the coefficients were computed for.
    applied: [f32; 3],
    coefficients: [Coefficients; 3],
    sample_rate: u32,

    /// Per-channel filter histories.
    states: Vec<[State; 3]>,
    position: usize,
}

impl<I> Equalizer<I>
where
    I: Source<Item = f32>,
{
    #[inline]
    pub fn inner(&self) -> &I {
        &self.input
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut I {
        &mut self.input
    }

    fn poll_gains(&mut self) {
        let gains = self.handle.gains();
        let sample_rate = self.input.sample_rate();
        if gains != self.applied || sample_rate != self.sample_rate {
            self.coefficients = coefficients(gains, sample_rate);
            self.applied = gains;
            self.sample_rate = sample_rate;
        }
    }
}

impl<I> Iterator for Equalizer<I>
where
    I: Source<Item = f32>,
{
    type Item = f32;

    #[inline]
    fn next(&mut self) -> Option<f32> {
        let sample = self.input.next()?;

        if self.position % POLL_INTERVAL == 0 {
            self.poll_gains();
        }

        let channel = self.position % self.states.len();
        self.position = self.position.wrapping_add(1);

        // Flat bands are bypassed to keep the signal bit-exact.
        if self.applied.iter().all(|&gain| gain == ZERO_DB) {
            return Some(sample);
        }

        let states = &mut self.states[channel];
        let mut output = sample;
        for (state, coefficients) in states.iter_mut().zip(&self.coefficients) {
            output = state.process(coefficients, output);
        }

        Some(output)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

impl<I> ExactSizeIterator for Equalizer<I> where I: Source<Item = f32> + ExactSizeIterator {}

impl<I> Source for Equalizer<I>
where
    I: Source<Item = f32>,
{
    #[inline]
    fn current_frame_len(&self) -> Option<usize> {
        self.input.current_frame_len()
    }

    #[inline]
    fn channels(&self) -> u16 {
        self.input.channels()
    }

    #[inline]
    fn sample_rate(&self) -> u32 {
        self.input.sample_rate()
    }

    #[inline]
    fn total_duration(&self) -> Option<Duration> {
        self.input.total_duration()
    }

    /// Seeks the inner source and clears the filter histories.
    #[inline]
    fn try_seek(&mut self, pos: Duration) -> std::result::Result<(), SeekError> {
        self.input.try_seek(pos)?;

        for states in &mut self.states {
            *states = [State::default(); 3];
        }
        self.position = 0;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rodio::source::SineWave;

    use super::*;

    fn peak(samples: impl Iterator<Item = f32>) -> f32 {
        samples.fold(0.0, |peak, sample| f32::max(peak, sample.abs()))
    }

    /// Peak of the second half of one second of a sine at `frequency`.
    fn filtered_peak(frequency: f32, handle: &EqualizerHandle) -> f32 {
        let source = SineWave::new(frequency).take_duration(Duration::from_secs(1));
        let samples: Vec<f32> = equalizer(source, handle.clone()).collect();
        peak(samples[samples.len() / 2..].iter().copied())
    }

    #[test]
    fn flat_is_transparent() {
        let handle = EqualizerHandle::default();
        let input: Vec<f32> = SineWave::new(440.0)
            .take_duration(Duration::from_millis(100))
            .collect();
        let output: Vec<f32> = equalizer(
            SineWave::new(440.0).take_duration(Duration::from_millis(100)),
            handle,
        )
        .collect();
        assert_eq!(input, output);
    }

    #[test]
    fn gains_are_clamped() {
        let handle = EqualizerHandle::default();
        assert!((handle.set_gain(Band::Bass, 30.0) - MAX_GAIN_DB).abs() < f32::EPSILON);
        assert!((handle.set_gain(Band::Treble, -30.0) + MAX_GAIN_DB).abs() < f32::EPSILON);
        assert!((handle.set_gain(Band::Mid, f32::NAN)).abs() < f32::EPSILON);
    }

    #[test]
    fn bass_boost_lifts_low_frequencies_only() {
        let handle = EqualizerHandle::default();
        handle.set_gain(Band::Bass, MAX_GAIN_DB);

        assert!(filtered_peak(50.0, &handle) > 2.0);
        let high = filtered_peak(8_000.0, &handle);
        assert!((0.8..1.25).contains(&high), "high band changed to {high}");
    }

    #[test]
    fn mid_cut_attenuates_center_frequency() {
        let handle = EqualizerHandle::default();
        handle.set_gain(Band::Mid, -MAX_GAIN_DB);
        assert!(filtered_peak(1_000.0, &handle) < 0.5);
    }

    #[test]
    fn gains_apply_while_running() {
        let handle = EqualizerHandle::default();
        let mut filter = equalizer(SineWave::new(50.0), handle.clone());

        let before = peak(filter.by_ref().take(48_000));
        handle.set_gain(Band::Bass, MAX_GAIN_DB);
        let _ = filter.by_ref().take(24_000).count();
        let after = peak(filter.by_ref().take(24_000));

        assert!(after > before * 2.0, "{after} vs {before}");
    }

    #[test]
    fn presets_parse() {
        let preset: Preset = "bass-boost".parse().unwrap();
        assert_eq!(preset, Preset::BassBoost);
        let handle = EqualizerHandle::default();
        handle.apply_preset(Preset::Vocal);
        assert_eq!(handle.gains(), Preset::Vocal.gains());
    }
}
