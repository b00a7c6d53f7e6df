//! Analyser tap for visualisations.
//!
//! [`analyser`] wraps a source and passes every sample through unchanged,
//! while copying a mono downmix into a bounded ring buffer shared with any
//! number of [`AnalyserHandle`]s. Handles compute magnitude spectra and
//! signal levels on demand, outside of the audio thread.
//!
//! The audio thread never waits on a handle: when the ring buffer is locked
//! by a reader, the pending block is dropped instead.

use std::{
    collections::VecDeque,
    f32::consts::PI,
    sync::{Arc, Mutex, TryLockError},
    time::Duration,
};

use rodio::{source::SeekError, Source};

use crate::util::ToF32;

/// Number of mono samples kept for analysis.
pub const WINDOW_LEN: usize = 2048;

/// Frames collected before they are published to handles.
const BLOCK_LEN: usize = 256;

#[derive(Debug)]
struct Shared {
    samples: VecDeque<f32>,
    sample_rate: u32,
}

/// Read side of the analyser.
///
/// Cloning yields another reader of the same tap.
#[derive(Clone, Debug)]
pub struct AnalyserHandle {
    shared: Arc<Mutex<Shared>>,
}

impl Default for AnalyserHandle {
    fn default() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                samples: VecDeque::with_capacity(WINDOW_LEN),
                sample_rate: 44_100,
            })),
        }
    }
}

impl AnalyserHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the most recent samples, oldest first.
    fn window(&self) -> (Vec<f32>, u32) {
        match self.shared.lock() {
            Ok(shared) => (shared.samples.iter().copied().collect(), shared.sample_rate),
            Err(e) => {
                error!("analyser poisoned: {e}");
                (Vec::new(), 0)
            }
        }
    }

    /// Sample rate of the signal last seen by the tap.
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.window().1
    }

    /// Root mean square level of the current window, in `[0.0, 1.0]` for
    /// unclipped signals.
    #[must_use]
    pub fn rms(&self) -> f32 {
        let (samples, _) = self.window();
        if samples.is_empty() {
            return 0.0;
        }

        let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
        (sum / samples.len().to_f32_lossy()).sqrt()
    }

    /// Magnitude spectrum of the current window in `bins` linearly spaced
    /// bins from 0 Hz up to the Nyquist frequency.
    ///
    /// A full-scale sine yields a magnitude of about 1.0 in its bin. Returns
    /// all zeroes before any audio passed the tap.
    #[must_use]
    pub fn frequency_data(&self, bins: usize) -> Vec<f32> {
        let (samples, _) = self.window();
        let n = samples.len();
        if n < 2 {
            return vec![0.0; bins];
        }

        // Hann window, then a direct DFT over the requested bins.
        let len = n.to_f32_lossy();
        let windowed: Vec<f32> = samples
            .iter()
            .enumerate()
            .map(|(i, sample)| {
                let w = 0.5 - 0.5 * f32::cos(2.0 * PI * i.to_f32_lossy() / (len - 1.0));
                sample * w
            })
            .collect();

        let half = n / 2;
        (0..bins)
            .map(|bin| {
                let k = (bin * half / bins.max(1)).to_f32_lossy();
                let (mut re, mut im) = (0.0f32, 0.0f32);
                for (i, sample) in windowed.iter().enumerate() {
                    let phase = 2.0 * PI * k * i.to_f32_lossy() / len;
                    re += sample * phase.cos();
                    im -= sample * phase.sin();
                }
                // Hann has a coherent gain of 0.5.
                4.0 * (re * re + im * im).sqrt() / len
            })
            .collect()
    }

    /// Frequency in Hz at the center of `bin` out of `bins`.
    #[must_use]
    pub fn bin_frequency(&self, bin: usize, bins: usize) -> f32 {
        let nyquist = self.sample_rate().to_f32_lossy() / 2.0;
        bin.to_f32_lossy() * nyquist / bins.max(1).to_f32_lossy()
    }

    fn publish(&self, block: &[f32], sample_rate: u32) {
        let mut shared = match self.shared.try_lock() {
            Ok(shared) => shared,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };

        shared.sample_rate = sample_rate;
        for &sample in block {
            if shared.samples.len() == WINDOW_LEN {
                shared.samples.pop_front();
            }
            shared.samples.push_back(sample);
        }
    }

    fn clear(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.samples.clear();
        }
    }
}

/// Creates an analyser tap over `input` publishing to `handle`.
pub fn analyser<I>(input: I, handle: AnalyserHandle) -> Analyser<I>
where
    I: Source<Item = f32>,
{
    Analyser {
        input,
        handle,
        block: Vec::with_capacity(BLOCK_LEN),
        frame_sum: 0.0,
        position: 0,
    }
}

/// Pass-through filter feeding an [`AnalyserHandle`].
#[derive(Debug)]
pub struct Analyser<I>
where
    I: Source<Item = f32>,
{
    input: I,
    handle: AnalyserHandle,

    /// Mono frames not yet published.
    block: Vec<f32>,
    frame_sum: f32,
    position: usize,
}

impl<I> Analyser<I>
where
    I: Source<Item = f32>,
{
    #[inline]
    pub fn inner(&self) -> &I {
        &self.input
    }

    fn flush(&mut self) {
        if !self.block.is_empty() {
            self.handle.publish(&self.block, self.input.sample_rate());
            self.block.clear();
        }
    }
}

impl<I> Iterator for Analyser<I>
where
    I: Source<Item = f32>,
{
    type Item = f32;

    #[inline]
    fn next(&mut self) -> Option<f32> {
        let Some(sample) = self.input.next() else {
            self.flush();
            return None;
        };

        let channels = usize::from(self.input.channels()).max(1);
        self.frame_sum += sample;
        self.position = self.position.wrapping_add(1);

        if self.position % channels == 0 {
            self.block.push(self.frame_sum / channels.to_f32_lossy());
            self.frame_sum = 0.0;
            if self.block.len() == BLOCK_LEN {
                self.flush();
            }
        }

        Some(sample)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.input.size_hint()
    }
}

impl<I> Source for Analyser<I>
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

    /// Seeks the inner source and drops the stale window.
    #[inline]
    fn try_seek(&mut self, pos: Duration) -> Result<(), SeekError> {
        self.input.try_seek(pos)?;

        self.block.clear();
        self.frame_sum = 0.0;
        self.position = 0;
        self.handle.clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rodio::buffer::SamplesBuffer;

    use super::*;

    const SAMPLE_RATE: u32 = 48_000;

    fn sine(frequency: f32, amplitude: f32, channels: u16) -> SamplesBuffer<f32> {
        let frames = SAMPLE_RATE as usize / 10;
        let samples = (0..frames)
            .flat_map(|i| {
                let t = i.to_f32_lossy() / SAMPLE_RATE.to_f32_lossy();
                let sample = amplitude * (2.0 * PI * frequency * t).sin();
                std::iter::repeat(sample).take(usize::from(channels))
            })
            .collect::<Vec<_>>();
        SamplesBuffer::new(channels, SAMPLE_RATE, samples)
    }

    #[test]
    fn tap_passes_samples_through() {
        let handle = AnalyserHandle::new();
        let input: Vec<f32> = sine(440.0, 0.5, 2).collect();
        let output: Vec<f32> = analyser(sine(440.0, 0.5, 2), handle).collect();
        assert_eq!(input, output);
    }

    #[test]
    fn rms_of_sine() {
        let handle = AnalyserHandle::new();
        assert!(handle.rms().abs() < f32::EPSILON);

        let _ = analyser(sine(440.0, 0.5, 2), handle.clone()).count();
        let rms = handle.rms();
        assert!((rms - 0.5 / 2.0f32.sqrt()).abs() < 0.02, "rms {rms}");
    }

    #[test]
    fn spectrum_peaks_at_signal_frequency() {
        let handle = AnalyserHandle::new();
        let consumer = handle.clone();
        let _ = analyser(sine(3_000.0, 1.0, 1), handle).count();

        let bins = 128;
        let spectrum = consumer.frequency_data(bins);
        let (peak, magnitude) = spectrum
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |best, (bin, &m)| if m > best.1 { (bin, m) } else { best });

        let frequency = consumer.bin_frequency(peak, bins);
        assert!((frequency - 3_000.0).abs() < 200.0, "peak at {frequency} Hz");
        assert!(magnitude > 0.5, "magnitude {magnitude}");
    }
}
