//! Volume ramps for crossfading.
//!
//! A [`Fader`] drives the volume of one [`MediaElement`] in linear steps.
//! At most one ramp runs per fader: starting a ramp aborts the previous one,
//! which then leaves the volume wherever it had got to. A fade-out that
//! pauses the element only pauses once its last step was applied, so an
//! aborted fade-out never pauses.
//!
//! With crossfading disabled every ramp completes instantly.

use std::{sync::Arc, time::Duration};

use tokio::{sync::oneshot, task::JoinHandle, time};

use crate::{output::MediaElement, util::ToF32};

/// Number of volume steps per ramp.
pub const STEPS: u32 = 20;

/// Completion of a ramp.
///
/// Resolves to `true` when the ramp ran to its end and to `false` when it
/// was superseded or cancelled.
pub struct Ramp(oneshot::Receiver<()>);

impl Ramp {
    pub async fn finished(self) -> bool {
        self.0.await.is_ok()
    }

    fn done() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self(rx)
    }
}

pub struct Fader {
    element: Arc<dyn MediaElement>,
    ramp: Option<JoinHandle<()>>,
    enabled: bool,
}

impl Fader {
    #[must_use]
    pub fn new(element: Arc<dyn MediaElement>, enabled: bool) -> Self {
        Self {
            element,
            ramp: None,
            enabled,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[must_use]
    pub fn is_ramping(&self) -> bool {
        self.ramp.as_ref().is_some_and(|ramp| !ramp.is_finished())
    }

    /// Aborts the running ramp, if any.
    pub fn cancel(&mut self) {
        if let Some(ramp) = self.ramp.take() {
            ramp.abort();
        }
    }

    /// Sets the volume immediately, aborting any ramp.
    pub fn set_volume(&mut self, volume: f32) {
        self.cancel();
        self.element.set_volume(volume);
    }

    /// Ramps from silence up to `target`.
    pub fn fade_in(&mut self, target: f32, duration: Duration) -> Ramp {
        self.cancel();
        if self.enabled {
            self.element.set_volume(0.0);
        }
        self.ramp(0.0, target, duration, false)
    }

    /// Ramps from the current volume to `target`.
    pub fn fade_to(&mut self, target: f32, duration: Duration) -> Ramp {
        self.cancel();
        let from = self.element.volume();
        self.ramp(from, target, duration, false)
    }

    /// Ramps to silence and pauses once the ramp completes.
    pub fn fade_out_and_pause(&mut self, duration: Duration) -> Ramp {
        self.cancel();
        let from = self.element.volume();
        self.ramp(from, 0.0, duration, true)
    }

    fn ramp(&mut self, from: f32, to: f32, duration: Duration, pause: bool) -> Ramp {
        if !self.enabled || duration.is_zero() {
            self.element.set_volume(to);
            if pause {
                self.element.pause();
            }
            return Ramp::done();
        }

        trace!("ramping volume from {from:.2} to {to:.2} over {duration:?}");
        let element = Arc::clone(&self.element);
        let (tx, rx) = oneshot::channel();
        let interval = duration / STEPS;

        self.ramp = Some(tokio::spawn(async move {
            for step in 1..=STEPS {
                time::sleep(interval).await;
                let progress = step.to_f32_lossy() / STEPS.to_f32_lossy();
                element.set_volume(from + (to - from) * progress);
            }
            if pause {
                element.pause();
            }
            let _ = tx.send(());
        }));

        Ramp(rx)
    }
}

impl Drop for Fader {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::mock::MockElement;

    fn fader(enabled: bool) -> (Arc<MockElement>, Fader) {
        let element = Arc::new(MockElement::new());
        let fader = Fader::new(Arc::clone(&element) as Arc<dyn MediaElement>, enabled);
        (element, fader)
    }

    #[tokio::test(start_paused = true)]
    async fn fade_in_is_monotonic_and_bounded() {
        let (element, mut fader) = fader(true);
        assert!(fader.fade_in(0.8, Duration::from_millis(1000)).finished().await);

        let volumes = element.state().volumes.clone();
        assert_eq!(volumes.len(), 1 + STEPS as usize);
        assert!(volumes[0].abs() < f32::EPSILON);
        assert!((volumes[volumes.len() - 1] - 0.8).abs() < 1e-6);

        let step = 0.8 / STEPS.to_f32_lossy();
        for pair in volumes.windows(2) {
            assert!(pair[1] >= pair[0]);
            assert!(pair[1] - pair[0] <= step + 1e-6);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fade_out_pauses_only_when_done() {
        let (element, mut fader) = fader(true);
        element.play().unwrap();

        let ramp = fader.fade_out_and_pause(Duration::from_millis(400));
        time::sleep(Duration::from_millis(390)).await;
        assert!(!element.is_paused());

        assert!(ramp.finished().await);
        assert!(element.is_paused());
        assert!(element.volume().abs() < f32::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn new_ramp_supersedes_old() {
        let (element, mut fader) = fader(true);
        element.play().unwrap();

        let fade_out = fader.fade_out_and_pause(Duration::from_millis(400));
        time::sleep(Duration::from_millis(200)).await;
        let fade_in = fader.fade_to(1.0, Duration::from_millis(400));

        assert!(!fade_out.finished().await);
        assert!(fade_in.finished().await);
        assert!(!element.is_paused());
        assert!((element.volume() - 1.0).abs() < 1e-6);

        // Once the second ramp started, volumes only rise.
        let volumes = element.state().volumes.clone();
        let lowest = volumes
            .iter()
            .position(|&v| v <= volumes.iter().copied().fold(f32::MAX, f32::min))
            .unwrap();
        for pair in volumes[lowest..].windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_crossfade_is_instant() {
        let (element, mut fader) = fader(false);
        element.play().unwrap();

        assert!(fader.fade_in(0.5, Duration::from_millis(1000)).finished().await);
        assert_eq!(element.state().volumes, [0.5]);

        assert!(fader.fade_out_and_pause(Duration::from_millis(400)).finished().await);
        assert!(element.is_paused());
        assert!(!fader.is_ramping());
    }
}
