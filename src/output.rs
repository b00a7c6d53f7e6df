//! Audio output.
//!
//! Playback goes through the [`MediaElement`] trait: a single loaded source
//! that can be played, paused, seeked and ramped in volume. The production
//! implementation, [`RodioElement`], decodes with rodio's Symphonia
//! decoders and renders every loaded source through this signal chain:
//!
//! ```text
//! decoded source -> analyser tap -> bass -> mid -> treble -> output
//! ```
//!
//! # Audio context
//!
//! The output device is opened lazily, on the first play request, and kept
//! open for the rest of the session. Until then the context is
//! [`ContextState::Suspended`]. Every play request resumes it again, so a
//! context that could not be opened is retried on the next play.
//!
//! # Blocking
//!
//! [`MediaElement::load`], [`MediaElement::rewind`] and
//! [`MediaElement::seek`] decode or wait for the output thread to
//! acknowledge. Call them from a blocking context.

use std::{
    fmt,
    io::Cursor,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use url::Url;

use crate::{
    analyser::{analyser, AnalyserHandle},
    equalizer::{equalizer, EqualizerHandle},
    error::{Error, Result},
};

/// State of the output device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ContextState {
    #[default]
    Suspended,
    Running,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suspended => write!(f, "suspended"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// A single playable media source.
///
/// Methods take `&self` so that volume ramps can drive the element from
/// their own task while the session keeps control of playback.
pub trait MediaElement: Send + Sync {
    /// Replaces the loaded source with the encoded audio in `body`. The
    /// element is paused afterwards, positioned at the start.
    fn load(&self, url: &Url, body: Vec<u8>) -> Result<()>;

    /// Starts the loaded source over, also after it played to its end. The
    /// element is paused afterwards.
    fn rewind(&self) -> Result<()>;

    /// Starts or continues playback, resuming the audio context first.
    ///
    /// # Errors
    ///
    /// Fails with `PermissionDenied` when the platform refuses to start
    /// playback without user interaction.
    fn play(&self) -> Result<()>;

    fn pause(&self);

    fn is_paused(&self) -> bool;

    /// Whether the loaded source played to its end.
    fn ended(&self) -> bool;

    /// Moves within the loaded source. Seeking an ended source does not
    /// revive it; use [`rewind`](MediaElement::rewind).
    fn seek(&self, position: Duration) -> Result<()>;

    fn position(&self) -> Duration;

    fn duration(&self) -> Option<Duration>;

    fn volume(&self) -> f32;

    fn set_volume(&self, volume: f32);

    fn set_speed(&self, speed: f32);

    fn context_state(&self) -> ContextState;
}

/// Output device kept open by a dedicated thread.
///
/// The `OutputStream` must stay on the thread that created it; dropping
/// `shutdown` lets that thread exit and close the device.
struct Graph {
    handle: OutputStreamHandle,
    _shutdown: mpsc::Sender<()>,
}

impl Graph {
    fn open() -> Result<Self> {
        let (handle_tx, handle_rx) = mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        thread::Builder::new()
            .name("audio-output".to_owned())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    if handle_tx.send(Ok(handle)).is_ok() {
                        // Blocks until the sender is dropped.
                        let _ = shutdown_rx.recv();
                    }
                    drop(stream);
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(Error::from(e)));
                }
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| Error::unavailable("audio output thread exited"))??;
        info!("audio output opened");

        Ok(Self {
            handle,
            _shutdown: shutdown_tx,
        })
    }
}

type Chain = Box<dyn Source<Item = f32> + Send>;

struct Inner {
    graph: Option<Graph>,
    sink: Option<Sink>,

    /// Decoded source waiting for the output to open.
    pending: Option<Chain>,

    /// Encoded audio of the loaded source, kept to rebuild the chain once
    /// the sink drained it.
    body: Option<Arc<[u8]>>,
    url: Option<Url>,
    duration: Option<Duration>,
    volume: f32,
    speed: f32,
}

/// [`MediaElement`] rendering through rodio.
pub struct RodioElement {
    inner: Mutex<Inner>,
    equalizer: EqualizerHandle,
    analyser: AnalyserHandle,
}

impl RodioElement {
    #[must_use]
    pub fn new(equalizer: EqualizerHandle, analyser: AnalyserHandle) -> Self {
        Self {
            inner: Mutex::new(Inner {
                graph: None,
                sink: None,
                pending: None,
                body: None,
                url: None,
                duration: None,
                volume: 1.0,
                speed: 1.0,
            }),
            equalizer,
            analyser,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        Ok(self.inner.lock()?)
    }

    /// Decodes `body` into a fresh signal chain.
    fn chain(&self, body: Arc<[u8]>) -> Result<(Chain, Option<Duration>)> {
        let decoder = Decoder::new(Cursor::new(body))?;
        let duration = decoder.total_duration();
        let chain: Chain = Box::new(equalizer(
            analyser(decoder.convert_samples::<f32>(), self.analyser.clone()),
            self.equalizer.clone(),
        ));
        Ok((chain, duration))
    }

    fn with<T: Default>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        match self.inner.lock() {
            Ok(mut inner) => f(&mut inner),
            Err(e) => {
                error!("audio output poisoned: {e}");
                T::default()
            }
        }
    }
}

impl Inner {
    /// Replaces the current sink with `chain`, paused at its start.
    fn replace(&mut self, chain: Chain) -> Result<()> {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.pending = Some(chain);
        if self.graph.is_some() {
            self.ensure_sink()?;
        }
        Ok(())
    }

    /// Opens the output if it was not yet and moves a pending source into a
    /// new sink.
    fn ensure_sink(&mut self) -> Result<()> {
        if self.graph.is_none() {
            self.graph = Some(Graph::open()?);
        }

        if let (Some(graph), Some(chain)) = (self.graph.as_ref(), self.pending.take()) {
            let sink = Sink::try_new(&graph.handle)?;
            sink.pause();
            sink.set_volume(self.volume);
            sink.set_speed(self.speed);
            sink.append(chain);
            self.sink = Some(sink);
        }

        Ok(())
    }
}

impl MediaElement for RodioElement {
    fn load(&self, url: &Url, body: Vec<u8>) -> Result<()> {
        let body: Arc<[u8]> = body.into();
        let (chain, duration) = self.chain(Arc::clone(&body))?;

        let mut inner = self.lock()?;
        inner.replace(chain)?;
        inner.body = Some(body);
        inner.url = Some(url.clone());
        inner.duration = duration;

        debug!("loaded {url}");
        Ok(())
    }

    fn rewind(&self) -> Result<()> {
        // An empty sink ignores seeks, so the chain is decoded anew.
        let body = self
            .lock()?
            .body
            .clone()
            .ok_or_else(|| Error::failed_precondition("no source loaded"))?;
        let (chain, _) = self.chain(body)?;

        let mut inner = self.lock()?;
        inner.replace(chain)?;
        if let Some(url) = &inner.url {
            debug!("rewound {url}");
        }
        Ok(())
    }

    fn play(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ensure_sink()?;
        match inner.sink.as_ref() {
            Some(sink) => {
                sink.play();
                Ok(())
            }
            None => Err(Error::failed_precondition("no source loaded")),
        }
    }

    fn pause(&self) {
        self.with(|inner| {
            if let Some(sink) = &inner.sink {
                sink.pause();
            }
        });
    }

    fn is_paused(&self) -> bool {
        self.with(|inner| inner.sink.as_ref().is_none_or(Sink::is_paused))
    }

    fn ended(&self) -> bool {
        self.with(|inner| inner.sink.as_ref().is_some_and(Sink::empty))
    }

    fn seek(&self, position: Duration) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(chain) = inner.pending.as_mut() {
            chain.try_seek(position)?;
        } else if let Some(sink) = &inner.sink {
            sink.try_seek(position)?;
        }
        Ok(())
    }

    fn position(&self) -> Duration {
        self.with(|inner| inner.sink.as_ref().map(Sink::get_pos).unwrap_or_default())
    }

    fn duration(&self) -> Option<Duration> {
        self.with(|inner| inner.duration)
    }

    fn volume(&self) -> f32 {
        self.with(|inner| inner.volume)
    }

    fn set_volume(&self, volume: f32) {
        self.with(|inner| {
            inner.volume = volume;
            if let Some(sink) = &inner.sink {
                sink.set_volume(volume);
            }
        });
    }

    fn set_speed(&self, speed: f32) {
        self.with(|inner| {
            inner.speed = speed;
            if let Some(sink) = &inner.sink {
                sink.set_speed(speed);
            }
        });
    }

    fn context_state(&self) -> ContextState {
        self.with(|inner| {
            if inner.graph.is_some() {
                ContextState::Running
            } else {
                ContextState::Suspended
            }
        })
    }
}
