//! Playback session.
//!
//! A [`Session`] is the explicit application context: it owns the transport
//! store, the player, the download controller and the history, and holds a
//! handle to the cache agent controlling it. Everything is created in
//! [`Session::init`] and torn down in [`Session::dispose`].
//!
//! The session runs a single cooperative event loop that multiplexes:
//! * User commands
//! * The time-update tick of the player
//! * Audio fetched for the player
//! * Resolutions of download deadlines
//! * Broadcasts of the cache agent
//!
//! User-visible notifications are delivered on the channel returned by
//! [`Session::events`].
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registration = Registration::new(Arc::clone(&upstream), caches);
//! let mut session = Session::init(&config, upstream, &mut registration, storage, Output::rodio(&config.playback)).await?;
//! let events = session.events();
//! session.run(&mut commands).await?;
//! session.dispose()?;
//! ```

use std::{fmt, ops::ControlFlow, str::FromStr, sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc},
    time::{self, Interval, MissedTickBehavior},
};
use url::Url;
use uuid::Uuid;

use crate::{
    agent::{AgentHandle, AgentOptions, Broadcast, Registration},
    analyser::AnalyserHandle,
    config::{Config, PlaybackConfig},
    download::Downloads,
    equalizer::{Band, EqualizerHandle, Preset},
    error::{Error, Result},
    events::Event,
    history::History,
    http::Upstream,
    output::{MediaElement, RodioElement},
    player::{Player, TICK_INTERVAL},
    registry::Registry,
    storage::Storage,
    track::Track,
    transport::{Action, RepeatMode, Store, TransportState},
};

/// Media element with the handles into its signal chain.
pub struct Output {
    pub element: Arc<dyn MediaElement>,
    pub equalizer: EqualizerHandle,
    pub analyser: AnalyserHandle,
}

impl Output {
    /// Output on the default audio device, with the equalizer set to the
    /// configured gains. The device is opened on first play.
    #[must_use]
    pub fn rodio(config: &PlaybackConfig) -> Self {
        let equalizer = EqualizerHandle::new(config.equalizer);
        let analyser = AnalyserHandle::new();
        let element = Arc::new(RodioElement::new(equalizer.clone(), analyser.clone()));
        Self {
            element,
            equalizer,
            analyser,
        }
    }
}

/// What the user can ask of a session.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Apply a transport transition.
    Transport(Action),
    /// Play the queued track at an index.
    PlayIndex(usize),
    Seek(Duration),
    /// Cache the queued track at an index, or the current track.
    Download(Option<usize>),
    /// Remove the offline copy of the queued track at an index, or of the
    /// current track.
    DeleteDownload(Option<usize>),
    RetryDownloads,
    SetGain(Band, f32),
    Preset(Preset),
    Crossfade(bool),
    /// Log the transport state.
    Status,
    /// Log the queue.
    Queue,
    /// Log downloaded tracks.
    Downloads,
    /// Log recently played tracks.
    History,
    ClearHistory,
    Quit,
}

impl FromStr for Command {
    type Err = Error;

    /// Parses a console line such as `play 3`, `volume 80` or `eq bass 4`.
    /// Indices are 1-based.
    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let command = words
            .next()
            .ok_or_else(|| Error::invalid_argument("empty command"))?;
        let arg = words.next();

        let index = |arg: Option<&str>| -> Result<Option<usize>> {
            arg.map(|arg| {
                let n: usize = arg.parse()?;
                n.checked_sub(1)
                    .ok_or_else(|| Error::out_of_range("indices start at 1"))
            })
            .transpose()
        };
        let command = match command {
            "play" => match index(arg)? {
                Some(index) => Self::PlayIndex(index),
                None => Self::Transport(Action::Resume),
            },
            "pause" => Self::Transport(Action::Pause),
            "resume" => Self::Transport(Action::Resume),
            "toggle" => Self::Transport(Action::TogglePlay),
            "next" => Self::Transport(Action::NextTrack),
            "prev" | "previous" => Self::Transport(Action::PrevTrack),
            "stop" => Self::Transport(Action::StopPlayer),
            "clear" => Self::Transport(Action::ClearQueue),
            "remove" => {
                let id = required(command, arg)?;
                Self::Transport(Action::RemoveFromQueue(id.to_owned()))
            }
            "shuffle" => Self::Transport(Action::ToggleShuffle),
            "repeat" => match arg {
                Some(mode) => Self::Transport(Action::SetRepeat(mode.parse::<RepeatMode>()?)),
                None => Self::Transport(Action::CycleRepeat),
            },
            "volume" => {
                let percent: f32 = required(command, arg)?.parse()?;
                Self::Transport(Action::SetVolume(percent / 100.0))
            }
            "rate" => Self::Transport(Action::SetPlaybackRate(required(command, arg)?.parse()?)),
            "sleep" => match required(command, arg)? {
                "off" => Self::Transport(Action::SetSleepTimer(None)),
                minutes => Self::Transport(Action::SetSleepTimer(Some(minutes.parse()?))),
            },
            "minimize" => Self::Transport(Action::ToggleMinimized),
            "seek" => {
                let secs: f64 = required(command, arg)?.parse()?;
                let position = Duration::try_from_secs_f64(secs)
                    .map_err(|e| Error::out_of_range(e.to_string()))?;
                Self::Seek(position)
            }
            "download" => Self::Download(index(arg)?),
            "delete" => Self::DeleteDownload(index(arg)?),
            "retry" => Self::RetryDownloads,
            "eq" => {
                let band: Band = required(command, arg)?.parse()?;
                let db: f32 = required(command, words.next())?.parse()?;
                Self::SetGain(band, db)
            }
            "preset" => Self::Preset(required(command, arg)?.parse()?),
            "crossfade" => match required(command, arg)? {
                "on" => Self::Crossfade(true),
                "off" => Self::Crossfade(false),
                other => {
                    return Err(Error::invalid_argument(format!(
                        "crossfade is on or off, not {other}"
                    )))
                }
            },
            "status" => Self::Status,
            "queue" => Self::Queue,
            "downloads" => Self::Downloads,
            "history" => match arg {
                Some("clear") => Self::ClearHistory,
                _ => Self::History,
            },
            "quit" | "exit" => Self::Quit,
            other => return Err(Error::invalid_argument(format!("unknown command {other}"))),
        };

        Ok(command)
    }
}

pub struct Session<U> {
    id: Uuid,
    origin: Url,

    store: Store,
    player: Player<U>,
    downloads: Downloads,
    history: History,

    agent: Option<AgentHandle>,
    broadcasts: Option<broadcast::Receiver<Broadcast>>,

    tick: Interval,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Option<mpsc::UnboundedReceiver<Event>>,
}

impl<U> Session<U>
where
    U: Upstream,
{
    /// Restores persisted state, registers the cache agent for the origin
    /// and wires everything together.
    ///
    /// Playback does not start. When the agent cannot be activated the
    /// session works online only.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read.
    pub async fn init(
        config: &Config,
        upstream: Arc<U>,
        registration: &mut Registration<U>,
        storage: Arc<dyn Storage>,
        output: Output,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        debug!("starting session {id}");

        let mut store = Store::init(Arc::clone(&storage))?;
        let history = History::open(Arc::clone(&storage), config.history_limit)?;
        let mut downloads = Downloads::new(Registry::open(storage)?, config.download_timeout);
        match downloads.reconcile() {
            Ok(0) => {}
            Ok(n) => debug!("dropped {n} stale pending downloads"),
            Err(e) => warn!("could not reconcile downloads: {e}"),
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        registration.register(AgentOptions::from_config(config)).await;
        let agent = registration.controller();
        let broadcasts = agent.as_ref().map(AgentHandle::subscribe);
        match &agent {
            Some(agent) => {
                info!("offline support ready (agent {})", agent.version());
                let _ = event_tx.send(Event::OfflineReady);

                let retried = downloads.retry_pending(Some(agent), &mut store);
                if retried > 0 {
                    info!("retrying {retried} pending downloads");
                }
            }
            None => warn!("offline support is unavailable"),
        }

        let mut player = Player::new(
            output.element,
            output.equalizer,
            output.analyser,
            config,
            upstream,
        );
        player.set_agent(agent.clone());

        let mut tick = time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(Self {
            id,
            origin: config.origin.clone(),
            store,
            player,
            downloads,
            history,
            agent,
            broadcasts,
            tick,
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Takes the receiving end of the event channel. Returns `None` when it
    /// was taken before.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.event_rx.take()
    }

    #[must_use]
    pub fn state(&self) -> &TransportState {
        self.store.state()
    }

    #[must_use]
    pub fn player(&self) -> &Player<U> {
        &self.player
    }

    #[must_use]
    pub fn downloads(&self) -> &Downloads {
        &self.downloads
    }

    #[must_use]
    pub fn history(&self) -> &History {
        &self.history
    }

    #[must_use]
    pub fn is_offline_ready(&self) -> bool {
        self.agent.as_ref().is_some_and(AgentHandle::is_active)
    }

    /// Runs the event loop until `commands` closes or a quit command arrives.
    ///
    /// # Errors
    ///
    /// Command failures are logged and do not end the loop; this only
    /// returns `Ok`.
    pub async fn run(&mut self, commands: &mut mpsc::Receiver<Command>) -> Result<()> {
        info!("session {} running", self.id);
        while self.step(commands).await.is_continue() {}
        info!("session {} stopped", self.id);
        Ok(())
    }

    /// Waits for and handles one input of the event loop.
    pub async fn step(&mut self, commands: &mut mpsc::Receiver<Command>) -> ControlFlow<()> {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    None | Some(Command::Quit) => return ControlFlow::Break(()),
                    Some(command) => {
                        if let Err(e) = self.handle(command).await {
                            error!("{e}");
                        }
                    }
                }
            }

            fetched = self.player.fetched() => {
                let events = self.player.load_fetched(fetched, self.store.state(), &mut self.history).await;
                self.emit_all(events);
            }

            _ = self.tick.tick() => {
                let events = self.player.tick(&mut self.store, &mut self.history).await;
                self.emit_all(events);
            }

            Some(resolution) = self.downloads.next_resolution() => {
                if let Some(event) = self.downloads.resolve(resolution, &mut self.store) {
                    self.emit(event);
                }
            }

            broadcast = next_broadcast(self.broadcasts.as_mut()) => {
                match broadcast {
                    Ok(broadcast) => {
                        trace!("agent broadcast {broadcast:?}");
                        if let Some(event) = self.downloads.on_broadcast(broadcast, &mut self.store) {
                            self.emit(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("missed {n} agent broadcasts");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("agent stopped broadcasting");
                        self.broadcasts = None;
                    }
                }
            }
        }

        ControlFlow::Continue(())
    }

    /// Handles a single command.
    ///
    /// # Errors
    ///
    /// Returns an error when the command refers to a track that does not
    /// exist or cannot be carried out.
    pub async fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Transport(action) => self.dispatch(action).await,

            Command::PlayIndex(index) => {
                let track = self.queued(Some(index))?;
                self.dispatch(Action::PlayTrack(track)).await;
            }

            Command::Seek(position) => self.player.seek(position).await?,

            Command::Download(index) => {
                let track = self.queued(index)?;
                let url = track.resolve(&self.origin)?;
                let requested = self.downloads.request_download(
                    &track,
                    url,
                    self.agent.as_ref(),
                    &mut self.store,
                )?;
                if !requested {
                    info!("{track} is downloaded or downloading already");
                }
            }

            Command::DeleteDownload(index) => {
                let track = self.queued(index)?;
                if !self
                    .downloads
                    .delete_download(&track, self.agent.as_ref())
                    .await?
                {
                    info!("{track} is not downloaded");
                }
            }

            Command::RetryDownloads => {
                let retried = self
                    .downloads
                    .retry_pending(self.agent.as_ref(), &mut self.store);
                info!("retrying {retried} pending downloads");
            }

            Command::SetGain(band, db) => {
                let applied = self.player.equalizer().set_gain(band, db);
                info!("{band} gain set to {applied:+.1} dB");
            }

            Command::Preset(preset) => {
                self.player.equalizer().apply_preset(preset);
                info!("equalizer preset {preset}");
            }

            Command::Crossfade(enabled) => {
                self.player.set_crossfade(enabled);
                info!("crossfade {}", if enabled { "on" } else { "off" });
            }

            Command::Status => info!("{}", Status(self)),

            Command::Queue => {
                let state = self.store.state();
                if state.queue.is_empty() {
                    info!("queue is empty");
                }
                let current = state.current_index();
                for (index, track) in state.queue.iter().enumerate() {
                    let marker = if Some(index) == current { '>' } else { ' ' };
                    let offline = if self.downloads.is_downloaded(track) {
                        " (offline)"
                    } else {
                        ""
                    };
                    info!("{marker}{:>3}. {track}{offline}", index + 1);
                }
            }

            Command::Downloads => {
                let stats = self.downloads.stats();
                info!(
                    "{} tracks available offline, {} bytes",
                    stats.count, stats.total_size_bytes
                );
                for download in self.downloads.downloads() {
                    info!("  {} - {} ({})", download.reciter_name, download.title, download.audio_url);
                }
                for pending in self.downloads.registry().pending_downloads() {
                    info!("  pending: {} - {}", pending.reciter_name, pending.title);
                }
            }

            Command::History => {
                for entry in self.history.recent(10) {
                    info!("  {} {} - {}", entry.timestamp, entry.reciter_name, entry.title);
                }
            }

            Command::ClearHistory => {
                self.history.clear_history()?;
                info!("history cleared");
            }

            Command::Quit => {}
        }

        Ok(())
    }

    /// Applies `action` and lets the player follow.
    ///
    /// A manual skip fades out before the transition.
    pub async fn dispatch(&mut self, action: Action) {
        if matches!(action, Action::NextTrack | Action::PrevTrack) {
            self.player.skip_fade().await;
        }

        if self.store.dispatch(action) {
            let events = self.player.sync(self.store.state(), &mut self.history).await;
            self.emit_all(events);
        }
    }

    /// Saves positions and the transport snapshot, and releases the
    /// session's tasks. The cache agent keeps running.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport snapshot cannot be written.
    pub fn dispose(mut self) -> Result<()> {
        debug!("disposing session {}", self.id);
        self.player.dispose(&mut self.history);
        self.downloads.dispose();
        self.store.dispose()
    }

    fn queued(&self, index: Option<usize>) -> Result<Track> {
        let state = self.store.state();
        match index {
            Some(index) => state.queue.get(index).cloned().ok_or_else(|| {
                Error::out_of_range(format!(
                    "no track {} in a queue of {}",
                    index + 1,
                    state.queue.len()
                ))
            }),
            None => state
                .current_track
                .clone()
                .ok_or_else(|| Error::failed_precondition("no current track")),
        }
    }

    fn emit(&self, event: Event) {
        debug!("event: {event:?}");
        let _ = self.event_tx.send(event);
    }

    fn emit_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.emit(event);
        }
    }
}

fn required<'a>(command: &str, arg: Option<&'a str>) -> Result<&'a str> {
    arg.ok_or_else(|| Error::invalid_argument(format!("{command} needs an argument")))
}

/// Receives from `receiver`, or never completes without one.
async fn next_broadcast(
    receiver: Option<&mut broadcast::Receiver<Broadcast>>,
) -> std::result::Result<Broadcast, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// One-line summary of a session.
struct Status<'a, U>(&'a Session<U>);

impl<U> fmt::Display for Status<'_, U>
where
    U: Upstream,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.0;
        let state = session.store.state();

        match &state.current_track {
            Some(track) => write!(
                f,
                "{} {track} at {:.0?}",
                if state.is_playing { "playing" } else { "paused" },
                session.player.position()
            )?,
            None => write!(f, "stopped")?,
        }

        write!(
            f,
            "; volume {:.0}%, rate {:.2}x, repeat {}, shuffle {}",
            state.volume * 100.0,
            state.playback_rate,
            state.repeat_mode,
            if state.shuffle { "on" } else { "off" },
        )?;

        if let Some(remaining) = session.player.sleep_remaining() {
            write!(f, ", sleeping in {}s", remaining.as_secs())?;
        }
        if !state.active_downloads.is_empty() {
            write!(f, ", {} downloading", state.active_downloads.len())?;
        }
        if !session.is_offline_ready() {
            write!(f, ", online only")?;
        }
        Ok(())
    }
}
