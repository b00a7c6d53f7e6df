//! Playback driver.
//!
//! The [`Player`] observes the transport state and makes the media element
//! follow it. It never decides what plays; it only reacts to the triple of
//! current track id, play generation and playing flag:
//!
//! * A different track, or a new generation of the same one, fetches the
//!   audio in the background. The session loop keeps running meanwhile and
//!   hands the result back through [`fetched`](Player::fetched) and
//!   [`load_fetched`](Player::load_fetched). A change of track aborts the
//!   fetch. A replay of the loaded resource only starts it over.
//! * Entering playback on a fresh source fades in from silence; entering
//!   pause fades out and pauses once the fade completed.
//! * The periodic [`tick`](Player::tick) runs the sleep timer, persists the
//!   position and advances the queue when a track ends.
//!
//! Playback failures never change the transport state and are not retried.

use std::{sync::Arc, time::Duration};

use http::StatusCode;
use time::OffsetDateTime;
use tokio::{
    task::{self, JoinHandle},
    time::Instant,
};
use url::Url;

use crate::{
    agent::{self, AgentHandle},
    analyser::AnalyserHandle,
    config::{Config, PlaybackConfig},
    equalizer::EqualizerHandle,
    error::{Error, ErrorKind, Result},
    events::Event,
    fade::Fader,
    history::History,
    http::Upstream,
    output::MediaElement,
    track::Track,
    transport::{Action, Store, TransportState},
};

/// Interval of the time-update tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Wall-clock time source of the sleep timer.
pub type Clock = fn() -> OffsetDateTime;

/// What the element holds.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Loaded {
    id: String,
    url: Url,
    generation: u64,
    /// Whether loading succeeded. Failed loads are remembered so that they
    /// are not retried until the track or generation changes.
    ok: bool,
}

struct Fetching {
    target: Loaded,
    task: JoinHandle<Result<Vec<u8>>>,
}

/// Audio fetched for a track, waiting to be loaded into the element.
#[derive(Debug)]
pub struct Fetched {
    target: Loaded,
    body: Result<Vec<u8>>,
}

/// Outcome of opening a track.
enum Opened {
    Ready,
    Fetching,
    Failed,
}

#[derive(Copy, Clone, Debug)]
struct SleepTimer {
    minutes: u32,
    /// Wall-clock time, so that time spent suspended counts.
    deadline: OffsetDateTime,
}

pub struct Player<U> {
    element: Arc<dyn MediaElement>,
    fader: Fader,
    equalizer: EqualizerHandle,
    analyser: AnalyserHandle,

    config: PlaybackConfig,
    origin: Url,
    upstream: Arc<U>,
    agent: Option<AgentHandle>,

    loaded: Option<Loaded>,
    fetching: Option<Fetching>,
    /// Whether the element holds a source that was not played yet.
    fresh: bool,
    playing: bool,
    volume: f32,
    rate: f32,

    clock: Clock,
    sleep_timer: Option<SleepTimer>,
}

impl<U> Player<U>
where
    U: Upstream,
{
    #[must_use]
    pub fn new(
        element: Arc<dyn MediaElement>,
        equalizer: EqualizerHandle,
        analyser: AnalyserHandle,
        config: &Config,
        upstream: Arc<U>,
    ) -> Self {
        let fader = Fader::new(Arc::clone(&element), config.playback.crossfade);
        Self {
            element,
            fader,
            equalizer,
            analyser,
            config: config.playback.clone(),
            origin: config.origin.clone(),
            upstream,
            agent: None,
            loaded: None,
            fetching: None,
            fresh: false,
            playing: false,
            volume: 1.0,
            rate: 1.0,
            clock: OffsetDateTime::now_utc,
            sleep_timer: None,
        }
    }

    /// Routes audio requests through `agent` while it is active.
    pub fn set_agent(&mut self, agent: Option<AgentHandle>) {
        self.agent = agent;
    }

    #[cfg(test)]
    pub(crate) fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    #[must_use]
    pub fn equalizer(&self) -> &EqualizerHandle {
        &self.equalizer
    }

    #[must_use]
    pub fn analyser(&self) -> &AnalyserHandle {
        &self.analyser
    }

    #[must_use]
    pub fn crossfade(&self) -> bool {
        self.fader.is_enabled()
    }

    pub fn set_crossfade(&mut self, enabled: bool) {
        self.fader.set_enabled(enabled);
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Whether audio is being fetched.
    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.fetching.is_some()
    }

    #[must_use]
    pub fn position(&self) -> Duration {
        self.element.position()
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.element.duration()
    }

    /// Time left on the sleep timer.
    #[must_use]
    pub fn sleep_remaining(&self) -> Option<Duration> {
        self.sleep_timer.map(|timer| {
            Duration::try_from(timer.deadline - (self.clock)()).unwrap_or_default()
        })
    }

    /// Seeks within the loaded track. An ended track is started over first.
    pub async fn seek(&mut self, position: Duration) -> Result<()> {
        if !self.loaded.as_ref().is_some_and(|loaded| loaded.ok) {
            return Err(Error::failed_precondition("no track loaded"));
        }

        let playing = self.playing;
        self.blocking(move |element| {
            if element.ended() {
                element.rewind()?;
                if playing {
                    element.play()?;
                }
            }
            element.seek(position)
        })
        .await
    }

    /// Saves the position of the loaded track and silences the element.
    pub fn dispose(&mut self, history: &mut History) {
        self.cancel_fetch();
        self.fader.cancel();
        if let Some(loaded) = self.loaded.take().filter(|loaded| loaded.ok) {
            if let Err(e) = history.save_position(&loaded.id, self.element.position()) {
                warn!("could not save position of {}: {e}", loaded.id);
            }
        }
        self.element.pause();
        self.playing = false;
    }

    /// Fades out ahead of a manual skip. Returns once the fade completed.
    pub async fn skip_fade(&mut self) {
        if self.playing && self.fader.is_enabled() {
            self.fader.fade_to(0.0, self.config.skip_fade).finished().await;
        }
    }

    /// Makes the element follow `state`. Returns the events to report.
    pub async fn sync(&mut self, state: &TransportState, history: &mut History) -> Vec<Event> {
        let mut events = Vec::new();
        self.sync_sleep_timer(state.sleep_timer_minutes);

        if (state.playback_rate - self.rate).abs() > f32::EPSILON {
            self.rate = state.playback_rate;
            self.element.set_speed(self.rate);
        }

        let Some(track) = state.current_track.as_ref() else {
            self.cancel_fetch();
            if self.playing {
                debug!("player stopped");
                self.fader.cancel();
                self.element.pause();
                self.playing = false;
                events.push(Event::Pause);
            }
            self.loaded = None;
            return events;
        };

        if let Some(fetching) = &self.fetching {
            if fetching.target.id == track.id && fetching.target.generation == state.play_generation
            {
                // Picked up again once the audio arrived.
                return events;
            }
            self.cancel_fetch();
        }

        let changed = self.loaded.as_ref().is_none_or(|loaded| {
            loaded.id != track.id || loaded.generation != state.play_generation
        });

        if changed {
            // Nothing is fetched until playback is requested.
            if !state.is_playing {
                if self.playing {
                    events.push(self.pause(history));
                }
                self.loaded = None;
                return events;
            }

            self.fader.cancel();
            events.push(Event::TrackChanged {
                id: track.id.clone(),
            });
            match self.open(track, state.play_generation, history).await {
                Opened::Ready => {}
                Opened::Fetching => return events,
                Opened::Failed => {
                    events.push(Event::Unavailable {
                        id: track.id.clone(),
                    });
                    return events;
                }
            }
        } else if self.loaded.as_ref().is_some_and(|loaded| !loaded.ok) {
            return events;
        }

        let volume_changed = (state.volume - self.volume).abs() > f32::EPSILON;
        self.volume = state.volume;

        if state.is_playing && !self.playing {
            if self.element.ended() {
                // Playing an ended source starts it over.
                match self.blocking(|element| element.rewind()).await {
                    Ok(()) => self.fresh = true,
                    Err(e) => warn!("could not rewind {track}: {e}"),
                }
            }
            if self.start() {
                events.push(Event::Play);
            }
        } else if !state.is_playing && self.playing {
            events.push(self.pause(history));
        } else if volume_changed && self.playing {
            self.fader.set_volume(self.volume);
        }

        events
    }

    /// Waits for the audio being fetched. Never completes while nothing is
    /// fetched, and can be cancelled without losing the fetch.
    pub async fn fetched(&mut self) -> Fetched {
        let Some(fetching) = self.fetching.as_mut() else {
            return std::future::pending().await;
        };

        let body = match (&mut fetching.task).await {
            Ok(body) => body,
            Err(e) => Err(e.into()),
        };
        let target = fetching.target.clone();
        self.fetching = None;

        Fetched { target, body }
    }

    /// Loads fetched audio into the element and continues following
    /// `state`. Returns the events to report.
    pub async fn load_fetched(
        &mut self,
        fetched: Fetched,
        state: &TransportState,
        history: &mut History,
    ) -> Vec<Event> {
        let Fetched { mut target, body } = fetched;
        let track = state
            .current_track
            .as_ref()
            .filter(|track| track.id == target.id && state.play_generation == target.generation);
        let Some(track) = track else {
            debug!("discarding audio of track {}", target.id);
            return self.sync(state, history).await;
        };

        target.ok = match body {
            Ok(body) => match self.install(track, &target.url, body, history).await {
                Ok(()) => true,
                Err(e) => {
                    error!("could not load {track}: {e}");
                    false
                }
            },
            Err(e) if e.kind == ErrorKind::NotFound || e.is_offline() => {
                warn!("{track} is unavailable: {e}");
                false
            }
            Err(e) => {
                error!("could not fetch {track}: {e}");
                false
            }
        };

        let mut events = Vec::new();
        if target.ok {
            self.fresh = true;
            if let Err(e) = history.record(track) {
                warn!("could not record {track} in history: {e}");
            }
        } else {
            events.push(Event::Unavailable {
                id: track.id.clone(),
            });
        }
        self.loaded = Some(target);

        events.extend(self.sync(state, history).await);
        events
    }

    /// Runs the sleep timer, saves the position and advances past ended
    /// tracks, then syncs with the resulting state.
    pub async fn tick(&mut self, store: &mut Store, history: &mut History) -> Vec<Event> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut dispatched = false;

        if let Some(timer) = self.sleep_timer {
            if (self.clock)() >= timer.deadline {
                info!("sleep timer of {} minutes expired", timer.minutes);
                self.sleep_timer = None;
                store.dispatch(Action::Pause);
                store.dispatch(Action::SetSleepTimer(None));
                events.push(Event::SleepTimerExpired);
                dispatched = true;
            }
        }

        if let Some(loaded) = self.loaded.as_ref().filter(|loaded| loaded.ok) {
            if self.playing && self.element.ended() {
                debug!("track {} ended", loaded.id);
                if let Err(e) = history.forget_position(&loaded.id) {
                    warn!("could not forget position of {}: {e}", loaded.id);
                }
                self.playing = false;
                store.dispatch(Action::NextTrack);
                dispatched = true;
            } else if self.playing {
                let position = self.element.position();
                if let Err(e) = history.update_position(&loaded.id, position, now) {
                    warn!("could not save position of {}: {e}", loaded.id);
                }
            }
        }

        if dispatched {
            events.extend(self.sync(store.state(), history).await);
        }
        events
    }

    fn sync_sleep_timer(&mut self, minutes: Option<u32>) {
        match (minutes, self.sleep_timer) {
            (None, Some(_)) => {
                debug!("sleep timer disarmed");
                self.sleep_timer = None;
            }
            (Some(minutes), timer) if timer.is_none_or(|timer| timer.minutes != minutes) => {
                debug!("sleep timer armed for {minutes} minutes");
                self.sleep_timer = Some(SleepTimer {
                    minutes,
                    deadline: (self.clock)() + Duration::from_secs(u64::from(minutes) * 60),
                });
            }
            _ => {}
        }
    }

    /// Starts `track` over when the same resource is loaded already, and
    /// starts fetching it otherwise.
    async fn open(&mut self, track: &Track, generation: u64, history: &mut History) -> Opened {
        let url = match track.resolve(&self.origin) {
            Ok(url) => url,
            Err(e) => {
                error!("{e}");
                self.loaded = Some(Loaded {
                    id: track.id.clone(),
                    url: self.origin.clone(),
                    generation,
                    ok: false,
                });
                return Opened::Failed;
            }
        };

        let replay = self
            .loaded
            .as_ref()
            .is_some_and(|loaded| loaded.ok && loaded.id == track.id && loaded.url == url);

        if !replay {
            info!("fetching {track}");
            if self.playing {
                self.element.pause();
                self.playing = false;
            }
            let task = tokio::spawn(fetch(
                url.clone(),
                self.agent.clone(),
                Arc::clone(&self.upstream),
            ));
            self.fetching = Some(Fetching {
                target: Loaded {
                    id: track.id.clone(),
                    url,
                    generation,
                    ok: false,
                },
                task,
            });
            self.loaded = None;
            return Opened::Fetching;
        }

        debug!("replaying {track}");
        self.playing = false;
        let ok = match self.blocking(|element| element.rewind()).await {
            Ok(()) => {
                self.fresh = true;
                if let Err(e) = history.record(track) {
                    warn!("could not record {track} in history: {e}");
                }
                true
            }
            Err(e) => {
                error!("could not rewind {track}: {e}");
                false
            }
        };

        self.loaded = Some(Loaded {
            id: track.id.clone(),
            url,
            generation,
            ok,
        });
        if ok {
            Opened::Ready
        } else {
            Opened::Failed
        }
    }

    /// Loads `body` into the element and seeks to the saved offset.
    async fn install(
        &mut self,
        track: &Track,
        url: &Url,
        body: Vec<u8>,
        history: &History,
    ) -> Result<()> {
        let resume = history.resume_position(&track.id, self.config.resume_threshold);
        if let Some(offset) = resume {
            debug!("resuming {track} at {offset:?}");
        }

        let url = url.clone();
        self.blocking(move |element| {
            element.load(&url, body)?;
            if let Some(offset) = resume {
                element.seek(offset)?;
            }
            Ok(())
        })
        .await
    }

    fn cancel_fetch(&mut self) {
        if let Some(fetching) = self.fetching.take() {
            debug!("cancelling fetch of {}", fetching.target.url);
            fetching.task.abort();
        }
    }

    /// Runs an element operation that may block on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn MediaElement) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let element = Arc::clone(&self.element);
        task::spawn_blocking(move || f(element.as_ref())).await?
    }

    /// Starts playback, fading in from silence on a fresh source. Returns
    /// whether the element is playing.
    fn start(&mut self) -> bool {
        if let Err(e) = self.element.play() {
            if e.kind == ErrorKind::PermissionDenied {
                debug!("playback refused without user interaction");
            } else {
                error!("could not start playback: {e}");
            }
            return false;
        }

        self.playing = true;
        if std::mem::take(&mut self.fresh) {
            self.fader.fade_in(self.volume, self.config.fade_in);
        } else {
            self.fader.fade_to(self.volume, self.config.fade_in);
        }
        true
    }

    fn pause(&mut self, history: &mut History) -> Event {
        self.playing = false;
        self.fader.fade_out_and_pause(self.config.fade_out);

        if let Some(loaded) = self.loaded.as_ref().filter(|loaded| loaded.ok) {
            if let Err(e) = history.save_position(&loaded.id, self.element.position()) {
                warn!("could not save position of {}: {e}", loaded.id);
            }
        }
        Event::Pause
    }
}

/// Fetches `url`, through `agent` while it is active.
async fn fetch<U>(url: Url, agent: Option<AgentHandle>, upstream: Arc<U>) -> Result<Vec<u8>>
where
    U: Upstream,
{
    let request = agent::get(&url)?;
    let response = match agent.filter(AgentHandle::is_active) {
        Some(agent) => agent.fetch(request).await?,
        None => upstream.fetch(request).await?,
    };

    match response.status() {
        status if status.is_success() => Ok(response.into_body()),
        StatusCode::NOT_FOUND => Err(Error::not_found(format!("{url} not found"))),
        status => Err(Error::unavailable(format!("{url} returned {status}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use http::StatusCode;

    use super::*;
    use crate::{
        http::mock::ScriptedUpstream,
        output::{mock::MockElement, ContextState},
        storage::{MemoryStorage, Storage},
        transport::RepeatMode,
    };

    const ORIGIN: &str = "https://archive.example/";

    thread_local! {
        static NOW: Cell<OffsetDateTime> = const { Cell::new(OffsetDateTime::UNIX_EPOCH) };
    }

    fn now() -> OffsetDateTime {
        NOW.with(Cell::get)
    }

    /// Moves the wall clock without touching the runtime's clock.
    fn wall_clock_advance(by: Duration) {
        NOW.with(|now| now.set(now.get() + by));
    }

    struct Fixture {
        element: Arc<MockElement>,
        upstream: Arc<ScriptedUpstream>,
        player: Player<ScriptedUpstream>,
        store: Store,
        history: History,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Config {
                origin: Url::parse(ORIGIN).unwrap(),
                ..Config::default()
            };
            let element = Arc::new(MockElement::new());
            let upstream = Arc::new(ScriptedUpstream::new());
            for id in ["1", "2", "3"] {
                upstream.respond(&format!("{ORIGIN}audio/{id}.mp3"), StatusCode::OK, b"ID3");
            }

            let media: Arc<dyn MediaElement> = element.clone();
            let mut player = Player::new(
                media,
                EqualizerHandle::new([0.0; 3]),
                AnalyserHandle::new(),
                &config,
                Arc::clone(&upstream),
            );
            player.set_clock(now);
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
            Self {
                element,
                upstream,
                player,
                store: Store::init(Arc::clone(&storage)).unwrap(),
                history: History::open(storage, 50).unwrap(),
            }
        }

        /// Applies `action` without waiting for audio to arrive.
        async fn request(&mut self, action: Action) -> Vec<Event> {
            self.store.dispatch(action);
            self.player.sync(self.store.state(), &mut self.history).await
        }

        async fn dispatch(&mut self, action: Action) -> Vec<Event> {
            let mut events = self.request(action).await;
            events.extend(self.settle().await);
            events
        }

        async fn tick(&mut self) -> Vec<Event> {
            let mut events = self.player.tick(&mut self.store, &mut self.history).await;
            events.extend(self.settle().await);
            events
        }

        /// Loads fetched audio until nothing is fetched anymore.
        async fn settle(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            while self.player.is_fetching() {
                let fetched = self.player.fetched().await;
                events.extend(
                    self.player
                        .load_fetched(fetched, self.store.state(), &mut self.history)
                        .await,
                );
            }
            events
        }
    }

    fn track(id: &str) -> Track {
        Track::new(id, "Al-Fatiha", "Alafasy", format!("/audio/{id}.mp3"))
    }

    fn changed(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, Event::TrackChanged { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn playing_loads_and_fades_in() {
        let mut f = Fixture::new();
        let events = f.dispatch(Action::PlayTrack(track("1"))).await;

        assert_eq!(
            events,
            [Event::TrackChanged { id: "1".to_owned() }, Event::Play]
        );
        assert_eq!(f.element.state().loads, 1);
        assert!(!f.element.is_paused());
        assert_eq!(f.element.context_state(), ContextState::Running);
        assert_eq!(f.element.volume(), 0.0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!((f.element.volume() - 1.0).abs() < 1e-6);
        assert_eq!(f.history.recent(1)[0].track_id, "1");
    }

    #[tokio::test(start_paused = true)]
    async fn restored_state_does_not_fetch() {
        let mut f = Fixture::new();
        f.store.dispatch(Action::PlayTrack(track("1")));
        f.store.dispatch(Action::Pause);
        let events = f.player.sync(f.store.state(), &mut f.history).await;

        assert!(events.is_empty());
        assert!(!f.player.is_fetching());
        assert_eq!(f.upstream.fetches(&format!("{ORIGIN}audio/1.mp3")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_does_not_hold_up_transport() {
        let mut f = Fixture::new();
        f.upstream.stall(&format!("{ORIGIN}audio/1.mp3"));

        let events = f.request(Action::PlayTrack(track("1"))).await;
        assert_eq!(events, [Event::TrackChanged { id: "1".to_owned() }]);
        assert!(f.player.is_fetching());

        // Pausing and resuming the same track leaves the fetch alone.
        assert!(f.request(Action::Pause).await.is_empty());
        assert!(f.request(Action::Resume).await.is_empty());
        assert!(f.player.is_fetching());

        // Another track replaces it.
        let events = f.dispatch(Action::PlayTrack(track("2"))).await;
        assert_eq!(
            events,
            [Event::TrackChanged { id: "2".to_owned() }, Event::Play]
        );
        assert_eq!(f.element.state().url.as_ref().unwrap().path(), "/audio/2.mp3");

        f.upstream.stall(&format!("{ORIGIN}audio/3.mp3"));
        f.request(Action::PlayTrack(track("3"))).await;
        f.request(Action::StopPlayer).await;
        assert!(!f.player.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn pausing_fades_out_first() {
        let mut f = Fixture::new();
        f.dispatch(Action::PlayTrack(track("1"))).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let events = f.dispatch(Action::Pause).await;
        assert_eq!(events, [Event::Pause]);
        assert!(!f.element.is_paused());

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(f.element.is_paused());
        assert_eq!(f.element.volume(), 0.0);

        // Resuming an unchanged source ramps back up without reloading.
        let events = f.dispatch(Action::Resume).await;
        assert_eq!(events, [Event::Play]);
        assert_eq!(f.element.state().loads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_starts_over_without_refetch() {
        let mut f = Fixture::new();
        f.dispatch(Action::PlayTrack(track("1"))).await;
        f.element.state().position = Duration::from_secs(30);

        let events = f.dispatch(Action::PlayTrack(track("1"))).await;
        assert_eq!(
            events,
            [Event::TrackChanged { id: "1".to_owned() }, Event::Play]
        );
        assert_eq!(f.element.position(), Duration::ZERO);
        assert_eq!(f.element.state().rewinds, 1);
        assert_eq!(f.element.state().loads, 1);
        assert_eq!(f.upstream.fetches(&format!("{ORIGIN}audio/1.mp3")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn saved_offset_is_resumed_past_threshold() {
        let mut f = Fixture::new();
        f.history.save_position("1", Duration::from_secs(95)).unwrap();
        f.history.save_position("2", Duration::from_secs(4)).unwrap();

        f.dispatch(Action::PlayTrack(track("1"))).await;
        assert_eq!(f.element.position(), Duration::from_secs(95));

        f.dispatch(Action::PlayTrack(track("2"))).await;
        assert_eq!(f.element.position(), Duration::ZERO);
        assert_eq!(f.element.state().seeks.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_track_is_unavailable_and_not_retried() {
        let mut f = Fixture::new();
        let events = f.dispatch(Action::PlayTrack(track("404"))).await;

        assert_eq!(
            events,
            [
                Event::TrackChanged {
                    id: "404".to_owned()
                },
                Event::Unavailable {
                    id: "404".to_owned()
                }
            ]
        );
        assert!(f.store.state().is_playing);
        assert!(f.element.is_paused());

        f.dispatch(Action::SetVolume(0.5)).await;
        assert_eq!(f.upstream.fetches(&format!("{ORIGIN}audio/404.mp3")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_track_is_unavailable_and_not_retried() {
        let mut f = Fixture::new();
        f.element.state().fail_load = true;

        let events = f.dispatch(Action::PlayTrack(track("1"))).await;
        assert_eq!(
            events,
            [
                Event::TrackChanged { id: "1".to_owned() },
                Event::Unavailable { id: "1".to_owned() }
            ]
        );
        assert!(f.store.state().is_playing);
        assert!(!f.player.is_playing());
        assert!(f.history.recent(1).is_empty());

        assert!(f.dispatch(Action::SetVolume(0.5)).await.is_empty());
        assert!(f.tick().await.is_empty());
        assert_eq!(f.upstream.fetches(&format!("{ORIGIN}audio/1.mp3")), 1);
        assert_eq!(f.element.state().loads, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_track_is_unavailable() {
        let mut f = Fixture::new();
        f.upstream.set_offline(true);

        let events = f.dispatch(Action::PlayTrack(track("1"))).await;
        assert_eq!(events[1], Event::Unavailable { id: "1".to_owned() });
        assert_eq!(f.store.state().current_track, Some(track("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn autoplay_refusal_is_absorbed() {
        let mut f = Fixture::new();
        f.element.state().refuse_play = Some(ErrorKind::PermissionDenied);

        let events = f.dispatch(Action::PlayTrack(track("1"))).await;
        assert_eq!(events, [Event::TrackChanged { id: "1".to_owned() }]);
        assert!(f.store.state().is_playing);
        assert!(!f.player.is_playing());

        // The next request tries again.
        let events = f.dispatch(Action::SetVolume(0.8)).await;
        assert_eq!(events, [Event::Play]);
    }

    #[tokio::test(start_paused = true)]
    async fn ended_track_advances_and_forgets_position() {
        let mut f = Fixture::new();
        f.store
            .dispatch(Action::SetQueue(vec![track("1"), track("2")]));
        f.dispatch(Action::PlayTrack(track("1"))).await;
        f.history.save_position("1", Duration::from_secs(200)).unwrap();
        f.element.state().ended = true;

        let events = f.tick().await;
        assert_eq!(
            events,
            [Event::TrackChanged { id: "2".to_owned() }, Event::Play]
        );
        assert_eq!(f.history.position("1"), None);
        assert_eq!(f.store.state().current_track, Some(track("2")));
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_one_replays_ended_track_once() {
        let mut f = Fixture::new();
        f.dispatch(Action::SetRepeat(RepeatMode::One)).await;
        f.dispatch(Action::PlayTrack(track("1"))).await;
        f.element.state().ended = true;

        let mut events = Vec::new();
        for _ in 0..8 {
            events.extend(f.tick().await);
            tokio::time::advance(TICK_INTERVAL).await;
        }

        assert_eq!(changed(&events), 1);
        assert!(f.player.is_playing());
        assert!(!f.element.ended());
        assert!(!f.element.is_paused());
        assert_eq!(f.element.state().rewinds, 1);
        assert_eq!(f.element.state().loads, 1);
        assert_eq!(f.history.recent(50).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resuming_ended_track_starts_over() {
        let mut f = Fixture::new();
        f.dispatch(Action::PlayTrack(track("1"))).await;
        f.dispatch(Action::Pause).await;
        f.element.state().ended = true;

        let events = f.dispatch(Action::Resume).await;
        assert_eq!(events, [Event::Play]);
        assert_eq!(f.element.state().rewinds, 1);
        assert!(!f.element.ended());
        assert_eq!(f.element.volume(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn seeking_ended_track_revives_it() {
        let mut f = Fixture::new();
        f.dispatch(Action::PlayTrack(track("1"))).await;
        f.element.state().ended = true;

        f.player.seek(Duration::from_secs(20)).await.unwrap();
        assert!(!f.element.ended());
        assert!(!f.element.is_paused());
        assert_eq!(f.element.position(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_timer_fires_once() {
        let mut f = Fixture::new();
        f.dispatch(Action::PlayTrack(track("1"))).await;
        f.dispatch(Action::SetSleepTimer(Some(1))).await;

        let mut expired = 0;
        for step in [250, 7_000, 31, 40_000, 12_719, 250, 5, 60_000, 250] {
            let step = Duration::from_millis(step);
            wall_clock_advance(step);
            tokio::time::advance(step).await;
            expired += f
                .tick()
                .await
                .iter()
                .filter(|event| **event == Event::SleepTimerExpired)
                .count();
        }

        assert_eq!(expired, 1);
        assert!(!f.store.state().is_playing);
        assert_eq!(f.store.state().sleep_timer_minutes, None);
        assert_eq!(f.player.sleep_remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_timer_counts_suspended_time() {
        let mut f = Fixture::new();
        f.dispatch(Action::PlayTrack(track("1"))).await;
        f.dispatch(Action::SetSleepTimer(Some(5))).await;
        assert_eq!(f.player.sleep_remaining(), Some(Duration::from_secs(300)));

        // Only the wall clock moves while the machine sleeps.
        wall_clock_advance(Duration::from_secs(301));
        let events = f.tick().await;

        assert!(events.contains(&Event::SleepTimerExpired));
        assert!(!f.store.state().is_playing);
    }

    #[tokio::test(start_paused = true)]
    async fn position_is_saved_while_playing() {
        let mut f = Fixture::new();
        f.dispatch(Action::PlayTrack(track("1"))).await;
        f.element.state().position = Duration::from_secs(12);

        f.tick().await;
        assert_eq!(f.history.position("1"), Some(Duration::from_secs(12)));
    }

    #[tokio::test(start_paused = true)]
    async fn skip_fade_silences_before_transition() {
        let mut f = Fixture::new();
        f.dispatch(Action::PlayTrack(track("1"))).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let started = Instant::now();
        f.player.skip_fade().await;
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(f.element.volume(), 0.0);
        assert!(!f.element.is_paused());
    }
}
