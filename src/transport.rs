//! Transport state machine: the single source of truth for playback.
//!
//! All playback state lives in [`TransportState`] and changes only through
//! [`reduce`], a pure and synchronous function of the previous state and an
//! [`Action`]. The [`Store`] owns the current state, applies actions, and
//! writes a snapshot to storage after every mutation.
//!
//! # States
//!
//! States are implicit in the field combination:
//! * Idle: no current track
//! * Loaded and Playing: current track set, `is_playing`
//! * Loaded and Paused: current track set, not `is_playing`
//!
//! # Restart signal
//!
//! Replaying the track that is already playing (repeat-one, or restarting
//! the head of the queue) must still restart playback. Every playback start
//! increments [`TransportState::play_generation`], so observers can tell a
//! restart apart from an unchanged state even when the track id is equal.

use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::{Error, Result},
    storage::{Namespace, Storage},
    track::Track,
};

/// Repeat behaviour at the end of the queue.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// Stop after the last track.
    #[default]
    Off,
    /// Replay the current track.
    One,
    /// Wrap around to the other end of the queue.
    All,
}

impl RepeatMode {
    /// The mode that follows this one when cycling: off, all, one.
    #[must_use]
    pub fn cycle(self) -> Self {
        match self {
            Self::Off => Self::All,
            Self::All => Self::One,
            Self::One => Self::Off,
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::One => write!(f, "one"),
            Self::All => write!(f, "all"),
        }
    }
}

impl FromStr for RepeatMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Self::Off),
            "one" => Ok(Self::One),
            "all" => Ok(Self::All),
            other => Err(Error::invalid_argument(format!(
                "unknown repeat mode {other}"
            ))),
        }
    }
}

/// Complete playback state.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportState {
    pub current_track: Option<Track>,
    pub is_playing: bool,

    /// Ordered tracks without duplicate ids.
    pub queue: Vec<Track>,

    /// Output volume in `[0.0, 1.0]`.
    pub volume: f32,
    pub playback_rate: f32,
    pub repeat_mode: RepeatMode,
    pub shuffle: bool,
    pub sleep_timer_minutes: Option<u32>,

    /// Resources currently being cached.
    pub active_downloads: BTreeSet<Url>,

    pub is_minimized: bool,

    /// Incremented on every playback (re)start.
    pub play_generation: u64,

    /// Queue order by track id from before shuffling was enabled.
    unshuffled: Option<Vec<String>>,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            current_track: None,
            is_playing: false,
            queue: Vec::new(),
            volume: 1.0,
            playback_rate: 1.0,
            repeat_mode: RepeatMode::default(),
            shuffle: false,
            sleep_timer_minutes: None,
            active_downloads: BTreeSet::new(),
            is_minimized: false,
            play_generation: 0,
            unshuffled: None,
        }
    }
}

impl TransportState {
    /// Slowest supported playback rate.
    pub const MIN_PLAYBACK_RATE: f32 = 0.5;

    /// Fastest supported playback rate.
    pub const MAX_PLAYBACK_RATE: f32 = 2.0;

    /// Position of the current track in the queue.
    #[must_use]
    pub fn current_index(&self) -> Option<usize> {
        let current = self.current_track.as_ref()?;
        self.queue.iter().position(|track| track.is(current))
    }

    #[must_use]
    pub fn is_queued(&self, track_id: &str) -> bool {
        self.queue.iter().any(|track| track.id == track_id)
    }

    #[must_use]
    pub fn is_downloading(&self, url: &Url) -> bool {
        self.active_downloads.contains(url)
    }

    fn play(&mut self, track: Track) {
        self.current_track = Some(track);
        self.is_playing = true;
        self.play_generation = self.play_generation.wrapping_add(1);
    }

    fn replay_current(&mut self) {
        if let Some(track) = self.current_track.take() {
            self.play(track);
        }
    }
}

/// Transitions of the transport state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Start `track` from the beginning, even if it is already playing.
    PlayTrack(Track),
    Pause,
    /// Continue the current track; no-op without one.
    Resume,
    TogglePlay,
    NextTrack,
    PrevTrack,
    /// Append to the queue; ignored when the id is already queued.
    AddToQueue(Track),
    /// Queue right after the current track, moving it when already queued.
    PlayNext(Track),
    RemoveFromQueue(String),
    ClearQueue,
    /// Replace the queue; later duplicates of an id are dropped.
    SetQueue(Vec<Track>),
    ToggleShuffle,
    SetRepeat(RepeatMode),
    CycleRepeat,
    SetVolume(f32),
    SetPlaybackRate(f32),
    /// Arm (`Some`) or disarm (`None`) the sleep timer.
    SetSleepTimer(Option<u32>),
    /// Clear the current track and empty the queue.
    StopPlayer,
    StartDownload(Url),
    FinishDownload(Url),
    SetMinimized(bool),
    ToggleMinimized,
}

/// Applies `action` to `state`.
///
/// `rng` is only drawn from when enabling shuffle.
#[must_use]
pub fn reduce(state: &TransportState, action: Action, rng: &mut fastrand::Rng) -> TransportState {
    let mut next = state.clone();

    match action {
        Action::PlayTrack(track) => next.play(track),

        Action::Pause => next.is_playing = false,

        Action::Resume => next.is_playing = next.current_track.is_some(),

        Action::TogglePlay => {
            next.is_playing = !next.is_playing && next.current_track.is_some();
        }

        Action::NextTrack => {
            if next.current_track.is_none() {
                return next;
            }

            if next.repeat_mode == RepeatMode::One {
                next.replay_current();
                return next;
            }

            match next.current_index() {
                Some(index) if index + 1 < next.queue.len() => {
                    next.play(next.queue[index + 1].clone());
                }
                Some(_) if next.repeat_mode == RepeatMode::All => {
                    next.play(next.queue[0].clone());
                }
                Some(_) => next.is_playing = false,
                None => match next.queue.first().cloned() {
                    Some(first) => next.play(first),
                    None => next.is_playing = false,
                },
            }
        }

        Action::PrevTrack => {
            if next.current_track.is_none() {
                return next;
            }

            if next.repeat_mode == RepeatMode::One {
                next.replay_current();
                return next;
            }

            match next.current_index() {
                Some(index) if index > 0 => next.play(next.queue[index - 1].clone()),
                Some(_) if next.repeat_mode == RepeatMode::All => {
                    let last = next.queue[next.queue.len() - 1].clone();
                    next.play(last);
                }
                Some(_) | None => next.replay_current(),
            }
        }

        Action::AddToQueue(track) => {
            if !next.is_queued(&track.id) {
                next.queue.push(track);
            }
        }

        Action::PlayNext(track) => {
            next.queue.retain(|queued| !queued.is(&track));
            let at = next.current_index().map_or(0, |index| index + 1);
            next.queue.insert(at, track);
        }

        Action::RemoveFromQueue(id) => next.queue.retain(|track| track.id != id),

        Action::ClearQueue => {
            next.queue.clear();
            next.unshuffled = None;
        }

        Action::SetQueue(tracks) => {
            let mut queue: Vec<Track> = Vec::with_capacity(tracks.len());
            for track in tracks {
                if !queue.iter().any(|queued| queued.is(&track)) {
                    queue.push(track);
                }
            }

            if next.shuffle {
                next.unshuffled = Some(queue.iter().map(|track| track.id.clone()).collect());
                rng.shuffle(&mut queue);
            }
            next.queue = queue;
        }

        Action::ToggleShuffle => {
            if next.shuffle {
                if let Some(order) = next.unshuffled.take() {
                    next.queue = restore_order(std::mem::take(&mut next.queue), &order);
                }
                next.shuffle = false;
            } else {
                next.unshuffled = Some(next.queue.iter().map(|track| track.id.clone()).collect());
                rng.shuffle(&mut next.queue);
                next.shuffle = true;
            }
        }

        Action::SetRepeat(mode) => next.repeat_mode = mode,

        Action::CycleRepeat => next.repeat_mode = next.repeat_mode.cycle(),

        Action::SetVolume(volume) => {
            if !volume.is_nan() {
                next.volume = volume.clamp(0.0, 1.0);
            }
        }

        Action::SetPlaybackRate(rate) => {
            if !rate.is_nan() {
                next.playback_rate = rate.clamp(
                    TransportState::MIN_PLAYBACK_RATE,
                    TransportState::MAX_PLAYBACK_RATE,
                );
            }
        }

        Action::SetSleepTimer(minutes) => {
            next.sleep_timer_minutes = minutes.filter(|&minutes| minutes > 0);
        }

        Action::StopPlayer => {
            next.current_track = None;
            next.is_playing = false;
            next.queue.clear();
            next.unshuffled = None;
        }

        Action::StartDownload(url) => {
            next.active_downloads.insert(url);
        }

        Action::FinishDownload(url) => {
            next.active_downloads.remove(&url);
        }

        Action::SetMinimized(minimized) => next.is_minimized = minimized,

        Action::ToggleMinimized => next.is_minimized = !next.is_minimized,
    }

    next
}

/// Orders `queue` by `order`; tracks missing from `order` keep their
/// relative order at the end.
fn restore_order(mut queue: Vec<Track>, order: &[String]) -> Vec<Track> {
    let mut restored = Vec::with_capacity(queue.len());
    for id in order {
        if let Some(index) = queue.iter().position(|track| &track.id == id) {
            restored.push(queue.remove(index));
        }
    }
    restored.append(&mut queue);
    restored
}

/// Persisted subset of the transport state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Snapshot {
    current_track: Option<Track>,
    queue: Vec<Track>,
    volume: f32,
    is_minimized: bool,
    repeat_mode: RepeatMode,
    shuffle: bool,
    playback_rate: f32,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::from(&TransportState::default())
    }
}

impl From<&TransportState> for Snapshot {
    fn from(state: &TransportState) -> Self {
        Self {
            current_track: state.current_track.clone(),
            queue: state.queue.clone(),
            volume: state.volume,
            is_minimized: state.is_minimized,
            repeat_mode: state.repeat_mode,
            shuffle: state.shuffle,
            playback_rate: state.playback_rate,
        }
    }
}

impl From<Snapshot> for TransportState {
    fn from(snapshot: Snapshot) -> Self {
        let mut state = TransportState {
            current_track: snapshot.current_track,
            repeat_mode: snapshot.repeat_mode,
            shuffle: snapshot.shuffle,
            is_minimized: snapshot.is_minimized,
            ..TransportState::default()
        };

        // Run restored values through the reducer invariants rather than
        // trusting what was on disk.
        let mut rng = fastrand::Rng::with_seed(0);
        let shuffle = state.shuffle;
        state.shuffle = false;
        for action in [
            Action::SetQueue(snapshot.queue),
            Action::SetVolume(snapshot.volume),
            Action::SetPlaybackRate(snapshot.playback_rate),
        ] {
            state = reduce(&state, action, &mut rng);
        }
        state.shuffle = shuffle;

        state
    }
}

/// Owner of the transport state.
///
/// Constructed once at session start with [`Store::init`] and passed by
/// reference to everything that reads or changes playback state.
pub struct Store {
    state: TransportState,
    storage: Arc<dyn Storage>,
    rng: fastrand::Rng,
}

impl Store {
    /// Restores the transport state from `storage`.
    ///
    /// Playback never starts on its own: the restored state is always
    /// paused, without timers or downloads in flight.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn init(storage: Arc<dyn Storage>) -> Result<Self> {
        let state = match storage.load::<Snapshot>(Namespace::Player)? {
            Some(snapshot) => {
                let state = TransportState::from(snapshot);
                if let Some(track) = &state.current_track {
                    info!("restored {track} with {} queued", state.queue.len());
                }
                state
            }
            None => TransportState::default(),
        };

        Ok(Self {
            state,
            storage,
            rng: fastrand::Rng::new(),
        })
    }

    /// Replaces the random number generator, for reproducible shuffles.
    #[must_use]
    pub fn with_rng(mut self, rng: fastrand::Rng) -> Self {
        self.rng = rng;
        self
    }

    #[must_use]
    pub fn state(&self) -> &TransportState {
        &self.state
    }

    /// Applies `action` and persists the result. Returns whether the state
    /// changed.
    ///
    /// Persistence failures are logged and do not undo the transition.
    pub fn dispatch(&mut self, action: Action) -> bool {
        trace!("dispatching {action:?}");
        let next = reduce(&self.state, action, &mut self.rng);
        if next == self.state {
            return false;
        }

        let persist = Snapshot::from(&next) != Snapshot::from(&self.state);
        self.state = next;
        if persist {
            if let Err(e) = self.persist() {
                warn!("could not persist player state: {e}");
            }
        }

        true
    }

    /// Writes the final snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn dispose(self) -> Result<()> {
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        self.storage
            .save(Namespace::Player, &Snapshot::from(&self.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn track(id: &str) -> Track {
        Track::new(id, format!("Surah {id}"), "Sudais", format!("/audio/{id}.mp3"))
    }

    fn with_queue(ids: &[&str], current: &str, repeat_mode: RepeatMode) -> TransportState {
        TransportState {
            queue: ids.iter().map(|id| track(id)).collect(),
            current_track: Some(track(current)),
            is_playing: true,
            repeat_mode,
            ..TransportState::default()
        }
    }

    fn rng() -> fastrand::Rng {
        fastrand::Rng::with_seed(7)
    }

    fn current_id(state: &TransportState) -> Option<&str> {
        state.current_track.as_ref().map(|track| track.id.as_str())
    }

    #[test]
    fn adding_a_queued_track_is_idempotent() {
        let state = with_queue(&["a", "b"], "a", RepeatMode::Off);
        let next = reduce(&state, Action::AddToQueue(track("b")), &mut rng());
        assert_eq!(next.queue, state.queue);

        let next = reduce(&next, Action::AddToQueue(track("c")), &mut rng());
        assert_eq!(next.queue.len(), 3);
    }

    #[test]
    fn replaying_the_same_track_restarts() {
        let state = with_queue(&["a"], "a", RepeatMode::Off);
        let next = reduce(&state, Action::PlayTrack(track("a")), &mut rng());
        assert_eq!(current_id(&next), Some("a"));
        assert!(next.is_playing);
        assert_ne!(next.play_generation, state.play_generation);
        assert_ne!(next, state);
    }

    #[test]
    fn repeat_all_wraps_around() {
        let state = with_queue(&["a", "b", "c"], "c", RepeatMode::All);
        let next = reduce(&state, Action::NextTrack, &mut rng());
        assert_eq!(current_id(&next), Some("a"));
        assert!(next.is_playing);

        let state = with_queue(&["a", "b", "c"], "a", RepeatMode::All);
        let prev = reduce(&state, Action::PrevTrack, &mut rng());
        assert_eq!(current_id(&prev), Some("c"));
    }

    #[test]
    fn repeat_off_stops_at_the_end() {
        let state = with_queue(&["a", "b", "c"], "c", RepeatMode::Off);
        let next = reduce(&state, Action::NextTrack, &mut rng());
        assert_eq!(current_id(&next), Some("c"));
        assert!(!next.is_playing);
        assert_eq!(next.play_generation, state.play_generation);
    }

    #[test]
    fn prev_at_start_restarts_first_track() {
        let state = with_queue(&["a", "b"], "a", RepeatMode::Off);
        let prev = reduce(&state, Action::PrevTrack, &mut rng());
        assert_eq!(current_id(&prev), Some("a"));
        assert!(prev.play_generation > state.play_generation);
    }

    #[test]
    fn repeat_one_replays_current() {
        let state = with_queue(&["a", "b"], "a", RepeatMode::One);
        let next = reduce(&state, Action::NextTrack, &mut rng());
        assert_eq!(current_id(&next), Some("a"));
        assert!(next.play_generation > state.play_generation);
    }

    #[test]
    fn next_and_prev_walk_the_queue() {
        let state = with_queue(&["a", "b", "c"], "b", RepeatMode::Off);
        let next = reduce(&state, Action::NextTrack, &mut rng());
        assert_eq!(current_id(&next), Some("c"));
        let prev = reduce(&state, Action::PrevTrack, &mut rng());
        assert_eq!(current_id(&prev), Some("a"));
    }

    #[test]
    fn stop_clears_track_and_queue() {
        let state = with_queue(&["a", "b"], "a", RepeatMode::Off);
        let next = reduce(&state, Action::StopPlayer, &mut rng());
        assert!(next.current_track.is_none());
        assert!(next.queue.is_empty());
        assert!(!next.is_playing);
    }

    #[test]
    fn shuffle_permutes_and_restores() {
        let ids: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let state = with_queue(&refs, "0", RepeatMode::Off);
        let mut rng = rng();

        let shuffled = reduce(&state, Action::ToggleShuffle, &mut rng);
        assert!(shuffled.shuffle);
        assert_ne!(shuffled.queue, state.queue);
        let mut sorted: Vec<_> = shuffled.queue.iter().map(|t| t.id.clone()).collect();
        sorted.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(sorted, expected);

        let shuffled = reduce(&shuffled, Action::AddToQueue(track("new")), &mut rng);
        let shuffled = reduce(&shuffled, Action::RemoveFromQueue("5".to_owned()), &mut rng);
        let restored = reduce(&shuffled, Action::ToggleShuffle, &mut rng);
        assert!(!restored.shuffle);

        let mut expected: Vec<&str> = refs.iter().copied().filter(|id| *id != "5").collect();
        expected.push("new");
        let restored: Vec<&str> = restored.queue.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(restored, expected);
    }

    #[test]
    fn set_queue_drops_duplicates() {
        let state = TransportState::default();
        let next = reduce(
            &state,
            Action::SetQueue(vec![track("a"), track("b"), track("a")]),
            &mut rng(),
        );
        let ids: Vec<&str> = next.queue.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[test]
    fn play_next_moves_track_after_current() {
        let state = with_queue(&["a", "b", "c"], "a", RepeatMode::Off);
        let next = reduce(&state, Action::PlayNext(track("c")), &mut rng());
        let ids: Vec<&str> = next.queue.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "b"]);
    }

    #[test]
    fn values_are_clamped() {
        let state = TransportState::default();
        let next = reduce(&state, Action::SetVolume(1.5), &mut rng());
        assert!((next.volume - 1.0).abs() < f32::EPSILON);
        let next = reduce(&next, Action::SetPlaybackRate(8.0), &mut rng());
        assert!((next.playback_rate - TransportState::MAX_PLAYBACK_RATE).abs() < f32::EPSILON);
        let next = reduce(&next, Action::SetSleepTimer(Some(0)), &mut rng());
        assert_eq!(next.sleep_timer_minutes, None);
    }

    #[test]
    fn resume_requires_a_track() {
        let state = TransportState::default();
        assert!(!reduce(&state, Action::Resume, &mut rng()).is_playing);
        assert!(!reduce(&state, Action::TogglePlay, &mut rng()).is_playing);
    }

    #[test]
    fn store_restores_paused_snapshot() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let url = Url::parse("https://archive.example/audio/a.mp3").unwrap();

        let mut store = Store::init(Arc::clone(&storage)).unwrap();
        assert!(store.dispatch(Action::SetQueue(vec![track("a"), track("b")])));
        assert!(store.dispatch(Action::PlayTrack(track("b"))));
        assert!(store.dispatch(Action::SetVolume(0.4)));
        assert!(store.dispatch(Action::SetRepeat(RepeatMode::All)));
        assert!(store.dispatch(Action::StartDownload(url)));
        assert!(store.dispatch(Action::SetSleepTimer(Some(15))));
        assert!(!store.dispatch(Action::AddToQueue(track("a"))));
        store.dispose().unwrap();

        let store = Store::init(storage).unwrap();
        let state = store.state();
        assert_eq!(current_id(state), Some("b"));
        assert!(!state.is_playing);
        assert_eq!(state.queue.len(), 2);
        assert!((state.volume - 0.4).abs() < f32::EPSILON);
        assert_eq!(state.repeat_mode, RepeatMode::All);
        assert!(state.active_downloads.is_empty());
        assert_eq!(state.sleep_timer_minutes, None);
    }

    #[test]
    fn snapshot_uses_camel_case_keys() {
        let state = with_queue(&["a"], "a", RepeatMode::One);
        let json = serde_json::to_value(Snapshot::from(&state)).unwrap();
        for key in [
            "currentTrack",
            "queue",
            "volume",
            "isMinimized",
            "repeatMode",
            "shuffle",
            "playbackRate",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["repeatMode"], "one");
    }
}
