//! Events emitted during playback and offline caching.
//!
//! These are the user-visible notifications of the session. They can be
//! used to:
//! * Monitor playback state changes
//! * Tell the user that a download finished or failed
//! * React to the sleep timer stopping playback
//!
//! # Example
//!
//! ```rust
//! use murattal::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::DownloadComplete { title, .. } => println!("{title} is available offline"),
//!         _ => {}
//!     }
//! }
//! ```

use url::Url;

/// Events that can be emitted by a session.
///
/// Events fall into three categories:
///
/// Playback Events:
/// * [`Play`](Self::Play) - Playback starts
/// * [`Pause`](Self::Pause) - Playback pauses
/// * [`TrackChanged`](Self::TrackChanged) - Current track changes
/// * [`SleepTimerExpired`](Self::SleepTimerExpired) - Sleep timer stopped playback
/// * [`Unavailable`](Self::Unavailable) - Current track cannot be played
///
/// Download Events:
/// * [`DownloadComplete`](Self::DownloadComplete) - Track available offline
/// * [`DownloadFailed`](Self::DownloadFailed) - Track could not be cached
///
/// Cache Agent Events:
/// * [`OfflineReady`](Self::OfflineReady) - Agent activated
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Playback has started.
    Play,

    /// Playback has paused.
    Pause,

    /// Current track has changed.
    ///
    /// Emitted when switching to a different track, whether through
    /// manual selection, automatic progression or a replay.
    TrackChanged {
        /// Id of the new track.
        id: String,
    },

    /// The sleep timer ran out and paused playback.
    SleepTimerExpired,

    /// The current track could not be loaded.
    ///
    /// Playback is not retried; the user must select the track again.
    Unavailable {
        /// Id of the track.
        id: String,
    },

    /// A track has been cached for offline playback.
    DownloadComplete {
        /// Title of the track.
        title: String,
        /// Resource that was cached.
        url: Url,
    },

    /// Caching a track failed or timed out.
    ///
    /// The pending record is kept so that the download can be retried.
    DownloadFailed {
        /// Title of the track.
        title: String,
        /// Resource that could not be cached.
        url: Url,
    },

    /// The cache agent is active and offline playback is available.
    OfflineReady,
}
