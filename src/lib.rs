//! Playback and offline-caching engine for a recitation archive.
//!
//! The crate plays recitations from a remote archive and makes them
//! available offline. A [`session::Session`] ties together:
//!
//! * [`transport`]: the queue and play state, as a pure reducer behind a
//!   persisted store
//! * [`player`]: the driver that makes a [`output::MediaElement`] follow the
//!   transport, with crossfades from [`fade`] and a signal chain of
//!   [`analyser`] and [`equalizer`]
//! * [`download`]: offline downloads, tracked in the [`registry`]
//! * [`history`]: playback history and resume positions
//!
//! Network traffic goes through the background cache [`agent`], which keeps
//! versioned partitions in [`cache`] and answers requests per resource class
//! even when the archive cannot be reached.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod agent;
pub mod analyser;
pub mod cache;
pub mod config;
pub mod download;
pub mod equalizer;
pub mod error;
pub mod events;
pub mod fade;
pub mod history;
pub mod http;
pub mod output;
pub mod player;
pub mod registry;
pub mod session;
pub mod signal;
pub mod storage;
pub mod track;
pub mod transport;
pub mod util;
