//! Offline download controller.
//!
//! Downloads are performed by the cache agent; this controller only decides
//! when to ask for one and keeps the registry and the transport state in
//! step with the answers.
//!
//! Each request spawns a deadline task that waits for the direct reply of
//! the agent. The task always resolves, with success, failure or timeout,
//! onto the result channel of the controller. Completion broadcasts of the
//! agent are a second source of the same information; whichever arrives
//! first wins and later duplicates change nothing.

use std::{collections::HashMap, fmt, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle, time};
use url::Url;

use crate::{
    agent::{AgentHandle, Broadcast},
    error::{Error, Result},
    events::Event,
    registry::{DownloadRecord, DownloadStats, DownloadedTrack, Registry},
    track::Track,
    transport::{Action, Store},
};

/// How a download ended.
#[derive(Debug)]
pub enum Outcome {
    /// Cached, with the body size when the reply carried it.
    Success { size: Option<u64> },
    Failure(Error),
    /// No answer before the deadline.
    Timeout,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { .. } => write!(f, "success"),
            Self::Failure(e) => write!(f, "failure: {e}"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug)]
pub struct Resolution {
    pub url: Url,
    pub outcome: Outcome,
}

impl From<Broadcast> for Resolution {
    fn from(broadcast: Broadcast) -> Self {
        let outcome = if broadcast.success() {
            Outcome::Success { size: None }
        } else {
            Outcome::Failure(Error::unavailable("caching failed"))
        };

        Self {
            url: broadcast.url().clone(),
            outcome,
        }
    }
}

pub struct Downloads {
    registry: Registry,
    timeout: Duration,
    results_tx: mpsc::UnboundedSender<Resolution>,
    results_rx: mpsc::UnboundedReceiver<Resolution>,
    deadlines: HashMap<Url, JoinHandle<()>>,
}

impl Downloads {
    #[must_use]
    pub fn new(registry: Registry, timeout: Duration) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            timeout,
            results_tx,
            results_rx,
            deadlines: HashMap::new(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn is_downloaded(&self, track: &Track) -> bool {
        self.registry.is_downloaded(&track.id)
    }

    /// Downloaded tracks, most recent first.
    #[must_use]
    pub fn downloads(&self) -> Vec<&DownloadedTrack> {
        self.registry.downloads()
    }

    #[must_use]
    pub fn stats(&self) -> DownloadStats {
        self.registry.stats()
    }

    /// Drops pending records of tracks that finished downloading in an
    /// earlier session.
    pub fn reconcile(&mut self) -> Result<usize> {
        self.registry.reconcile()
    }

    /// Requests `track`, cached from `url`, for offline use.
    ///
    /// Returns `false` without doing anything when the track is downloaded
    /// already or `url` is being downloaded. Without an `agent` the download
    /// fails right away.
    pub fn request_download(
        &mut self,
        track: &Track,
        url: Url,
        agent: Option<&AgentHandle>,
        store: &mut Store,
    ) -> Result<bool> {
        if self.registry.is_downloaded(&track.id) {
            debug!("{track} is downloaded already");
            return Ok(false);
        }
        if store.state().is_downloading(&url) {
            debug!("{track} is being downloaded");
            return Ok(false);
        }

        info!("downloading {track}");
        self.registry
            .add_pending(DownloadRecord::new(track, url.clone()))?;
        self.start(url, agent, store);
        Ok(true)
    }

    /// Requests every pending download again. Returns how many were
    /// requested.
    pub fn retry_pending(&mut self, agent: Option<&AgentHandle>, store: &mut Store) -> usize {
        let urls: Vec<Url> = self
            .registry
            .pending_downloads()
            .map(|record| record.audio_url.clone())
            .filter(|url| !store.state().is_downloading(url))
            .collect();

        for url in &urls {
            debug!("retrying download of {url}");
            self.start(url.clone(), agent, store);
        }
        urls.len()
    }

    fn start(&mut self, url: Url, agent: Option<&AgentHandle>, store: &mut Store) {
        store.dispatch(Action::StartDownload(url.clone()));

        let results = self.results_tx.clone();
        let agent = agent.cloned();
        let timeout = self.timeout;
        let task_url = url.clone();

        let deadline = tokio::spawn(async move {
            let outcome = match agent {
                Some(agent) => match time::timeout(timeout, agent.cache_audio(task_url.clone())).await {
                    Ok(Ok(size)) => Outcome::Success { size: Some(size) },
                    Ok(Err(e)) => Outcome::Failure(e),
                    Err(_) => Outcome::Timeout,
                },
                None => Outcome::Failure(Error::unavailable("offline support is not available")),
            };

            let _ = results.send(Resolution {
                url: task_url,
                outcome,
            });
        });

        if let Some(previous) = self.deadlines.insert(url, deadline) {
            previous.abort();
        }
    }

    /// Waits for the next resolution of a deadline task.
    pub async fn next_resolution(&mut self) -> Option<Resolution> {
        self.results_rx.recv().await
    }

    /// Applies a broadcast of the agent.
    pub fn on_broadcast(&mut self, broadcast: Broadcast, store: &mut Store) -> Option<Event> {
        self.resolve(Resolution::from(broadcast), store)
    }

    /// Applies `resolution`, returning the event to show the user. Returns
    /// `None` for duplicates of an earlier resolution.
    pub fn resolve(&mut self, resolution: Resolution, store: &mut Store) -> Option<Event> {
        let Resolution { url, outcome } = resolution;

        if !matches!(outcome, Outcome::Success { size: None }) {
            // The reply or timeout of a deadline task.
            self.deadlines.remove(&url);
        }

        match outcome {
            Outcome::Success { size } => match self.registry.promote(&url, size) {
                Ok(Some(record)) => {
                    store.dispatch(Action::FinishDownload(url.clone()));
                    info!("{} is available offline", record.title);
                    Some(Event::DownloadComplete {
                        title: record.title,
                        url,
                    })
                }
                Ok(None) => {
                    store.dispatch(Action::FinishDownload(url.clone()));
                    if let Some(size) = size {
                        if let Err(e) = self.registry.update_size(&url, size) {
                            warn!("could not record size of {url}: {e}");
                        }
                    }
                    None
                }
                Err(e) => {
                    error!("could not register download of {url}: {e}");
                    store.dispatch(Action::FinishDownload(url));
                    None
                }
            },

            Outcome::Failure(_) | Outcome::Timeout => {
                if !store.state().is_downloading(&url) {
                    return None;
                }

                if matches!(outcome, Outcome::Timeout) {
                    warn!("download of {url} timed out after {:?}", self.timeout);
                } else {
                    warn!("download of {url} failed: {outcome}");
                }

                store.dispatch(Action::FinishDownload(url.clone()));
                let title = self
                    .registry
                    .pending(&url)
                    .map_or_else(|| url.to_string(), |record| record.title.clone());
                Some(Event::DownloadFailed { title, url })
            }
        }
    }

    /// Removes the offline copy of `track`. Returns whether it was
    /// downloaded.
    ///
    /// A cached body that is already gone is not an error.
    pub async fn delete_download(&mut self, track: &Track, agent: Option<&AgentHandle>) -> Result<bool> {
        let Some(record) = self.registry.downloaded(&track.id) else {
            return Ok(false);
        };

        let url = record.audio_url.clone();
        if let Some(agent) = agent {
            match agent.delete_audio(url.clone()).await {
                Ok(true) => {}
                Ok(false) => debug!("{url} was not cached"),
                Err(e) => warn!("could not delete {url} from cache: {e}"),
            }
        }

        self.registry.remove_pending(&url)?;
        self.registry.remove_downloaded(&track.id)?;
        info!("removed offline copy of {track}");
        Ok(true)
    }

    /// Aborts every deadline task.
    pub fn dispose(&mut self) {
        for (_, deadline) in self.deadlines.drain() {
            deadline.abort();
        }
    }
}

impl Drop for Downloads {
    fn drop(&mut self) {
        self.dispose();
    }
}
