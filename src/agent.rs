//! Background cache agent.
//!
//! The agent is a long-lived task that sits between sessions and the
//! network. Sessions talk to it only through messages: they send
//! [`Message`]s over an mpsc channel, receive direct replies over oneshot
//! channels, and observe [`Broadcast`]s that the agent sends to every
//! subscriber.
//!
//! # Lifecycle
//!
//! ```text
//! Installing -> Installed -> Activating -> Activated -> Redundant
//! ```
//!
//! * Installing: open the cache partitions and precache the shell assets.
//!   A failed install makes the agent redundant straight away; sessions then
//!   fetch directly from the network without offline support.
//! * Installed: wait for `SkipWaiting`, unless skip-waiting was requested at
//!   registration, in which case activation follows immediately.
//! * Activating: delete every partition that is not one of the three
//!   current ones and retire the previous version.
//! * Activated: intercept fetches.
//!
//! # Caching policies
//!
//! | Class  | Matched by                     | Policy                          |
//! |--------|--------------------------------|---------------------------------|
//! | audio  | file extension                 | cache first, 404 when offline   |
//! | API    | path prefix or host            | network first, 503 when offline |
//! | static | everything else                | cache first, offline page       |
//!
//! Requests other than GET, and URLs other than HTTP(S), are passed through
//! untouched.

use std::{fmt, sync::Arc, time::Duration};

use exponential_backoff::Backoff;
use http::{
    header::{ACCEPT, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{
    cache::CacheStorage,
    config::{CacheConfig, Config},
    error::{Error, Result},
    http::{Request, Response, Upstream},
};

/// Header marking a synthesized response for uncached audio.
pub const OFFLINE_UNAVAILABLE: &str = "x-offline-unavailable";

/// File extensions of audio resources.
pub const AUDIO_EXTENSIONS: [&str; 8] = ["mp3", "m4a", "aac", "ogg", "opus", "wav", "flac", "webm"];

/// Attempts per precached asset.
const PRECACHE_ATTEMPTS: u32 = 3;

/// Capacity of the message queue of an agent.
const QUEUE_LEN: usize = 64;

/// Capacity of the broadcast channel; slower subscribers miss broadcasts.
const BROADCAST_LEN: usize = 32;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AgentState {
    #[default]
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Installing => write!(f, "installing"),
            Self::Installed => write!(f, "installed"),
            Self::Activating => write!(f, "activating"),
            Self::Activated => write!(f, "activated"),
            Self::Redundant => write!(f, "redundant"),
        }
    }
}

/// Messages accepted by the agent.
#[derive(Debug)]
pub enum Message {
    /// Fetch `url` into the audio partition. Replies with the stored size.
    CacheAudio {
        url: Url,
        reply: Option<oneshot::Sender<Result<u64>>>,
    },
    /// Remove `url` from the audio partition. Replies with whether it was
    /// cached.
    DeleteAudio {
        url: Url,
        reply: Option<oneshot::Sender<Result<bool>>>,
    },
    /// Activate a waiting agent.
    SkipWaiting,
    /// Intercepted request of a session.
    Fetch {
        request: Request,
        reply: oneshot::Sender<Result<Response>>,
    },
}

/// JSON form of the messages sessions can post.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    CacheAudio { url: Url },
    DeleteAudio { url: Url },
    SkipWaiting,
}

impl Message {
    /// The wire form of this message, if it has one.
    #[must_use]
    pub fn wire(&self) -> Option<WireMessage> {
        match self {
            Self::CacheAudio { url, .. } => Some(WireMessage::CacheAudio { url: url.clone() }),
            Self::DeleteAudio { url, .. } => Some(WireMessage::DeleteAudio { url: url.clone() }),
            Self::SkipWaiting => Some(WireMessage::SkipWaiting),
            Self::Fetch { .. } => None,
        }
    }
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::CacheAudio { url } => Self::CacheAudio { url, reply: None },
            WireMessage::DeleteAudio { url } => Self::DeleteAudio { url, reply: None },
            WireMessage::SkipWaiting => Self::SkipWaiting,
        }
    }
}

/// Notifications sent to every subscribed session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Broadcast {
    DownloadComplete { url: Url, success: bool },
    DownloadError { url: Url, success: bool },
}

impl Broadcast {
    #[must_use]
    pub fn url(&self) -> &Url {
        match self {
            Self::DownloadComplete { url, .. } | Self::DownloadError { url, .. } => url,
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        match self {
            Self::DownloadComplete { success, .. } | Self::DownloadError { success, .. } => *success,
        }
    }
}

/// Names of the three cache partitions of one agent version.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheNames {
    pub static_shell: String,
    pub dynamic: String,
    pub audio: String,
}

impl CacheNames {
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        [&self.static_shell, &self.dynamic, &self.audio]
            .into_iter()
            .any(|current| current == name)
    }
}

impl fmt::Display for CacheNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}+{}", self.static_shell, self.dynamic, self.audio)
    }
}

/// Classes of intercepted requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Audio,
    Api,
    Static,
}

/// Everything an agent version is installed with.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    pub origin: Url,
    pub names: CacheNames,
    pub cache: CacheConfig,
    /// Activate right after install instead of waiting for `SkipWaiting`.
    pub skip_waiting: bool,
}

impl AgentOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let [static_shell, dynamic, audio] = config.cache_names();
        Self {
            origin: config.origin.clone(),
            names: CacheNames {
                static_shell,
                dynamic,
                audio,
            },
            cache: config.cache.clone(),
            skip_waiting: true,
        }
    }

    /// Classifies a GET request for `url`.
    #[must_use]
    pub fn classify(&self, url: &Url) -> ResourceClass {
        let extension = url
            .path_segments()
            .and_then(Iterator::last)
            .and_then(|segment| segment.rsplit_once('.'))
            .map(|(_, extension)| extension.to_ascii_lowercase());
        if extension.is_some_and(|extension| AUDIO_EXTENSIONS.contains(&extension.as_str())) {
            return ResourceClass::Audio;
        }

        let api_host = url
            .host_str()
            .is_some_and(|host| self.cache.api_hosts.iter().any(|api| api == host));
        let api_path = self
            .cache
            .api_prefixes
            .iter()
            .any(|prefix| url.path().starts_with(prefix.as_str()));
        if api_host || api_path {
            return ResourceClass::Api;
        }

        ResourceClass::Static
    }

    fn offline_page(&self) -> Result<Url> {
        Ok(self.origin.join(&self.cache.offline_page)?)
    }
}

/// Handle to a running agent version.
///
/// Cloning yields another handle to the same agent.
#[derive(Clone, Debug)]
pub struct AgentHandle {
    id: Uuid,
    version: Arc<str>,
    skip_waiting: bool,
    tx: mpsc::Sender<Message>,
    events: broadcast::Sender<Broadcast>,
    state: watch::Receiver<AgentState>,
    cancel: CancellationToken,
}

impl AgentHandle {
    /// Spawns a new agent version and starts installing it.
    ///
    /// `previous` is retired once the new version activates.
    pub fn spawn<U>(
        options: AgentOptions,
        upstream: Arc<U>,
        caches: Arc<CacheStorage>,
        previous: Option<AgentHandle>,
    ) -> Self
    where
        U: Upstream,
    {
        let (tx, rx) = mpsc::channel(QUEUE_LEN);
        let (events, _) = broadcast::channel(BROADCAST_LEN);
        let (state_tx, state) = watch::channel(AgentState::Installing);
        let cancel = CancellationToken::new();

        let handle = Self {
            id: Uuid::new_v4(),
            version: options.names.to_string().into(),
            skip_waiting: options.skip_waiting,
            tx,
            events: events.clone(),
            state,
            cancel: cancel.clone(),
        };

        let agent = Agent {
            id: handle.id,
            worker: Arc::new(Worker {
                options,
                upstream,
                caches,
                events,
            }),
            state: state_tx,
            previous,
            cancel,
        };
        tokio::spawn(agent.run(rx));

        handle
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Version tag derived from the cache partition names.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == AgentState::Activated
    }

    /// Subscribes to broadcasts sent after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.events.subscribe()
    }

    /// Waits until the agent reached a state it stays in without further
    /// input: activated, redundant, or installed when waiting for
    /// `SkipWaiting`.
    pub async fn settled(&self) -> AgentState {
        let skip_waiting = self.skip_waiting;
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|state| match state {
                AgentState::Installing | AgentState::Activating => false,
                AgentState::Installed => !skip_waiting,
                AgentState::Activated | AgentState::Redundant => true,
            })
            .await
            .map(|state| *state);
        settled.unwrap_or(AgentState::Redundant)
    }

    /// Posts `message` to the agent.
    ///
    /// # Errors
    ///
    /// Fails with `Unavailable` when the agent has shut down.
    pub async fn send(&self, message: Message) -> Result<()> {
        if let Some(wire) = message.wire() {
            if let Ok(json) = serde_json::to_string(&wire) {
                debug!("posting {json} to agent {}", self.id);
            }
        }
        self.tx.send(message).await?;
        Ok(())
    }

    /// Caches `url` and waits for the reply.
    pub async fn cache_audio(&self, url: Url) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::CacheAudio {
            url,
            reply: Some(reply),
        })
        .await?;
        rx.await?
    }

    /// Removes `url` from the audio cache and waits for the reply.
    pub async fn delete_audio(&self, url: Url) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::DeleteAudio {
            url,
            reply: Some(reply),
        })
        .await?;
        rx.await?
    }

    pub async fn skip_waiting(&self) -> Result<()> {
        self.send(Message::SkipWaiting).await
    }

    /// Sends `request` through the agent.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Fetch { request, reply }).await?;
        rx.await?
    }

    /// Stops the agent. It becomes redundant.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}

/// State shared by the agent loop and the tasks it spawns.
struct Worker<U> {
    options: AgentOptions,
    upstream: Arc<U>,
    caches: Arc<CacheStorage>,
    events: broadcast::Sender<Broadcast>,
}

struct Agent<U> {
    id: Uuid,
    worker: Arc<Worker<U>>,
    state: watch::Sender<AgentState>,
    previous: Option<AgentHandle>,
    cancel: CancellationToken,
}

impl<U> Agent<U>
where
    U: Upstream,
{
    fn set_state(&self, state: AgentState) {
        debug!("agent {} {state}", self.id);
        self.state.send_replace(state);
    }

    fn current_state(&self) -> AgentState {
        *self.state.borrow()
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        self.set_state(AgentState::Installing);
        if let Err(e) = self.worker.install().await {
            error!("agent {} failed to install, offline support disabled: {e}", self.id);
            self.set_state(AgentState::Redundant);
            return;
        }
        self.set_state(AgentState::Installed);

        if self.worker.options.skip_waiting {
            self.activate().await;
        }

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                message = rx.recv() => {
                    match message {
                        Some(message) => self.handle(message).await,
                        None => break,
                    }
                }
            }
        }

        self.set_state(AgentState::Redundant);
        debug!("agent {} stopped", self.id);
    }

    async fn activate(&mut self) {
        self.set_state(AgentState::Activating);

        if let Err(e) = self.worker.collect_garbage().await {
            warn!("could not delete stale caches: {e}");
        }

        if let Some(previous) = self.previous.take() {
            debug!("retiring agent {}", previous.id());
            previous.terminate();
        }

        self.set_state(AgentState::Activated);
        info!("agent {} activated and controlling sessions", self.id);
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::SkipWaiting => {
                if self.current_state() == AgentState::Installed {
                    self.activate().await;
                }
            }

            Message::CacheAudio { url, reply } => {
                let worker = Arc::clone(&self.worker);
                tokio::spawn(async move {
                    let result = worker.cache_audio(&url).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                });
            }

            Message::DeleteAudio { url, reply } => {
                let result = self
                    .worker
                    .caches
                    .delete(&self.worker.options.names.audio, &url)
                    .await;
                if let Err(e) = &result {
                    warn!("could not delete {url}: {e}");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }

            Message::Fetch { request, reply } => {
                let worker = Arc::clone(&self.worker);
                let intercept = self.current_state() == AgentState::Activated;
                tokio::spawn(async move {
                    let result = if intercept {
                        worker.respond(request).await
                    } else {
                        worker.upstream.fetch(request).await
                    };
                    let _ = reply.send(result);
                });
            }
        }
    }
}

impl<U> Worker<U>
where
    U: Upstream,
{
    /// Opens the partitions of this version and precaches the manifest.
    ///
    /// A version whose partitions survived from an earlier run installs
    /// without the network: cached assets are kept when refreshing them
    /// fails.
    async fn install(&self) -> Result<()> {
        let names = &self.options.names;
        let existing = self.caches.keys()?;
        let reinstall = [&names.static_shell, &names.audio]
            .into_iter()
            .any(|name| existing.contains(name));

        for name in [&names.static_shell, &names.dynamic, &names.audio] {
            self.caches.open_partition(name).await?;
        }

        let assets = self
            .options
            .cache
            .precache
            .iter()
            .map(|asset| self.options.origin.join(asset))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut cached = true;
        for url in &assets {
            cached &= self.caches.contains(&names.static_shell, url)?;
        }
        if reinstall && cached {
            debug!("{} already holds the manifest", names.static_shell);
            return Ok(());
        }

        for url in &assets {
            if let Err(e) = self.precache(url).await {
                if !reinstall {
                    return Err(e);
                }
                warn!("could not refresh {url}, keeping what is cached: {e}");
            }
        }

        Ok(())
    }

    async fn precache(&self, url: &Url) -> Result<()> {
        let backoff = Backoff::new(
            PRECACHE_ATTEMPTS,
            Duration::from_millis(100),
            Duration::from_secs(2),
        );

        for delay in &backoff {
            let result = match self.upstream.fetch(get(url)?).await {
                Ok(response) if response.status().is_success() => {
                    self.caches
                        .put(&self.options.names.static_shell, url, &response)
                        .await
                }
                Ok(response) => Err(Error::unavailable(format!(
                    "{url} answered {}",
                    response.status()
                ))),
                Err(e) => Err(e),
            };

            match result {
                Ok(_) => return Ok(()),
                Err(e) => match delay {
                    Some(delay) => {
                        debug!("precaching {url} failed, retrying in {delay:?}: {e}");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }

        Err(Error::unavailable(format!("could not precache {url}")))
    }

    async fn collect_garbage(&self) -> Result<()> {
        for name in self.caches.keys()? {
            if !self.options.names.contains(&name) {
                info!("deleting stale cache {name}");
                self.caches.delete_partition(&name).await?;
            }
        }
        Ok(())
    }

    async fn cache_audio(&self, url: &Url) -> Result<u64> {
        let result = self.fetch_audio(url).await;
        let broadcast = match &result {
            Ok(size) => {
                debug!("cached {url} ({size} bytes)");
                Broadcast::DownloadComplete {
                    url: url.clone(),
                    success: true,
                }
            }
            Err(e) => {
                warn!("caching {url} failed: {e}");
                Broadcast::DownloadError {
                    url: url.clone(),
                    success: false,
                }
            }
        };

        // No subscribers is fine.
        let _ = self.events.send(broadcast);
        result
    }

    async fn fetch_audio(&self, url: &Url) -> Result<u64> {
        let partition = &self.options.names.audio;
        if let Some(size) = self.caches.size(partition, url)? {
            return Ok(size);
        }

        let response = self.upstream.fetch(get(url)?).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(match status {
                StatusCode::NOT_FOUND | StatusCode::GONE => {
                    Error::not_found(format!("{url} answered {status}"))
                }
                _ => Error::unavailable(format!("{url} answered {status}")),
            });
        }

        self.caches.put(partition, url, &response).await
    }

    /// Answers an intercepted request according to its resource class.
    async fn respond(&self, request: Request) -> Result<Response> {
        let url = match Url::parse(&request.uri().to_string()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return self.upstream.fetch(request).await,
        };
        if request.method() != Method::GET {
            return self.upstream.fetch(request).await;
        }

        match self.options.classify(&url) {
            ResourceClass::Audio => self.respond_audio(request, &url).await,
            ResourceClass::Api => self.respond_api(request, &url).await,
            ResourceClass::Static => self.respond_static(request, &url).await,
        }
    }

    async fn respond_audio(&self, request: Request, url: &Url) -> Result<Response> {
        let partition = &self.options.names.audio;
        if let Some(cached) = self.caches.match_url(partition, url).await? {
            trace!("serving {url} from {partition}");
            return Ok(cached);
        }

        match self.upstream.fetch(request).await {
            Ok(response) => {
                self.store(partition, url, &response).await;
                Ok(response)
            }
            Err(e) => {
                debug!("{url} is not available offline: {e}");
                Ok(http::Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .header(OFFLINE_UNAVAILABLE, "audio")
                    .body(Vec::new())?)
            }
        }
    }

    async fn respond_api(&self, request: Request, url: &Url) -> Result<Response> {
        let partition = &self.options.names.dynamic;
        match self.upstream.fetch(request).await {
            Ok(response) => {
                self.store(partition, url, &response).await;
                Ok(response)
            }
            Err(e) => {
                if let Some(cached) = self.caches.match_url(partition, url).await? {
                    debug!("serving stale {url}: {e}");
                    return Ok(cached);
                }
                Ok(http::Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .header(CONTENT_TYPE, "application/json")
                    .body(serde_json::to_vec(&serde_json::json!({ "error": "offline" }))?)?)
            }
        }
    }

    async fn respond_static(&self, request: Request, url: &Url) -> Result<Response> {
        let partition = &self.options.names.static_shell;
        if let Some(cached) = self.caches.match_url(partition, url).await? {
            return Ok(cached);
        }

        let navigation = is_navigation(&request);
        match self.upstream.fetch(request).await {
            Ok(response) => {
                self.store(partition, url, &response).await;
                Ok(response)
            }
            Err(e) if navigation => {
                debug!("navigating to {url} offline: {e}");
                let offline_page = self.options.offline_page()?;
                if let Some(cached) = self.caches.match_url(partition, &offline_page).await? {
                    return Ok(cached);
                }
                Ok(http::Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .header(CONTENT_TYPE, "text/html; charset=utf-8")
                    .body(b"<!doctype html><title>Offline</title><h1>Offline</h1>".to_vec())?)
            }
            Err(e) => Err(e),
        }
    }

    /// Stores successful responses; anything else is not worth keeping.
    async fn store(&self, partition: &str, url: &Url, response: &Response) {
        if response.status().is_success() {
            if let Err(e) = self.caches.put(partition, url, response).await {
                warn!("could not cache {url}: {e}");
            }
        }
    }
}

/// Builds a body-less GET request for `url`.
pub fn get(url: &Url) -> Result<Request> {
    Ok(http::Request::get(url.as_str()).body(Vec::new())?)
}

/// Whether `request` loads a document rather than a subresource.
fn is_navigation(request: &Request) -> bool {
    request
        .headers()
        .get(ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

/// Agent versions installed for one origin.
///
/// At most one version controls sessions at a time. Registering a version
/// that is already active returns it unchanged; registering a new version
/// installs it next to the active one. Without skip-waiting the new version
/// waits until it receives `SkipWaiting`.
pub struct Registration<U> {
    upstream: Arc<U>,
    caches: Arc<CacheStorage>,
    active: Option<AgentHandle>,
    waiting: Option<AgentHandle>,
}

impl<U> Registration<U>
where
    U: Upstream,
{
    #[must_use]
    pub fn new(upstream: Arc<U>, caches: Arc<CacheStorage>) -> Self {
        Self {
            upstream,
            caches,
            active: None,
            waiting: None,
        }
    }

    /// Registers the agent version described by `options` and waits until it
    /// settled.
    pub async fn register(&mut self, options: AgentOptions) -> AgentHandle {
        self.promote();
        let version = options.names.to_string();

        for candidate in [&self.active, &self.waiting].into_iter().flatten() {
            if candidate.version() == version && candidate.state() != AgentState::Redundant {
                debug!("agent version {version} already registered");
                return candidate.clone();
            }
        }

        info!("installing agent version {version}");
        let handle = AgentHandle::spawn(
            options,
            Arc::clone(&self.upstream),
            Arc::clone(&self.caches),
            self.active.clone(),
        );

        match handle.settled().await {
            AgentState::Activated => {
                if let Some(waiting) = self.waiting.take() {
                    waiting.terminate();
                }
                self.active = Some(handle.clone());
            }
            AgentState::Installed => {
                if let Some(waiting) = self.waiting.replace(handle.clone()) {
                    waiting.terminate();
                }
                info!("agent version {version} is waiting to activate");
            }
            state => warn!("agent version {version} is {state}"),
        }

        handle
    }

    /// The version controlling sessions, if any.
    pub fn controller(&mut self) -> Option<AgentHandle> {
        self.promote();
        self.active.clone().filter(AgentHandle::is_active)
    }

    #[must_use]
    pub fn waiting(&self) -> Option<&AgentHandle> {
        self.waiting.as_ref()
    }

    /// Terminates every version.
    pub fn unregister(&mut self) {
        for handle in [self.active.take(), self.waiting.take()].into_iter().flatten() {
            handle.terminate();
        }
    }

    fn promote(&mut self) {
        if self.waiting.as_ref().is_some_and(AgentHandle::is_active) {
            self.active = self.waiting.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::ScriptedUpstream;

    const ORIGIN: &str = "https://archive.example/";

    fn options(audio_version: &str) -> AgentOptions {
        let mut config = Config {
            origin: Url::parse(ORIGIN).unwrap(),
            ..Config::default()
        };
        config.cache.audio_version = audio_version.to_owned();
        config.cache.api_hosts = vec!["api.archive.example".to_owned()];
        AgentOptions::from_config(&config)
    }

    fn online() -> Arc<ScriptedUpstream> {
        let upstream = ScriptedUpstream::new();
        upstream.respond(ORIGIN, StatusCode::OK, b"<html>shell</html>");
        upstream.respond(
            "https://archive.example/offline.html",
            StatusCode::OK,
            b"<html>offline</html>",
        );
        upstream.respond("https://archive.example/manifest.json", StatusCode::OK, b"{}");
        upstream.respond("https://archive.example/audio/1.mp3", StatusCode::OK, b"ID3");
        Arc::new(upstream)
    }

    async fn activated(upstream: &Arc<ScriptedUpstream>) -> (AgentHandle, Arc<CacheStorage>) {
        let caches = Arc::new(CacheStorage::in_memory());
        let agent = AgentHandle::spawn(
            options("v1"),
            Arc::clone(upstream),
            Arc::clone(&caches),
            None,
        );
        assert_eq!(agent.settled().await, AgentState::Activated);
        (agent, caches)
    }

    async fn reach(agent: &AgentHandle, target: AgentState) {
        let mut state = agent.state.clone();
        state.wait_for(|state| *state == target).await.unwrap();
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn requests_are_classified() {
        let options = options("v1");
        assert_eq!(
            options.classify(&url("https://cdn.example/r/1.MP3?sig=x")),
            ResourceClass::Audio
        );
        assert_eq!(
            options.classify(&url("https://archive.example/api/surahs")),
            ResourceClass::Api
        );
        assert_eq!(
            options.classify(&url("https://archive.example/rest/v1/reciters")),
            ResourceClass::Api
        );
        assert_eq!(
            options.classify(&url("https://api.archive.example/anything")),
            ResourceClass::Api
        );
        assert_eq!(
            options.classify(&url("https://archive.example/app.js")),
            ResourceClass::Static
        );
    }

    #[test]
    fn wire_format() {
        let message = Message::CacheAudio {
            url: url("https://archive.example/audio/1.mp3"),
            reply: None,
        };
        assert_eq!(
            serde_json::to_value(message.wire().unwrap()).unwrap(),
            serde_json::json!({ "type": "CACHE_AUDIO", "url": "https://archive.example/audio/1.mp3" })
        );

        let wire: WireMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
        assert!(matches!(Message::from(wire), Message::SkipWaiting));

        let broadcast = Broadcast::DownloadError {
            url: url("https://archive.example/audio/1.mp3"),
            success: false,
        };
        assert_eq!(
            serde_json::to_value(&broadcast).unwrap(),
            serde_json::json!({
                "type": "DOWNLOAD_ERROR",
                "url": "https://archive.example/audio/1.mp3",
                "success": false,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn install_precaches_and_collects_garbage() {
        let upstream = online();
        let caches = Arc::new(CacheStorage::in_memory());
        for stale in ["static-v2", "audio-v0", "unrelated"] {
            caches.open_partition(stale).await.unwrap();
        }

        let agent = AgentHandle::spawn(
            options("v1"),
            Arc::clone(&upstream),
            Arc::clone(&caches),
            None,
        );
        assert_eq!(agent.settled().await, AgentState::Activated);

        let mut keys = caches.keys().unwrap();
        keys.sort();
        assert_eq!(keys, ["audio-v1", "dynamic-v3", "static-v3"]);
        assert_eq!(caches.len("static-v3").unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_install_is_redundant() {
        let upstream = Arc::new(ScriptedUpstream::new());
        let caches = Arc::new(CacheStorage::in_memory());
        let mut registration = Registration::new(Arc::clone(&upstream), caches);

        let agent = registration.register(options("v1")).await;
        assert_eq!(agent.state(), AgentState::Redundant);
        assert_eq!(upstream.fetches(ORIGIN), PRECACHE_ATTEMPTS as usize);
        assert!(registration.controller().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn caching_audio_twice_fetches_once() {
        let upstream = online();
        let (agent, _caches) = activated(&upstream).await;
        let mut events = agent.subscribe();
        let audio = url("https://archive.example/audio/1.mp3");

        assert_eq!(agent.cache_audio(audio.clone()).await.unwrap(), 3);
        assert_eq!(agent.cache_audio(audio.clone()).await.unwrap(), 3);
        assert_eq!(upstream.fetches(audio.as_str()), 1);

        for _ in 0..2 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.url(), &audio);
            assert!(event.success());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_caching_broadcasts_error() {
        let upstream = online();
        let (agent, caches) = activated(&upstream).await;
        let mut events = agent.subscribe();
        let missing = url("https://archive.example/audio/404.mp3");

        let error = agent.cache_audio(missing.clone()).await.unwrap_err();
        assert_eq!(error.kind, crate::error::ErrorKind::NotFound);
        assert_eq!(
            events.recv().await.unwrap(),
            Broadcast::DownloadError {
                url: missing.clone(),
                success: false
            }
        );
        assert!(!caches.contains("audio-v1", &missing).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_audio() {
        let upstream = online();
        let (agent, _caches) = activated(&upstream).await;
        let cached = url("https://archive.example/audio/1.mp3");
        agent.cache_audio(cached.clone()).await.unwrap();

        upstream.set_offline(true);
        let response = agent.fetch(get(&cached).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"ID3");

        let uncached = url("https://archive.example/audio/2.mp3");
        let response = agent.fetch(get(&uncached).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[OFFLINE_UNAVAILABLE], "audio");
    }

    #[tokio::test(start_paused = true)]
    async fn api_is_network_first() {
        let upstream = online();
        let (agent, _caches) = activated(&upstream).await;
        let surahs = url("https://archive.example/api/surahs");
        upstream.respond(surahs.as_str(), StatusCode::OK, b"[1]");

        let response = agent.fetch(get(&surahs).unwrap()).await.unwrap();
        assert_eq!(response.body(), b"[1]");

        upstream.respond(surahs.as_str(), StatusCode::OK, b"[1,2]");
        let response = agent.fetch(get(&surahs).unwrap()).await.unwrap();
        assert_eq!(response.body(), b"[1,2]");

        upstream.set_offline(true);
        let response = agent.fetch(get(&surahs).unwrap()).await.unwrap();
        assert_eq!(response.body(), b"[1,2]");

        let reciters = url("https://archive.example/api/reciters");
        let response = agent.fetch(get(&reciters).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body, serde_json::json!({ "error": "offline" }));
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_falls_back_to_offline_page() {
        let upstream = online();
        let (agent, _caches) = activated(&upstream).await;
        upstream.set_offline(true);

        let request = http::Request::get("https://archive.example/surah/36")
            .header(ACCEPT, "text/html,application/xhtml+xml")
            .body(Vec::new())
            .unwrap();
        let response = agent.fetch(request).await.unwrap();
        assert_eq!(response.body(), b"<html>offline</html>");

        let subresource = get(&url("https://archive.example/app.js")).unwrap();
        assert!(agent.fetch(subresource).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn non_get_passes_through() {
        let upstream = online();
        let (agent, caches) = activated(&upstream).await;
        let audio = url("https://archive.example/audio/1.mp3");

        let request = http::Request::post(audio.as_str()).body(b"x".to_vec()).unwrap();
        let response = agent.fetch(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.fetches(audio.as_str()), 1);
        assert!(!caches.contains("audio-v1", &audio).unwrap());
    }

    #[tokio::test]
    async fn offline_cold_start_keeps_downloads() {
        let root = std::env::temp_dir().join(format!("murattal-agent-{}", Uuid::new_v4()));
        let upstream = online();
        let audio = url("https://archive.example/audio/1.mp3");
        {
            let caches = Arc::new(CacheStorage::open(&root).await.unwrap());
            let mut registration = Registration::new(Arc::clone(&upstream), caches);
            let agent = registration.register(options("v1")).await;
            agent.cache_audio(audio.clone()).await.unwrap();
            registration.unregister();
        }

        upstream.set_offline(true);
        let before = upstream.fetches(ORIGIN);
        let caches = Arc::new(CacheStorage::open(&root).await.unwrap());
        let mut registration = Registration::new(Arc::clone(&upstream), caches);
        let agent = registration.register(options("v1")).await;

        assert_eq!(agent.state(), AgentState::Activated);
        assert!(registration.controller().is_some());
        assert_eq!(upstream.fetches(ORIGIN), before);

        let response = agent.fetch(get(&audio).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"ID3");

        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn partial_cache_survives_failed_refresh() {
        let upstream = online();
        let caches = Arc::new(CacheStorage::in_memory());
        caches.open_partition("audio-v1").await.unwrap();

        upstream.set_offline(true);
        let agent = AgentHandle::spawn(
            options("v1"),
            Arc::clone(&upstream),
            Arc::clone(&caches),
            None,
        );

        assert_eq!(agent.settled().await, AgentState::Activated);
        assert_eq!(upstream.fetches(ORIGIN), PRECACHE_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn other_schemes_pass_through() {
        let upstream = online();
        let (agent, caches) = activated(&upstream).await;
        let mirror = "ftp://archive.example/audio/1.mp3";
        upstream.respond(mirror, StatusCode::OK, b"ID3");

        let request = http::Request::get(mirror).body(Vec::new()).unwrap();
        let response = agent.fetch(request).await.unwrap();
        assert_eq!(response.body(), b"ID3");
        assert_eq!(upstream.fetches(mirror), 1);
        assert!(!caches.contains("audio-v1", &url(mirror)).unwrap());

        upstream.set_offline(true);
        let request = http::Request::get(mirror).body(Vec::new()).unwrap();
        assert!(agent.fetch(request).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn new_version_waits_for_skip_waiting() {
        let upstream = online();
        let caches = Arc::new(CacheStorage::in_memory());
        let mut registration = Registration::new(Arc::clone(&upstream), Arc::clone(&caches));

        let first = registration.register(options("v1")).await;
        assert!(first.is_active());
        let again = registration.register(options("v1")).await;
        assert_eq!(again.id(), first.id());

        let mut update = options("v2");
        update.skip_waiting = false;
        let second = registration.register(update).await;
        assert_eq!(second.state(), AgentState::Installed);
        assert_eq!(registration.controller().unwrap().id(), first.id());
        assert_eq!(registration.waiting().unwrap().id(), second.id());

        second.skip_waiting().await.unwrap();
        reach(&second, AgentState::Activated).await;
        reach(&first, AgentState::Redundant).await;

        assert_eq!(registration.controller().unwrap().id(), second.id());
        assert!(!caches.keys().unwrap().contains(&"audio-v1".to_owned()));
    }
}
