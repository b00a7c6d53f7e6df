//! Network access for the cache agent.
//!
//! All traffic leaving the session goes through an [`Upstream`], which
//! performs a single request and returns the complete response. The cache
//! agent is generic over it, so that tests can script the network.
//!
//! The production [`Client`] wraps `reqwest::Client` and adds:
//! * Request rate limiting to stay polite towards the archive
//! * Consistent timeouts and headers
//!
//! # Rate Limiting
//!
//! * 50 calls per 5-second interval
//! * Allows bursts up to the maximum calls per interval
//! * Requests that would exceed the limit are delayed
//!
//! # Example
//!
//! ```rust,ignore
//! use murattal::http::{Client, Upstream};
//!
//! let client = Client::new(&config)?;
//! let request = http::Request::get("https://archive.example/audio/1.mp3").body(Vec::new())?;
//! let response = client.fetch(request).await?;
//! ```

use std::{future::Future, num::NonZeroU32, time::Duration};

use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::header::{HeaderValue, ACCEPT};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Request as seen by the cache agent.
pub type Request = http::Request<Vec<u8>>;

/// Fully buffered response.
pub type Response = http::Response<Vec<u8>>;

/// Source of network responses.
///
/// Implementations return `Err` only when no response could be obtained
/// at all; HTTP error statuses are returned as responses. Errors for which
/// [`Error::is_offline`] holds are treated as the network being down.
pub trait Upstream: Send + Sync + 'static {
    fn fetch(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Unlimited request client for special cases.
    ///
    /// Direct access to underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window of the rate limit.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum allowed calls per interval.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 50;

    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    ///
    /// Reads that stall for longer are treated as the network being down,
    /// which lets the agent fall back to its caches quickly.
    const READ_TIMEOUT: Duration = Duration::from_secs(2);

    /// Duration to wait for a connection to be established.
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent);

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .ok_or_else(|| Error::internal("quota time interval is zero"))?
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .ok_or_else(|| Error::internal("calls per interval is zero"))?,
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }
}

impl Upstream for Client {
    /// Executes a request with rate limiting and buffers the response body.
    fn fetch(&self, request: Request) -> impl Future<Output = Result<Response>> + Send {
        async move {
            // No need to await with jitter because the level of concurrency is low.
            self.rate_limiter.until_ready().await;

            let request = reqwest::Request::try_from(request)?;
            trace!("{} {}", request.method(), request.url());
            let response = self.unlimited.execute(request).await?;

            let mut builder = http::Response::builder()
                .status(response.status())
                .version(response.version());
            if let Some(headers) = builder.headers_mut() {
                headers.clone_from(response.headers());
            }

            let body = response.bytes().await?;
            Ok(builder.body(body.to_vec())?)
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted network for tests.

    use std::{
        collections::{HashMap, HashSet},
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    use http::StatusCode;

    use super::*;

    /// Upstream answering from a fixed script and counting requests.
    #[derive(Debug, Default)]
    pub struct ScriptedUpstream {
        responses: Mutex<HashMap<String, (StatusCode, Vec<u8>)>>,
        fetches: Mutex<HashMap<String, usize>>,
        stalled: Mutex<HashSet<String>>,
        offline: AtomicBool,
    }

    impl ScriptedUpstream {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answers GETs of `url` with `status` and `body`.
        pub fn respond(&self, url: &str, status: StatusCode, body: &[u8]) {
            self.responses
                .lock()
                .unwrap()
                .insert(url.to_owned(), (status, body.to_vec()));
        }

        /// Never answers requests for `url`.
        pub fn stall(&self, url: &str) {
            self.stalled.lock().unwrap().insert(url.to_owned());
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        /// Number of requests made for `url`, including failed ones.
        pub fn fetches(&self, url: &str) -> usize {
            self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    impl Upstream for ScriptedUpstream {
        fn fetch(&self, request: Request) -> impl Future<Output = Result<Response>> + Send {
            let url = request.uri().to_string();
            *self.fetches.lock().unwrap().entry(url.clone()).or_default() += 1;
            let stalled = self.stalled.lock().unwrap().contains(&url);

            let result = if self.offline.load(Ordering::SeqCst) {
                Err(Error::unavailable(format!("{url} unreachable")))
            } else {
                let (status, body) = self
                    .responses
                    .lock()
                    .unwrap()
                    .get(&url)
                    .cloned()
                    .unwrap_or((StatusCode::NOT_FOUND, Vec::new()));
                http::Response::builder()
                    .status(status)
                    .body(body)
                    .map_err(Into::into)
            };

            async move {
                if stalled {
                    std::future::pending::<()>().await;
                }
                result
            }
        }
    }
}
