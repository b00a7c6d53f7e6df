//! Process signals for shutdown and session restart.
//!
//! * Unix: Ctrl-C (SIGINT) and SIGTERM stop the player, SIGHUP restarts the
//!   session with a freshly read configuration
//! * Windows: Ctrl-C only
//!
//! # Example
//!
//! ```no_run
//! use murattal::signal::{Handler, ShutdownSignal};
//!
//! async fn example() {
//!     let mut signals = Handler::new().unwrap();
//!
//!     match signals.recv().await {
//!         ShutdownSignal::Interrupt | ShutdownSignal::Terminate => {
//!             println!("stopping");
//!         }
//!         ShutdownSignal::Reload => {
//!             println!("restarting session");
//!         }
//!     }
//! }
//! ```

use std::{fmt, future::Future, io};

use crate::error::Result;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signal that ended a session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[expect(clippy::module_name_repetitions)]
pub enum ShutdownSignal {
    /// Ctrl-C or SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP: dispose the session and start a new one.
    Reload,
}

impl ShutdownSignal {
    /// Whether the process should exit rather than restart the session.
    #[must_use]
    pub fn is_exit(self) -> bool {
        !matches!(self, Self::Reload)
    }
}

/// Listener for the signals of [`ShutdownSignal`].
pub struct Handler {
    #[cfg(unix)]
    sigterm: Signal,
    #[cfg(unix)]
    sighup: Signal,
}

impl Handler {
    /// Registers the signal listeners.
    ///
    /// # Errors
    ///
    /// Returns error if signal handlers cannot be registered.
    pub fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next signal.
    ///
    /// On Windows this only waits for Ctrl-C.
    pub async fn recv(&mut self) -> ShutdownSignal {
        #[cfg(unix)]
        {
            tokio::select! {
                () = interrupted(tokio::signal::ctrl_c()) => ShutdownSignal::Interrupt,
                _ = self.sigterm.recv() => ShutdownSignal::Terminate,
                _ = self.sighup.recv() => ShutdownSignal::Reload,
            }
        }

        #[cfg(not(unix))]
        {
            interrupted(tokio::signal::ctrl_c()).await;
            ShutdownSignal::Interrupt
        }
    }
}

/// Waits for `listener` to report Ctrl-C. Never completes when listening
/// failed, so that a broken listener does not stop the player.
async fn interrupted(listener: impl Future<Output = io::Result<()>>) {
    if let Err(e) = listener.await {
        error!("could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "Ctrl+C"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Reload => write!(f, "SIGHUP"),
        }
    }
}
