use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use url::Url;

use murattal::{
    agent::Registration,
    cache::CacheStorage,
    config::Config,
    events::Event,
    http,
    session::{Command, Output, Session},
    signal::{self, ShutdownSignal},
    storage::{FileStorage, Storage},
    track::Track,
    transport::Action,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Configuration file read when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "murattal.toml";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Without this option `murattal.toml` is read when it exists, and the
    /// built-in defaults are used otherwise.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "MURATTAL_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for downloads, history and caches
    ///
    /// Overrides `data_dir` of the configuration file.
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath, env = "MURATTAL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Archive origin
    ///
    /// Overrides `origin` of the configuration file.
    #[arg(long, value_hint = ValueHint::Url)]
    origin: Option<String>,

    /// Disable crossfading
    ///
    /// Volume changes on play, pause and skip become instant.
    #[arg(long, default_value_t = false)]
    no_crossfade: bool,

    /// Queue the tracks of a JSON playlist on start
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    playlist: Option<PathBuf>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Reads the configuration and applies command line overrides.
///
/// # Errors
///
/// Returns an error if an explicitly given file cannot be read or any file
/// is invalid.
fn load_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None if fs::metadata(DEFAULT_CONFIG_FILE).is_ok() => {
            Config::from_file(DEFAULT_CONFIG_FILE)?
        }
        None => {
            info!("no {DEFAULT_CONFIG_FILE} found, using defaults");
            Config::default()
        }
    };

    if let Some(data_dir) = &args.data_dir {
        config.data_dir.clone_from(data_dir);
    }
    if let Some(origin) = &args.origin {
        config.origin = Url::parse(origin)?;
    }
    if args.no_crossfade {
        config.playback.crossfade = false;
    }

    Ok(config)
}

/// Reads a playlist: a JSON array of tracks.
fn load_playlist(path: &Path) -> Result<Vec<Track>, Box<dyn Error>> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Forwards console lines as commands until stdin closes.
fn console(commands: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Command>() {
                    Ok(command) => {
                        if commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("{e}"),
                },
                Ok(None) => {
                    let _ = commands.send(Command::Quit).await;
                    break;
                }
                Err(e) => {
                    error!("error reading console: {e}");
                    break;
                }
            }
        }
    })
}

/// Logs session events until the session ends.
fn report(mut events: mpsc::UnboundedReceiver<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Play => info!("playing"),
                Event::Pause => info!("paused"),
                Event::TrackChanged { id } => debug!("track changed to {id}"),
                Event::SleepTimerExpired => info!("sleep timer expired, pausing"),
                Event::Unavailable { id } => warn!("track {id} is unavailable"),
                Event::DownloadComplete { title, .. } => info!("{title} is available offline"),
                Event::DownloadFailed { title, url } => {
                    warn!("downloading {title} from {url} failed; retry later");
                }
                Event::OfflineReady => info!("offline playback is available"),
            }
        }
    })
}

/// Main application loop.
///
/// # Errors
///
/// This function returns an error when the configuration is invalid or the
/// data directory cannot be used.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut signals = signal::Handler::new()?;

    // The cache agent outlives sessions, so that a restart reuses the
    // installed version unless the cache versions changed.
    let config = load_config(&args)?;
    let upstream = Arc::new(http::Client::new(&config)?);
    let caches = if config.cache.persistent {
        CacheStorage::open(config.data_dir.join("caches")).await?
    } else {
        CacheStorage::in_memory()
    };
    let mut registration = Registration::new(Arc::clone(&upstream), Arc::new(caches));

    let (commands_tx, mut commands) = mpsc::channel(16);
    let console = console(commands_tx);
    let mut playlist = args.playlist.as_deref().map(load_playlist).transpose()?;

    // Restart after sleeping some duration when a session cannot start. The
    // initial start happens immediately.
    let mut restart_delay = Duration::ZERO;

    let result = loop {
        if !restart_delay.is_zero() {
            info!("restarting in {:.1}s", restart_delay.as_secs_f32());
            tokio::select! {
                biased;
                signal = signals.recv() => {
                    if signal.is_exit() {
                        info!("shutting down on {signal}");
                        break Ok(());
                    }
                }
                () = tokio::time::sleep(restart_delay) => {}
            }
        }

        let config = load_config(&args)?;
        let storage: Arc<dyn Storage> = match FileStorage::open(&config.data_dir) {
            Ok(storage) => Arc::new(storage),
            Err(e) => break Err(e.into()),
        };

        let output = Output::rodio(&config.playback);
        let mut session = match Session::init(
            &config,
            Arc::clone(&upstream),
            &mut registration,
            storage,
            output,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                error!("{e}");
                // Sleep with jitter so that restarts do not align.
                restart_delay = Duration::from_millis(fastrand::u64(5_000..6_000));
                continue;
            }
        };
        restart_delay = Duration::ZERO;

        let reporter = session.events().map(report);
        if let Some(tracks) = playlist.take() {
            info!("queueing {} tracks", tracks.len());
            session.dispatch(Action::SetQueue(tracks)).await;
        }

        let signal = tokio::select! {
            // Prioritize shutdown signals.
            biased;

            signal = signals.recv() => Some(signal),

            result = session.run(&mut commands) => {
                if let Err(e) = result {
                    error!("{e}");
                }
                None
            }
        };

        if let Err(e) = session.dispose() {
            error!("could not save session: {e}");
        }
        if let Some(reporter) = reporter {
            let _ = reporter.await;
        }

        match signal {
            Some(ShutdownSignal::Reload) => info!("restarting session on {}", ShutdownSignal::Reload),
            Some(signal) => {
                info!("shutting down on {signal}");
                break Ok(());
            }
            None => break Ok(()),
        }
    };

    console.abort();
    registration.unregister();
    result
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
