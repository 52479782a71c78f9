/// boxtroll - tracks blind-box profit/loss in a Bilibili live room and
/// reports it back to the gifters as chat messages and to the streamer as an
/// OBS leaderboard.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use dotenvy::dotenv;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use boxtroll::aggregator::Boxtroll;
use boxtroll::api::{ApiError, Client, Credential};
use boxtroll::live::stream::Stream;
use boxtroll::login;
use boxtroll::obs::Studio;
use boxtroll::persistence::{CachedStore, KvStore, Store};
use boxtroll::refresh;
use boxtroll::settings::EVENT_CHANNEL_CAPACITY;

#[derive(Parser)]
#[command(name = "boxtroll", version, about = "Track blind-box profit/loss in a live room")]
struct Cli {
    /// Working directory (default: $BOXTROLL_ROOT or the platform data dir)
    #[arg(short = 'R', long)]
    root_dir: Option<PathBuf>,

    /// Log verbosity; repeat for more detail
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Number of rotated daily log files to keep
    #[arg(long, default_value_t = 10)]
    log_max_files: usize,

    /// Live room to monitor
    #[arg(short = 'r', long)]
    room_id: Option<i64>,

    /// OBS websocket address
    #[arg(short = 'U', long, default_value = "localhost:4455")]
    obs_websocket_addr: String,

    /// OBS websocket password; empty disables the OBS integration
    #[arg(short = 'P', long, default_value = "")]
    obs_password: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Log into Bilibili by scanning a QR code
    Login,
}

struct WorkDirs {
    db: PathBuf,
    log: PathBuf,
    creds: PathBuf,
}

impl WorkDirs {
    fn resolve(root_override: Option<PathBuf>) -> Result<Self> {
        let root = match root_override {
            Some(root) => root,
            None => default_root_dir()?,
        };

        let dirs = Self {
            db: root.join("db"),
            log: root.join("log"),
            creds: root.join("creds"),
        };

        std::fs::create_dir_all(&root).context("failed to create working directory")?;
        std::fs::create_dir_all(&dirs.db).context("failed to create db directory")?;
        std::fs::create_dir_all(&dirs.log).context("failed to create log directory")?;
        std::fs::create_dir_all(&dirs.creds).context("failed to create creds directory")?;

        Ok(dirs)
    }
}

fn default_root_dir() -> Result<PathBuf> {
    if let Ok(root) = std::env::var("BOXTROLL_ROOT") {
        return Ok(PathBuf::from(root));
    }

    let base = if cfg!(windows) {
        std::env::var("LOCALAPPDATA").or_else(|_| std::env::var("USERPROFILE"))
    } else {
        std::env::var("XDG_DATA_HOME").or_else(|_| std::env::var("HOME"))
    };

    base.map(|dir| PathBuf::from(dir).join(".boxtroll"))
        .context("no usable base directory; set BOXTROLL_ROOT")
}

fn init_logging(log_dir: &Path, verbose: u8, max_files: usize) -> Result<WorkerGuard> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("boxtroll")
        .filename_suffix("log")
        .max_log_files(max_files)
        .build(log_dir)
        .context("failed to create log file appender")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    let dirs = WorkDirs::resolve(cli.root_dir.clone())?;
    let _log_guard = init_logging(&dirs.log, cli.verbose, cli.log_max_files)?;

    let client = Arc::new(Client::new()?);

    match cli.command {
        Some(Command::Login) => run_login(&client, &dirs).await,
        None => run(cli, client, dirs).await,
    }
}

async fn run_login(client: &Client, dirs: &WorkDirs) -> Result<()> {
    let credential = login::interactive_login(client).await?;

    login::save_credential(&dirs.creds, &credential)
        .context("failed to save the credential")?;
    println!("Credential saved to {}", dirs.creds.display());

    Ok(())
}

async fn run(cli: Cli, client: Arc<Client>, dirs: WorkDirs) -> Result<()> {
    let uid = initialize_user(&client, &dirs.creds)
        .await
        .context("failed to initialize user")?;
    info!(uid, "user initialized");

    let room_id = cli
        .room_id
        .context("no live room configured; pass --room-id")?;

    let store: Arc<dyn Store> =
        Arc::new(KvStore::open(dirs.db.join("boxtroll.db")).context("failed to open database")?);

    let studio = if cli.obs_password.is_empty() {
        info!("no OBS password configured, OBS integration disabled");
        None
    } else {
        let studio = Studio::initialize(cli.obs_websocket_addr.clone(), cli.obs_password.clone())
            .await
            .context("failed to initialize OBS; is OBS running with the websocket server enabled?")?;
        Some(studio)
    };

    let stream_info = client
        .get_stream_info(room_id)
        .await
        .context("failed to fetch the room's danmaku stream info")?;

    info!("refreshing room and user metadata");
    refresh::refresh_room(&client, &store, room_id)
        .await
        .context("failed to refresh room")?;
    refresh::refresh_all_users(&client, &store, room_id)
        .await
        .context("failed to refresh users")?;
    info!("room and user metadata refreshed");

    let db = Arc::new(CachedStore::new(store, room_id).context("failed to build room cache")?);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_cancel.cancel();
        }
    });

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let stream = Stream::new(room_id, uid, stream_info.token, stream_info.host_list);
    tokio::spawn(stream.run(cancel.clone(), events_tx));

    let boxtroll = Boxtroll::new(db, client, room_id, studio);
    boxtroll.run(cancel, events_rx).await
}

/// Resolve a verified credential, preferring the cached one. An expired
/// session (API code -101) clears the cache and re-runs the QR login.
async fn initialize_user(client: &Client, creds_dir: &Path) -> Result<i64> {
    if let Some(credential) = login::cached_credential(creds_dir)? {
        match verify_credential(client, credential).await {
            Ok(uid) => return Ok(uid),
            Err(e) => {
                let expired = e
                    .downcast_ref::<ApiError>()
                    .map(ApiError::is_credential_expired)
                    .unwrap_or(false);
                if !expired {
                    return Err(e);
                }
                info!("cached credential expired, logging in again");
                login::clear_credential(creds_dir);
            }
        }
    }

    let credential = login::interactive_login(client).await?;
    if let Err(e) = login::save_credential(creds_dir, &credential) {
        warn!(error = %e, "failed to save the credential; you will have to scan again next time");
    }

    verify_credential(client, credential).await
}

/// Attach the device id, install the credential on the client and confirm it
/// works by fetching our own profile.
async fn verify_credential(client: &Client, mut credential: Credential) -> Result<i64> {
    let buvid = client.get_buvid().await.context("failed to fetch buvid")?;
    credential.buvid3 = buvid.b_3;
    client.login(credential);

    let me = client.get_my_info().await?;
    Ok(me.mid)
}
