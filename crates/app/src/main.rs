use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use course_core::model::{ModuleId, Percent, UnlockState, UserId};
use services::playback::{SimulatedConnector, SimulatedPlayer};
use services::{AppServices, Clock, ModuleStatus, SessionReport, TrackingConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_DB_URL: &str = "sqlite://course.sqlite3";
const DEFAULT_USER_ID: &str = "00000000-0000-4000-8000-000000000001";
const DEFAULT_LOG_FILTER: &str = "app=info,services=info,storage=info";
const WATCH_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidModuleId { raw: String },
    InvalidUserId { raw: String },
    InvalidDbUrl { raw: String },
    InvalidNumber { flag: &'static str, raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidModuleId { raw } => write!(f, "invalid --module value: {raw}"),
            ArgsError::InvalidUserId { raw } => write!(f, "invalid user id: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidNumber { flag, raw } => {
                write!(f, "{flag} expects a positive number, got {raw}")
            }
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn positive_number(raw: String, flag: &'static str) -> Result<f64, ArgsError> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(ArgsError::InvalidNumber { flag, raw }),
    }
}

fn parse_user(raw: &str) -> Result<UserId, ArgsError> {
    raw.trim().parse().map_err(|_| ArgsError::InvalidUserId {
        raw: raw.to_string(),
    })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- seed   [--db <sqlite_url>]");
    eprintln!("  cargo run -p app -- status [--db <sqlite_url>] [--user <uuid>]");
    eprintln!(
        "  cargo run -p app -- watch  [--db <sqlite_url>] [--user <uuid>] [--config <toml>]"
    );
    eprintln!("                             [--module <id>] [--duration <secs>] [--rate <x>]");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db {DEFAULT_DB_URL}");
    eprintln!("  --user {DEFAULT_USER_ID}");
    eprintln!("  --duration 30 --rate 1");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  COURSE_DB_URL, COURSE_USER_ID, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Seed,
    Status,
    Watch,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "seed" => Some(Self::Seed),
            "status" => Some(Self::Status),
            "watch" => Some(Self::Watch),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    user: UserId,
    config_path: Option<PathBuf>,
    module: Option<ModuleId>,
    duration: f64,
    rate: f64,
}

impl Args {
    fn parse(cmd: Command, args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let db_url = std::env::var("COURSE_DB_URL")
            .ok()
            .map_or_else(|| DEFAULT_DB_URL.into(), normalize_sqlite_url);
        let user = match std::env::var("COURSE_USER_ID") {
            Ok(raw) => parse_user(&raw)?,
            Err(_) => parse_user(DEFAULT_USER_ID)?,
        };
        let mut parsed = Self {
            db_url,
            user,
            config_path: None,
            module: None,
            duration: 30.0,
            rate: 1.0,
        };

        while let Some(arg) = args.next() {
            match (arg.as_str(), cmd) {
                ("--db", _) => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    parsed.db_url = normalize_sqlite_url(value);
                }
                ("--user", Command::Status | Command::Watch) => {
                    parsed.user = parse_user(&require_value(args, "--user")?)?;
                }
                ("--config", Command::Watch) => {
                    parsed.config_path = Some(require_value(args, "--config")?.into());
                }
                ("--module", Command::Watch) => {
                    let value = require_value(args, "--module")?;
                    let id = value
                        .parse()
                        .map_err(|_| ArgsError::InvalidModuleId { raw: value.clone() })?;
                    parsed.module = Some(id);
                }
                ("--duration", Command::Watch) => {
                    parsed.duration =
                        positive_number(require_value(args, "--duration")?, "--duration")?;
                }
                ("--rate", Command::Watch) => {
                    parsed.rate = positive_number(require_value(args, "--rate")?, "--rate")?;
                }
                ("--help" | "-h", _) => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(parsed)
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<TrackingConfig, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(TrackingConfig::default());
    };
    let raw = std::fs::read_to_string(path)?;
    let config = TrackingConfig::from_toml_str(&raw)?;
    info!(path = %path.display(), "loaded tracking config");
    Ok(config)
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv = std::env::args().skip(1);

    let cmd = match argv.next() {
        None => {
            print_usage();
            return Ok(());
        }
        Some(first) if first == "--help" || first == "-h" => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(&first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };

    let parsed = Args::parse(cmd, &mut argv).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    init_tracing();
    let config = load_config(parsed.config_path.as_ref())?;
    prepare_sqlite_file(&parsed.db_url)?;
    let services = AppServices::new_sqlite(&parsed.db_url, Clock::system(), config.clone()).await?;

    match cmd {
        Command::Seed => {
            let written = services.ensure_demo_catalog().await?;
            if written == 0 {
                println!("catalog already present in {}", parsed.db_url);
            } else {
                println!("seeded {written} modules into {}", parsed.db_url);
            }
            Ok(())
        }
        Command::Status => {
            let overview = services.gate().overview(parsed.user).await?;
            print_overview(parsed.user, &overview);
            Ok(())
        }
        Command::Watch => watch(&services, &config, &parsed).await,
    }
}

fn print_overview(user: UserId, overview: &[ModuleStatus]) {
    if overview.is_empty() {
        println!("no modules yet, run `seed` first");
        return;
    }
    println!("progress for {user}");
    for status in overview {
        println!(
            "{:>3}  {:<24} {:<8} {:>3}%  {:>7.1}s  {}",
            status.module.sequence_number(),
            status.module.title(),
            status.state.as_str(),
            status.percent_complete.value(),
            status.last_position,
            status.module.media_kind().as_str(),
        );
    }
}

/// First unlocked module that is not finished yet.
fn next_to_watch(overview: &[ModuleStatus]) -> Option<ModuleId> {
    overview
        .iter()
        .find(|s| s.state == UnlockState::Unlocked && s.percent_complete < Percent::FULL)
        .map(|s| s.module.id())
}

async fn watch(
    services: &AppServices,
    config: &TrackingConfig,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let module = match args.module {
        Some(id) => id,
        None => {
            let overview = services.gate().overview(args.user).await?;
            let Some(id) = next_to_watch(&overview) else {
                println!("nothing left to watch");
                return Ok(());
            };
            id
        }
    };

    let player = SimulatedPlayer::playing(args.duration, args.rate);
    let connector = SimulatedConnector::new(player, config.embed_reply_timeout());
    let handle = services
        .sessions()
        .attach(args.user, module, &connector)
        .await?;
    println!("watching module {module}");

    let mut progress = handle.progress();
    let budget = Duration::from_secs_f64(args.duration / args.rate) + WATCH_GRACE;
    let watched = tokio::time::timeout(budget, async {
        let mut shown = None;
        while progress.changed().await.is_ok() {
            let snapshot = *progress.borrow_and_update();
            if shown != Some(snapshot.display) {
                println!(
                    "{:>3}%  {:>7.1}s  {:?}",
                    snapshot.display.value(),
                    snapshot.position,
                    snapshot.state
                );
                shown = Some(snapshot.display);
            }
            if snapshot.completed {
                break;
            }
        }
    })
    .await;
    if watched.is_err() {
        info!(%module, "watch budget elapsed, detaching");
    }

    let report = handle.detach().await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SessionReport) {
    println!(
        "module {}: {} writes ({} failed), final flush {:?}",
        report.module, report.writes, report.failed_writes, report.final_flush
    );
    if report.completed {
        match report.unlocked {
            Some(next) => println!("completed, unlocked module {next}"),
            None => println!("completed"),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
