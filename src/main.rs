pub mod models {
    pub mod feed;
}

pub mod client;
pub mod config;
pub mod env_file;
pub mod errors;
pub mod mapping;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod pg;
    pub mod store;
}
pub mod schema;
pub mod services {
    pub mod artifacts;
    pub mod commit;
    pub mod on_demand;
    pub mod reconcile;
    pub mod retire;
    pub mod scheduler;
    pub mod summary;
    #[cfg(test)]
    pub mod testkit;
    pub mod upsert;
}

use crate::client::HttpFeedClient;
use crate::config::Config;
use crate::db::pg::PgStore;
use crate::models::feed::StormId;
use crate::services::scheduler::{self, Schedule};
use crate::services::{on_demand, reconcile, summary};
use diesel::PgConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::{error, info};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Instant;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, PartialEq)]
enum Command {
    /// Scheduled loop (default).
    Run,
    UpdateStorms { jtwc_source: Option<String> },
    BuildSummary,
    Render { storm_id: StormId, forecast: bool, out: PathBuf },
}

#[derive(Debug, PartialEq)]
struct Cli {
    env_file: Option<PathBuf>,
    command: Command,
}

const USAGE: &str = "usage: storm-sync [--env-file PATH] \
    [run | update-storms [JTWC_SOURCE] | build-summary | render STORM_ID [--forecast] --out PATH]";

fn parse_args(args: impl IntoIterator<Item = OsString>) -> Result<Cli, String> {
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;
    let mut rest: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        let arg = arg.into_string().map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let value = if arg == "--env-file" {
            Some(PathBuf::from(args.next().ok_or("`--env-file` requires a path argument")?))
        } else {
            arg.strip_prefix("--env-file=").map(PathBuf::from)
        };
        match value {
            Some(path) if path.as_os_str().is_empty() => {
                return Err("`--env-file` requires a path argument".to_string());
            }
            Some(_) if env_file.is_some() => return Err("`--env-file` provided more than once".to_string()),
            Some(path) => env_file = Some(path),
            None => rest.push(arg),
        }
    }

    let command = match rest.split_first() {
        None => Command::Run,
        Some((cmd, tail)) => match (cmd.as_str(), tail) {
            ("run", []) => Command::Run,
            ("update-storms", []) => Command::UpdateStorms { jtwc_source: None },
            ("update-storms", [source]) => Command::UpdateStorms {
                jtwc_source: Some(source.clone()),
            },
            ("build-summary", []) => Command::BuildSummary,
            ("render", tail) => parse_render(tail)?,
            _ => return Err(format!("unrecognised arguments: {}\n{}", rest.join(" "), USAGE)),
        },
    };

    Ok(Cli { env_file, command })
}

fn parse_render(tail: &[String]) -> Result<Command, String> {
    let mut storm_id = None;
    let mut forecast = false;
    let mut out = None;
    let mut args = tail.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--forecast" => forecast = true,
            "--out" => out = Some(PathBuf::from(args.next().ok_or("`--out` requires a path argument")?)),
            other if storm_id.is_none() && !other.starts_with('-') => storm_id = Some(StormId::from(other)),
            other => return Err(format!("unrecognised render argument: {}\n{}", other, USAGE)),
        }
    }
    Ok(Command::Render {
        storm_id: storm_id.ok_or_else(|| format!("render requires a storm id\n{}", USAGE))?,
        forecast,
        out: out.ok_or_else(|| format!("render requires --out PATH\n{}", USAGE))?,
    })
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn run(command: Command) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (feed={}, jtwc_source={}, media_root={}, storms_interval={}s, summary_interval={}s, \
         reconcile_enabled={}, summary_enabled={}, max_request_retries={})",
        cfg.feed_url,
        cfg.jtwc_source,
        cfg.media_root.display(),
        cfg.storms_interval.as_secs(),
        cfg.summary_interval.as_secs(),
        cfg.reconcile_enabled,
        cfg.summary_enabled,
        cfg.max_request_retries.get()
    );

    // 2) Connect DB
    let mut store = PgStore::connect(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(store.connection())?;

    // 4) Feed client
    let jtwc_source = match &command {
        Command::UpdateStorms { jtwc_source: Some(source) } => source.clone(),
        _ => cfg.jtwc_source.clone(),
    };
    let feed = HttpFeedClient::new(
        cfg.feed_url.clone(),
        jtwc_source,
        cfg.request_timeout,
        cfg.max_request_retries,
    );

    // 5) Dispatch
    match command {
        Command::Run => {
            let schedule = Schedule::new(
                cfg.reconcile_enabled.then_some(cfg.storms_interval),
                cfg.summary_enabled.then_some(cfg.summary_interval),
                Instant::now(),
            );
            info!(
                "Starting scheduler: reconcile every {}s ({}), summary every {}s ({})",
                cfg.storms_interval.as_secs(),
                if cfg.reconcile_enabled { "enabled" } else { "disabled" },
                cfg.summary_interval.as_secs(),
                if cfg.summary_enabled { "enabled" } else { "disabled" },
            );
            scheduler::run_loop(&mut store, &feed, &cfg.media_root, schedule)
        }
        Command::UpdateStorms { .. } => reconcile::reconcile(&mut store, &feed, &cfg.media_root)
            .map(|_| ())
            .map_err(|e| format!("update-storms failed: {}", e)),
        Command::BuildSummary => summary::build_summary(&mut store, &feed, &cfg.media_root)
            .map(|_| ())
            .map_err(|e| format!("build-summary failed: {}", e)),
        Command::Render { storm_id, forecast, out } => {
            let bytes = on_demand::render_on_demand(&mut store, &feed, &storm_id, forecast)
                .map_err(|e| format!("render failed ({}): {}", e.status_code(), e))?;
            std::fs::write(&out, &bytes).map_err(|e| format!("writing {} failed: {}", out.display(), e))?;
            info!("Wrote {} bytes to {}", bytes.len(), out.display());
            Ok(())
        }
    }
}

fn main() {
    let cli = match parse_args(std::env::args_os().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let loaded_env = match env_file::load(cli.env_file) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "storm-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(cli.command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
