pub mod backend;
pub mod db;
pub mod live;
pub mod realtime;
pub mod review;
pub mod settings;
mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;

use backend::{normalize_name, ClarityBackend};
use db::Database;
use live::{commands::run_meeting, LiveSessionController};
use review::load_review;
use settings::SettingsStore;

pub struct AppState {
    pub backend: ClarityBackend,
    pub settings: SettingsStore,
}

impl AppState {
    /// Open (or create) the database and settings under `data_dir`.
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let settings = SettingsStore::new(data_dir.join("settings.json"))?;
        let database = Database::new(data_dir.join("clarity.sqlite3"))?;
        log::debug!(
            "Settings at {}, meetings at {}",
            settings.path().display(),
            database.path().display()
        );
        let backend =
            ClarityBackend::new(database).with_poll_interval(settings.get().poll_interval());

        Ok(Self { backend, settings })
    }

    /// `--name` wins, then the remembered display name.
    fn resolve_name(&self, name: Option<String>) -> Result<String> {
        let raw = name
            .or_else(|| self.settings.get().display_name)
            .context("No name given: pass --name <NAME>")?;
        let name = normalize_name(&raw)?;
        self.settings.remember_display_name(&name)?;
        Ok(name)
    }

    async fn open_meeting(&self, session_id: &str, me: &str) -> Result<()> {
        let delay = self.settings.get().celebration_delay();
        let controller =
            LiveSessionController::open_with_delay(self.backend.clone(), session_id, me, delay)
                .await?;
        run_meeting(controller).await
    }
}

#[derive(Parser)]
#[command(name = "clarity")]
#[command(
    about = "Live clarity meetings: take turns asking \"Did you get it?\" and \"Did I get it?\"",
    version
)]
pub struct Cli {
    /// Where the meeting database and settings live
    #[arg(long, env = "CLARITY_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Your name in the meeting
    #[arg(short, long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new meeting and wait for a partner
    Start,

    /// Join a meeting someone else started
    Join { session_id: String },

    /// Summarise a meeting
    Review { session_id: String },

    /// List recent meetings
    Sessions {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".clarity"),
        None => PathBuf::from(".clarity"),
    }
}

fn init_logging() {
    let debug_mode = std::env::var("CLARITY_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let level = if debug_mode {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    // Reads RUST_LOG for per-module overrides.
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let state = AppState::open(data_dir)?;

    // Meetings left open by a crashed client would otherwise stay joinable.
    let stale_after = state.settings.get().stale_after();
    state
        .backend
        .end_stale_sessions(stale_after)
        .await
        .context("Failed to end stale sessions")?;

    match cli.command {
        Commands::Start => {
            let me = state.resolve_name(cli.name)?;
            let session_id = state.backend.create_clarity_session(&me).await?;
            println!("{} Meeting started", "✓".green());
            println!("  Partner joins with: {}", format!("clarity join {session_id}").bright_white());
            state.open_meeting(&session_id, &me).await?;
        }

        Commands::Join { session_id } => {
            let me = state.resolve_name(cli.name)?;
            state.backend.join_clarity_session(&session_id, &me).await?;
            println!("{} Joined meeting {}", "✓".green(), session_id.bright_yellow());
            state.open_meeting(&session_id, &me).await?;
        }

        Commands::Review { session_id } => {
            let me = match cli.name {
                Some(name) => normalize_name(&name)?,
                None => state.settings.get().display_name.unwrap_or_default(),
            };
            let review = load_review(&state.backend, &session_id, &me).await;
            println!("{}", format!("Review of {session_id}").bold());
            for line in review.lines() {
                println!("  {line}");
            }
        }

        Commands::Sessions { limit } => {
            let sessions = state.backend.list_clarity_sessions(limit).await?;
            if sessions.is_empty() {
                println!("No meetings yet");
            }
            for session in sessions {
                let partner = session.joiner_name.as_deref().unwrap_or("(waiting)");
                let status = if session.is_ended() {
                    "ended".red()
                } else {
                    "open".green()
                };
                println!(
                    "{}  {} & {}  {}  {}",
                    session.id.bright_yellow(),
                    session.creator_name,
                    partner,
                    session.created_at.format("%Y-%m-%d %H:%M"),
                    status
                );
            }
        }
    }

    Ok(())
}
