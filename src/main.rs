use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use content_moderator::{
    AccountService, CancelToken, Config, JsonUserStore, ModerationService, PipelineProgress,
    ProgressCallback, SessionContext,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "content-moderator")]
#[command(version, author = "TigreRoll")]
#[command(about = "Moderate videos, images and text against a content-review service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to content-moderator.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log in as this user before running the command
    #[arg(long, global = true)]
    user: Option<String>,

    #[arg(long, global = true)]
    password: Option<String>,

    /// Override the number of parallel classification workers
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Moderate a video file
    Video {
        path: PathBuf,
        /// Frames per second to classify
        #[arg(long)]
        target_fps: Option<f64>,
    },
    /// Moderate a single image
    Image { path: PathBuf },
    /// Moderate every image under a directory
    Images { dir: PathBuf },
    /// Moderate text given inline or read from a file
    Text {
        text: Option<String>,
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
    },
    /// Manage user accounts
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create an account
    Register {
        username: String,
        #[arg(value_name = "PASSWORD")]
        initial_password: String,
    },
    /// Change the password of the user given by --user/--password
    Passwd { new_password: String },
    /// Delete the account given by --user/--password
    Delete,
    /// List registered usernames
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        command,
        config: config_path,
        user,
        password,
        workers,
        verbose,
    } = Cli::parse();

    let mut config = match config_path {
        Some(ref path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Failed to load config, using defaults: {}", e);
            Config::default()
        }),
    };
    if let Some(workers) = workers {
        config.pipeline.max_workers = workers;
    }

    // Initialize logging
    let level = if verbose { "debug" } else { config.output.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("content_moderator={},warn", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let store = JsonUserStore::open(&config.users.store_path).await?;
    let accounts = AccountService::new(Arc::new(store));
    let mut session = SessionContext::new();

    if let (Some(user), Some(password)) = (user.as_deref(), password.as_deref()) {
        accounts.login(&mut session, user, password).await?;
    }

    let command = match command {
        Commands::User { action } => {
            // Registration stays open; listing is gated like moderation
            if matches!(action, UserAction::List) {
                session
                    .ensure_access(config.users.require_login)
                    .context("login required: pass --user and --password")?;
            }
            return run_user_action(&accounts, &mut session, action, password.as_deref()).await;
        }
        other => other,
    };

    session
        .ensure_access(config.users.require_login)
        .context("login required: pass --user and --password")?;

    if let Commands::Video { target_fps: Some(fps), .. } = command {
        config.sampling.target_fps = fps;
    }

    if !config.has_credentials() {
        warn!("No classifier credentials configured (set MODERATOR_API_KEY and MODERATOR_SECRET_KEY)");
    }
    info!("🚀 Content moderator starting...");
    info!("{}", config.summary());

    let service = ModerationService::new(config)?;

    match command {
        Commands::Video { path, .. } => {
            let cancel = CancelToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("🛑 Interrupted, cancelling...");
                    on_signal.cancel();
                }
            });

            let progress: ProgressCallback = Arc::new(|p: PipelineProgress| {
                if p.completed % 10 == 0 {
                    info!("📊 Progress: {}/{} frames ({:.0}%)",
                          p.completed,
                          p.expected.unwrap_or(p.submitted),
                          p.fraction() * 100.0);
                }
            });

            let report = service
                .moderate_video(&path, &cancel, Some(progress))
                .await
                .with_context(|| format!("moderating {}", path.display()))?;
            emit(&service, &report.video_info.filename, &report).await?;
        }
        Commands::Image { path } => {
            let report = service.moderate_image(&path).await?;
            emit(&service, "image", &report).await?;
        }
        Commands::Images { dir } => {
            let report = service.moderate_images(&dir).await?;
            info!("✅ Compliant: {}  🚫 Non-compliant: {}  ❔ Indeterminate: {}",
                  report.counts.compliant, report.counts.non_compliant, report.counts.indeterminate);
            emit(&service, "images", &report).await?;
        }
        Commands::Text { text, file } => {
            let text = match (text, file) {
                (Some(text), _) => text,
                (None, Some(file)) => tokio::fs::read_to_string(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?,
                (None, None) => return Err(anyhow!("provide TEXT or --file")),
            };
            let report = service.moderate_text(&text).await?;
            emit(&service, "text", &report).await?;
        }
        Commands::User { .. } => {}
    }

    Ok(())
}

async fn run_user_action(
    accounts: &AccountService,
    session: &mut SessionContext,
    action: UserAction,
    password: Option<&str>,
) -> Result<()> {
    match action {
        UserAction::Register { username, initial_password } => {
            accounts.register(&username, &initial_password).await?;
            println!("Registered {}", username);
        }
        UserAction::Passwd { new_password } => {
            let old_password = password.ok_or_else(|| anyhow!("log in with --user and --password first"))?;
            accounts.change_password(session, old_password, &new_password).await?;
            println!("Password changed");
        }
        UserAction::Delete => {
            accounts.delete_account(session).await?;
            println!("Account deleted");
        }
        UserAction::List => {
            for username in accounts.list_users().await? {
                println!("{}", username);
            }
        }
    }
    Ok(())
}

/// Print a report as JSON and save it when a report directory is configured
async fn emit<T: Serialize>(service: &ModerationService, name: &str, report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);

    match service.save_report(name, report).await {
        Ok(Some(path)) => info!("💾 Report written to {}", path.display()),
        Ok(None) => {}
        Err(e) => error!("Failed to save report: {}", e),
    }
    Ok(())
}
