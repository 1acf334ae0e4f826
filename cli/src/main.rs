mod console;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use termbridge_core::Bot;
use termbridge_core::Config;
use termbridge_core::Platform;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::console::ConsoleConn;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlatformArg {
    Slack,
    Discord,
}

impl From<PlatformArg> for Platform {
    fn from(value: PlatformArg) -> Self {
        match value {
            PlatformArg::Slack => Platform::Slack,
            PlatformArg::Discord => Platform::Discord,
        }
    }
}

/// Runs interactive terminals on behalf of chat users.
///
/// The bundled transport is the local console (stdin lines in, rendered
/// screens out); platform adapters plug in through the chat connection
/// trait.
#[derive(Debug, Parser)]
#[command(name = "termbridge", version)]
struct Args {
    /// Chat platform whose threading conventions the dispatcher follows.
    #[arg(long, value_enum, default_value_t = PlatformArg::Slack)]
    platform: PlatformArg,

    /// Directory of launchable scripts; the file name is the trigger alias.
    #[arg(long, env = "TERMBRIDGE_SCRIPT_DIR")]
    script_dir: PathBuf,

    /// host:port the terminal-sharing SSH server listens on. Omit to
    /// disable sharing.
    #[arg(long, env = "TERMBRIDGE_SHARE_HOST")]
    share_host: Option<String>,

    /// Seconds of session inactivity before the owner is warned.
    #[arg(long, default_value_t = 600)]
    idle_warn_secs: u64,

    /// Seconds of session inactivity before the session closes.
    #[arg(long, default_value_t = 900)]
    idle_kill_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::new(args.platform.into(), args.script_dir);
    config.idle_warn_timeout = Duration::from_secs(args.idle_warn_secs);
    config.idle_kill_timeout = Duration::from_secs(args.idle_kill_secs);
    config.share_host = args.share_host;

    let conn = Arc::new(ConsoleConn::new());
    let bot = Arc::new(
        Bot::new(config, conn)
            .await
            .context("cannot start the bot")?,
    );

    let signal_bot = Arc::clone(&bot);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, closing all sessions");
        signal_bot.shutdown();
    });

    bot.run().await.context("bot exited with error")?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM, so supervisor-initiated stops get the
/// same graceful close as an interactive interrupt.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::warn!("cannot install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
