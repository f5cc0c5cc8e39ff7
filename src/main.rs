use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

mod demo;
mod ui;
mod utils;

use crate::{
    demo::{ArchiveHistory, DemoSettings, LoopbackChannel},
    ui::{ChatUI, UiAction},
};
use parley::config::{self, AppConfig, EngineSettings, StaticToken};
use parley::models::ConversationContext;
use parley::{Conversation, EngineEvent};

/// Command line arguments for parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "parley: a terminal host for the lost-and-found conversation engine.",
    long_about = "parley renders one lost-and-found conversation in the terminal.\n\n\
    The chat socket and history service are simulated in-process, so reconnects,\n\
    failed sends and history paging can be tried without a server."
)]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Where to write the log
    #[arg(long, value_name = "PATH", default_value = "parley.log")]
    log_file: PathBuf,

    /// error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Id of the participant using this terminal
    #[arg(long)]
    local: Option<String>,

    /// Id of the other participant
    #[arg(long)]
    remote: Option<String>,

    /// Conversation id
    #[arg(long)]
    conversation: Option<String>,

    /// Number of archived messages the simulated history service starts with
    #[arg(long, default_value_t = 45)]
    history_size: usize,

    /// Simulated network latency in milliseconds
    #[arg(long, default_value_t = 300)]
    latency_ms: u64,

    /// Fraction of sends the simulated server rejects, 0.0 to 1.0
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,
}

fn default_config() -> AppConfig {
    let mut cfg = AppConfig::new(ConversationContext::new("finder", "owner", "lost-item-demo", 20));
    // The terminal view reports its metrics in rows.
    cfg.engine = EngineSettings::rows();
    cfg
}

/// Resolve the config: file, then command line, then environment.
fn resolve_config(args: &Args) -> Result<(AppConfig, bool)> {
    if let Some(path) = &args.config {
        config::set_config_path_override(path.clone());
        info!("Config path overridden to: {}", path.display());
    }

    let (mut cfg, loaded) = match config::load_config()? {
        Some(cfg) => (cfg, true),
        None => {
            info!("No saved config, using demo defaults");
            (default_config(), false)
        }
    };

    if let Some(local) = &args.local {
        cfg.conversation.local_user_id = local.clone();
    }
    if let Some(remote) = &args.remote {
        cfg.conversation.remote_user_id = remote.clone();
    }
    if let Some(conversation) = &args.conversation {
        cfg.conversation.conversation_id = conversation.clone();
    }
    cfg.apply_env_overrides()?;
    cfg.validate()?;
    Ok((cfg, loaded))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = utils::parse_level(&args.log_level)?;
    utils::setup_logging(Some(args.log_file.as_path()), level)?;
    info!("parley starting up on {} {}", std::env::consts::OS, std::env::consts::ARCH);

    if !(0.0..=1.0).contains(&args.failure_rate) {
        return Err(anyhow!("--failure-rate must be between 0.0 and 1.0"));
    }

    let (cfg, loaded) = resolve_config(&args)?;
    if !loaded {
        if let Err(e) = config::save_config(&cfg) {
            warn!("Could not save config: {}", e);
        }
    }

    let context = cfg.conversation.clone();
    let latency = Duration::from_millis(args.latency_ms);
    let archive = demo::seed_archive(&context, args.history_size);
    let token = cfg.token.clone().or_else(|| Some("demo-token".to_string()));

    let (loopback, channel_events) = LoopbackChannel::new(
        context.clone(),
        Arc::new(StaticToken::new(token)),
        archive.clone(),
        DemoSettings {
            latency,
            failure_rate: args.failure_rate,
        },
    );
    let loopback = Arc::new(loopback);
    let history = Arc::new(ArchiveHistory::new(archive, latency));

    let (mut conversation, mut engine_rx) =
        Conversation::new(context, loopback.clone(), history, &cfg.engine);
    conversation.attach(channel_events);
    loopback.open();
    conversation.start();

    let mut chat_ui = ChatUI::new();
    let mut terminal = ui::setup_terminal()?;

    let result = run_main_loop(&mut chat_ui, &mut terminal, &mut conversation, &mut engine_rx, &loopback).await;
    if let Err(e) = &result {
        error!("Main loop failed: {}", e);
    }

    conversation.dispose();
    ui::restore_terminal(terminal)?;
    info!("parley shut down");
    result
}

/// Run the main event loop
async fn run_main_loop(
    chat_ui: &mut ChatUI,
    terminal: &mut ui::Terminal<ui::CrosstermBackend<io::Stdout>>,
    conversation: &mut Conversation,
    engine_rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    loopback: &LoopbackChannel,
) -> Result<()> {
    loop {
        terminal.draw(|f| chat_ui.draw(f, conversation))?;

        match chat_ui.handle_input(conversation)? {
            UiAction::Quit => break,
            UiAction::DropConnection => loopback.drop_connection(),
            UiAction::None => {}
        }

        // Apply everything the background tasks reported since the last frame
        while let Ok(event) = engine_rx.try_recv() {
            conversation.handle_event(event);
        }

        conversation.poll_viewport(Instant::now());
        tokio::task::yield_now().await;
    }
    Ok(())
}
