//! # Nudge — Follow-up Campaign Engine
//!
//! Re-engages chat users who went quiet with staged, business-hours-aware
//! follow-ups, sent at most once per (user, stage).
//!
//! Usage:
//!   nudge run                            # Detector + dispatcher loops until Ctrl-C
//!   nudge scan                           # One inactivity scan
//!   nudge dispatch                       # One dispatcher tick
//!   nudge reply <user> <address> <text>  # Feed an inbound message
//!   nudge blacklist <user> --reason stop # Opt a user out for good
//!   nudge stats | health | sweep
//!   nudge init-config                    # Write ~/.nudge/config.toml

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nudge_core::NudgeConfig;
use nudge_scheduler::CampaignEngine;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nudge",
    version,
    about = "📬 Nudge — follow-up campaigns for chat users who went quiet"
)]
struct Cli {
    /// Config file (default: ~/.nudge/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the detector and dispatcher until interrupted
    Run,
    /// Run one inactivity scan and print the report
    Scan,
    /// Run one dispatcher tick and print the report
    Dispatch,
    /// Record an inbound user message
    Reply {
        user_id: String,
        channel_address: String,
        text: String,
        /// Conversation context as a JSON object
        #[arg(long)]
        context: Option<String>,
    },
    /// Stop all follow-ups for a user, permanently
    Blacklist {
        user_id: String,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Show a user's campaign state
    State { user_id: String },
    /// Pending/failed counts, response rates and stage funnel
    Stats,
    /// Overdue and failed jobs
    Health,
    /// Delete old finished jobs and expired locks
    Sweep,
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        "nudge=debug,nudge_scheduler=debug,nudge_channels=debug,nudge_providers=debug"
    } else {
        "nudge=info,nudge_scheduler=info,nudge_channels=info,nudge_providers=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<NudgeConfig> {
    let config = match path {
        Some(p) => NudgeConfig::load_from(p),
        None => NudgeConfig::load(),
    };
    config.context("loading config")
}

fn build_engine(config: &NudgeConfig) -> Result<CampaignEngine> {
    let channel = nudge_channels::build_channel(&config.channel)?;
    let composer = nudge_providers::build_composer(&config.composer)?;
    Ok(CampaignEngine::from_config(config, composer, channel)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    if let Command::InitConfig { force } = &cli.command {
        let path = cli.config.clone().unwrap_or_else(NudgeConfig::default_path);
        if path.exists() && !force {
            println!("⚠️  {} already exists (use --force to overwrite).", path.display());
            return Ok(());
        }
        NudgeConfig::default().save_to(&path)?;
        println!("✅ Default config written to {}", path.display());
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    let engine = build_engine(&config)?;
    let now = Utc::now();

    match cli.command {
        Command::Run => {
            println!("📬 Nudge v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database: {}", config.database_path().display());
            println!("   🕘 Hours:    {} {:02}:00-{:02}:00",
                config.business_hours.timezone,
                config.business_hours.start_hour,
                config.business_hours.end_hour,
            );
            println!();

            let engine = Arc::new(engine);
            let detector = tokio::spawn(nudge_scheduler::spawn_detector(engine.clone()));
            let dispatcher = tokio::spawn(nudge_scheduler::spawn_dispatcher(engine));

            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down");
            detector.abort();
            dispatcher.abort();
        }
        Command::Scan => print_json(&engine.scan(now)?)?,
        Command::Dispatch => print_json(&engine.dispatch(now).await?)?,
        Command::Reply {
            user_id,
            channel_address,
            text,
            context,
        } => {
            let context: Option<serde_json::Value> = context
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("--context must be valid JSON")?;
            let outcome =
                engine.on_user_message(&user_id, &channel_address, &text, now, context.as_ref())?;
            print_json(&outcome)?;
        }
        Command::Blacklist { user_id, reason } => {
            let cancelled = engine.on_blacklist(&user_id, &reason, now)?;
            println!("🚫 {user_id} blacklisted ({cancelled} pending job(s) cancelled)");
        }
        Command::State { user_id } => print_json(&engine.campaign_state(&user_id)?)?,
        Command::Stats => print_json(&engine.stats()?)?,
        Command::Health => {
            let report = engine.health(now)?;
            print_json(&report)?;
            if !report.healthy {
                std::process::exit(2);
            }
        }
        Command::Sweep => print_json(&engine.sweep(now)?)?,
        Command::InitConfig { .. } => {}
    }

    Ok(())
}
