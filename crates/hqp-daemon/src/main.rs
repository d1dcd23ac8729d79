mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use hqp_control::{Controller, Direction, SwitchOutcome, SwitchResult};
use hqp_proto::config::Config;
use hqp_proto::{PlaybackStatus, VolumeDb};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Control an HQPlayer Embedded instance: playback, volume and profiles.
#[derive(Parser)]
#[command(name = "hqp", version, about, long_about = None)]
struct Cli {
    /// HQPlayer host (overrides the config file).
    #[arg(long, env = "HQP_HOST", global = true)]
    host: Option<String>,

    /// HQPlayer control port.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current playback status.
    Status,

    /// List available profiles; the active one is marked with '*'.
    Profiles,

    /// Switch to a profile.
    Switch {
        name: String,
        /// Return once the restart is issued instead of waiting for readiness.
        #[arg(long)]
        no_wait: bool,
        /// How long to wait for the control port to come back.
        #[arg(long)]
        budget_ms: Option<u64>,
    },

    /// Save the active configuration as a new profile.
    Save { name: String },

    /// Delete a profile.
    Delete { name: String },

    /// Show or change the volume.
    Vol(VolArgs),

    /// Start playback.
    Play,
    /// Pause playback.
    Pause,
    /// Stop playback.
    Stop,
    /// Next track.
    Next,
    /// Previous track.
    Prev,

    /// Serve the HTTP API.
    Serve {
        /// Address to bind (overrides the config file).
        #[arg(long)]
        bind: Option<String>,
        /// HTTP port (overrides the config file).
        #[arg(long)]
        http_port: Option<u16>,
    },
}

#[derive(Args)]
struct VolArgs {
    /// Set the volume to VALUE dB.
    #[arg(short, long = "set", value_name = "VALUE", allow_hyphen_values = true,
          conflicts_with_all = ["up", "down"])]
    set: Option<f64>,
    /// Raise the volume by STEP dB (default 1).
    #[arg(long, value_name = "STEP", num_args = 0..=1, default_missing_value = "1",
          conflicts_with = "down")]
    up: Option<f64>,
    /// Lower the volume by STEP dB (default 1).
    #[arg(long, value_name = "STEP", num_args = 0..=1, default_missing_value = "1")]
    down: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let serving = matches!(cli.command, Commands::Serve { .. });
    init_logging(cli.verbose, serving)?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(host) = &cli.host {
        config.hqplayer.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.hqplayer.port = port;
    }

    let controller = Arc::new(Controller::from_config(&config)?);

    match cli.command {
        Commands::Status => {
            let status = controller.get_status().await?;
            print_status(&status);
        }
        Commands::Profiles => {
            for entry in controller.list_profiles().await? {
                let marker = if entry.current { " *" } else { "" };
                println!("  {}{}", entry.profile.display_name, marker);
            }
        }
        Commands::Switch {
            name,
            no_wait,
            budget_ms,
        } => {
            println!("Switching to profile: {name}...");
            let result = controller
                .switch_profile(&name, !no_wait, budget_ms.map(Duration::from_millis))
                .await?;
            report_switch(&result)?;
        }
        Commands::Save { name } => {
            let profile = controller.save_profile(&name).await?;
            println!("Saved current config as profile: {}", profile.id);
        }
        Commands::Delete { name } => {
            controller.delete_profile(&name).await?;
            println!("Deleted profile: {name}");
        }
        Commands::Vol(args) => {
            let status = match (args.set, args.up, args.down) {
                (Some(value), _, _) => controller.set_volume(db_arg(value)?).await?,
                (_, Some(step), _) => controller.adjust_volume(db_arg(step)?, Direction::Up).await?,
                (_, _, Some(step)) => {
                    controller
                        .adjust_volume(db_arg(step)?, Direction::Down)
                        .await?
                }
                _ => controller.get_status().await?,
            };
            println!("Volume: {} dB", volume_text(&status));
        }
        Commands::Play => {
            controller.play().await?;
            println!("Play");
        }
        Commands::Pause => {
            controller.pause().await?;
            println!("Paused");
        }
        Commands::Stop => {
            controller.stop().await?;
            println!("Stopped");
        }
        Commands::Next => {
            let status = controller.next().await?;
            println!("Next ({})", status.track_info.as_deref().unwrap_or("-"));
        }
        Commands::Prev => {
            let status = controller.previous().await?;
            println!("Previous ({})", status.track_info.as_deref().unwrap_or("-"));
        }
        Commands::Serve { bind, http_port } => {
            let bind = bind.unwrap_or_else(|| config.http.bind_address.clone());
            let port = http_port.unwrap_or(config.http.port);
            info!(
                "Controlling HQPlayer at {} (profiles via {:?})",
                config.hqplayer.address(),
                config.profiles.mode
            );
            let server = http::start_server(bind, port, controller);
            tokio::select! {
                _ = server => bail!("HTTP server stopped"),
                _ = tokio::signal::ctrl_c() => info!("Shutting down"),
            }
        }
    }

    Ok(())
}

/// stderr for everything; `serve` also appends to the log file.
fn init_logging(verbose: u8, serving: bool) -> Result<()> {
    let default = match (serving, verbose) {
        (true, 0) => "info,hqp_control=debug",
        (false, 0) => "warn",
        (_, 1) => "info",
        _ => "debug",
    };

    let file_layer = if serving {
        let log_path = hqp_proto::platform::log_file();
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
    Ok(())
}

fn db_arg(value: f64) -> Result<VolumeDb> {
    match VolumeDb::from_f64(value) {
        Some(db) => Ok(db),
        None => bail!("invalid volume {value}"),
    }
}

fn volume_text(status: &PlaybackStatus) -> String {
    status
        .volume
        .map(|v| v.to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn print_status(s: &PlaybackStatus) {
    println!("State:    {}", s.state_name());
    println!("Volume:   {} dB", volume_text(s));
    if let Some(track) = &s.track_info {
        println!("Track:    {track}");
        println!("Position: {}", s.position_display());
    }
    println!("Mode:     {}", s.active_mode.as_deref().unwrap_or("-"));
    println!("Filter:   {}", s.active_filter.as_deref().unwrap_or("-"));
    println!("Shaper:   {}", s.active_shaper.as_deref().unwrap_or("-"));
    println!("Rate:     {} Hz", s.active_rate);
}

fn report_switch(result: &SwitchResult) -> Result<()> {
    match result.outcome {
        SwitchOutcome::Ready => {
            println!("Ready after {} ms.", result.elapsed_ms);
            Ok(())
        }
        SwitchOutcome::Started => {
            println!("Profile switch initiated.");
            Ok(())
        }
        SwitchOutcome::TimedOut => bail!(
            "HQPlayer did not answer within {} ms; the restart may still complete",
            result.elapsed_ms
        ),
        SwitchOutcome::Failed => bail!(
            "switch to '{}' failed: {}",
            result.requested_profile.id,
            result.error_message.as_deref().unwrap_or("unknown error")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_vol_accepts_negative_values_and_bare_steps() {
        let cli = Cli::parse_from(["hqp", "vol", "-s", "-20.5"]);
        match cli.command {
            Commands::Vol(args) => assert_eq!(args.set, Some(-20.5)),
            _ => panic!("expected vol"),
        }

        let cli = Cli::parse_from(["hqp", "vol", "--up"]);
        match cli.command {
            Commands::Vol(args) => assert_eq!(args.up, Some(1.0)),
            _ => panic!("expected vol"),
        }

        assert!(Cli::try_parse_from(["hqp", "vol", "--up", "--down"]).is_err());
    }

    #[test]
    fn test_switch_flags() {
        let cli = Cli::parse_from(["hqp", "--host", "10.0.0.5", "switch", "dsd", "--no-wait"]);
        assert_eq!(cli.host.as_deref(), Some("10.0.0.5"));
        match cli.command {
            Commands::Switch { name, no_wait, budget_ms } => {
                assert_eq!(name, "dsd");
                assert!(no_wait);
                assert_eq!(budget_ms, None);
            }
            _ => panic!("expected switch"),
        }
    }
}
