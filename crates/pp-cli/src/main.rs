//! pty-proxy CLI
//!
//! - `master`: launch a slave command over pipes and drive it from this terminal
//! - `slave`: run a program on a PTY and speak the protocol over stdin/stdout
//! - `config`: inspect or create the configuration file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pp_core::config::{default_config_path, load_config};
use pp_core::{CommandSpec, ConfigError, ProxyConfig};
use pp_protocol::{PayloadEncoding, TerminalSize};
use pty_proxy::commands;
use pty_proxy::output::print_error;

/// Exit code for failures before a session is running
const SETUP_FAILURE_CODE: i32 = 1;

#[derive(Parser)]
#[command(name = "pty-proxy")]
#[command(author, version, about = "Drive a program on a remote PTY over a framed byte stream")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG and PTY_PROXY_LOG are unset
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the slave command and attach this terminal to it
    Master {
        /// Base64-encode data payloads (the slave must agree)
        #[arg(long)]
        base64: bool,
        /// Skip slave output until its greeting marker appears
        #[arg(long)]
        expect_greeting: bool,
        /// Send a keepalive ping this often
        #[arg(long, value_name = "SECS")]
        heartbeat: Option<u64>,
        /// Give up when nothing arrives from the slave for this long
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
        /// Slave command line, usually ending in `pty-proxy slave`
        #[arg(last = true, required = true, value_name = "SLAVE_CMD")]
        slave: Vec<String>,
    },

    /// Run a program on a PTY, speaking the protocol over stdin/stdout
    Slave {
        /// Base64-encode data payloads (the master must agree)
        #[arg(long)]
        base64: bool,
        /// Print the greeting marker before the handshake
        #[arg(long)]
        greeting: bool,
        /// Put the PTY in raw mode
        #[arg(long)]
        raw: bool,
        /// Initial PTY rows
        #[arg(long)]
        rows: Option<u16>,
        /// Initial PTY columns
        #[arg(long)]
        cols: Option<u16>,
        /// Program and arguments (default: /bin/sh)
        #[arg(last = true, value_name = "CMD")]
        command: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Show the default config file path
    Path,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            print_error(&format!("{:#}", e));
            SETUP_FAILURE_CODE
        }
    };

    // stdin is read on a blocking thread that would hold up runtime shutdown
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Master {
            base64,
            expect_greeting,
            heartbeat,
            timeout,
            slave,
        } => {
            if base64 {
                config.protocol.payload_encoding = PayloadEncoding::Base64;
            }
            if let Some(secs) = heartbeat {
                config.session.heartbeat_interval = Some(std::time::Duration::from_secs(secs));
            }
            if let Some(secs) = timeout {
                config.session.heartbeat_timeout = Some(std::time::Duration::from_secs(secs));
            }
            config.validate()?;

            let slave = CommandSpec::from_argv(slave).context("No slave command given")?;
            commands::master_command(config, expect_greeting, slave).await
        }
        Commands::Slave {
            base64,
            greeting,
            raw,
            rows,
            cols,
            command,
        } => {
            if base64 {
                config.protocol.payload_encoding = PayloadEncoding::Base64;
            }
            config.slave.greeting |= greeting;
            config.slave.raw_mode |= raw;
            let size = config.slave.initial_size;
            config.slave.initial_size =
                TerminalSize::new(rows.unwrap_or(size.rows), cols.unwrap_or(size.cols));
            config.validate()?;

            commands::slave_command(config, CommandSpec::from_argv(command)).await
        }
        Commands::Config { action } => {
            match action {
                ConfigAction::Show => commands::config_show(&config)?,
                ConfigAction::Path => commands::config_path(),
                ConfigAction::Init { force } => commands::config_init(cli.config.as_deref(), force)?,
            }
            Ok(0)
        }
    }
}

/// Load the config file named on the command line, or the default one if
/// it exists
fn resolve_config(path: Option<&Path>) -> Result<ProxyConfig> {
    match path {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => match load_config(&default_config_path()) {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(_)) => Ok(ProxyConfig::default()),
            Err(e) => Err(e).context("Failed to load default config"),
        },
    }
}

fn init_logging(cli: &Cli) {
    let debug_requested = std::env::var("PTY_PROXY_DEBUG").is_ok_and(|v| !v.is_empty() && v != "0");

    let fallback = match (&cli.log_level, debug_requested, cli.verbose) {
        (Some(level), _, _) => level.clone(),
        (None, true, _) => "debug".to_string(),
        (None, false, 0) => "warn".to_string(),
        (None, false, 1) => "info".to_string(),
        (None, false, 2) => "debug".to_string(),
        (None, false, _) => "trace".to_string(),
    };

    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("PTY_PROXY_LOG"))
        .unwrap_or(fallback);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
