//! LocalAPI CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP/WebSocket gateway
//! - `config`  — Print the effective configuration
//! - `ask`     — Run one turn and stream the reply to stdout

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "localapi",
    about = "LocalAPI — context-budgeted gateway for local LLM servers",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.localapi/config.toml
    #[arg(short, long, global = true, env = "LOCALAPI_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format (defaults to `logging.format` from config)
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    Serve {
        /// Override the bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the effective configuration (secrets redacted)
    Config {
        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Send one message and stream the reply
    Ask {
        /// The message text
        text: String,

        /// Continue an existing thread
        #[arg(short, long)]
        thread: Option<String>,
    },
}

fn init_tracing(verbose: bool, level: &str, json: bool) {
    let filter = if verbose { "debug" } else { level };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = commands::load_config(cli.config.as_deref())?;
    let json_logs = match cli.log_format {
        Some(format) => format == LogFormat::Json,
        None => config.logging.format.eq_ignore_ascii_case("json"),
    };
    init_tracing(cli.verbose, &config.logging.level, json_logs);

    match cli.command {
        Commands::Serve { host, port } => commands::serve::run(config, host, port).await?,
        Commands::Config { json } => commands::config_cmd::show(&config, json)?,
        Commands::Ask { text, thread } => commands::ask::run(config, text, thread).await?,
    }

    Ok(())
}
