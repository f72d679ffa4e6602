//! llmstream binary.
//!
//! Entry point for the streaming inference session bridge: one-shot generation
//! from the command line, or a JSON-lines bridge over stdin/stdout.

use clap::Parser;
use llmstream_core::{
    cli::commands::Commands,
    cli::handlers::{handle_generate, handle_serve},
    config::{ConfigArgs, Settings},
};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    // Initialize logging; stdout is reserved for responses
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(settings.logging.level.parse().unwrap_or(Level::INFO).into())
                .parse_lossy(settings.logging.filter.as_deref().unwrap_or("llmstream_core=debug")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("llmstream starting up");

    match cli.command {
        Commands::Generate(cmd) => handle_generate(settings, cmd).await?,
        Commands::Serve(cmd) => handle_serve(settings, cmd).await?,
    }

    Ok(())
}
