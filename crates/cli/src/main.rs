//! Line-oriented terminal front end for the chat core.

mod commands;
mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parley_chat::{ChatController, ConfigStore};
use parley_llm::RigTransport;
use parley_storage::FileStore;
use snafu::Whatever;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about = "Multi-session streaming chat in the terminal", long_about = None)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for chat history, overriding the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging when RUST_LOG is unset
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "parley=debug,parley_chat=debug,parley_llm=debug,parley_storage=debug"
        } else {
            "info"
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .init();
}

/// Entry point.
///
/// Loads the layered config, then builds the rig transport and the file-backed
/// session store. Previous sessions are restored before the prompt loop
/// starts.
#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let args = Args::parse();
    // Logs go to stderr so they never interleave with the transcript.
    init_tracing(args.verbose);

    let config_store = args.config.map_or_else(ConfigStore::load, ConfigStore::new);
    let config = config_store.config();
    let data_dir = args.data_dir.unwrap_or_else(|| config.data_dir.clone());
    tracing::info!(
        config = %config_store.config_path().display(),
        data_dir = %data_dir.display(),
        "starting parley"
    );

    // Missing keys surface per message as a refused send, not at startup.
    let transport = RigTransport::new(config.providers.clone());
    if transport.configured_providers().next().is_none() {
        tracing::warn!("no provider API keys configured, messages will fail until one is added");
    }

    let mut controller = ChatController::new(Arc::new(transport), Arc::new(FileStore::new(data_dir)))
        .with_default_settings(config.default_settings.clone());
    controller.bootstrap();

    repl::Repl::new(controller, config_store).run().await
}
