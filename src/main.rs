pub use clap::Parser;
use softsync::{args, pipeline};
use tracing_subscriber::{fmt, layer::SubscriberExt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    // Setup the error handler
    color_eyre::install()?;
    // Get the CLI options
    let cli = args::Cli::parse();
    // Logging to stderr, filtered by RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    // Wire up and start all the tasks for this role
    let handles = pipeline::start_pipeline(cli).await?;
    // Join them all when we kill the task
    for handle in handles {
        handle.join().unwrap()?;
    }
    Ok(())
}
