//! Hivecore CLI entry point.

use clap::Parser;

#[derive(Parser)]
#[command(name = "hivecore", version)]
#[command(about = "Control plane for the unified bot protocol")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "hivecore=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    // Exit code 1: the deployment is wrong (env vars, store URL).
    let config = match hivecore::config::Config::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(1);
        }
    };

    let core = match hivecore::core::Core::new(config).await {
        Ok(core) => core,
        Err(error) => {
            eprintln!("startup failed: {error}");
            std::process::exit(1);
        }
    };

    // Exit code 2: the process died at runtime.
    if let Err(error) = core.run().await {
        tracing::error!(%error, "fatal runtime error");
        std::process::exit(2);
    }
}
