//! Launcher: load configuration, ingest manifest artifacts, serve.
//!
//! The only CLI surface is the configuration file flag; everything else
//! (listen address, manifest directory, limits) comes from configuration.
//! Exit codes: 0 on clean shutdown, 2 on configuration errors, 1 on any
//! other startup failure.

use clap::Parser;
use gati_core::config::GatiConfig;
use gati_runtime::RuntimeBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "gati-server", about = "Gati application runtime")]
struct Args {
    /// Configuration file (YAML). Environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match GatiConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };
    gati_core::observe::init_tracing(&config.log_level);

    let listen: SocketAddr = match config.listen_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("configuration error: LISTEN_ADDR '{}': {err}", config.listen_addr);
            return ExitCode::from(2);
        }
    };

    let mut builder = RuntimeBuilder::new(config.clone());
    if let Some(dir) = &config.manifest_dir {
        builder = builder.artifacts(dir);
    }
    let app = match builder.build().await {
        Ok(app) => app,
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            return ExitCode::from(1);
        }
    };

    match app.serve(listen).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "server error");
            ExitCode::from(1)
        }
    }
}
