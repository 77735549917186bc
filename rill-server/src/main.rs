//! `rilld` — the RTMFP rendezvous and relay server.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rill_server::config::{Args, Config};
use rill_server::engine::Engine;

fn main() {
    let args = Args::parse();
    let cfg = match Config::from_args(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("parse argument(s) failed:\n        {e}");
            std::process::exit(1);
        }
    };

    let default_filter = if cfg.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
    info!(?cfg, "starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.ncpu)
        .enable_all()
        .build()
        .expect("tokio runtime");

    runtime.block_on(async move {
        let _eng = match Engine::start(cfg) {
            Ok(eng) => eng,
            Err(e) => {
                eprintln!("startup failed: {e}");
                std::process::exit(1);
            }
        };
        // Long-running; stop on Ctrl-C.
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    });
}
