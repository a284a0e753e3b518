use clap::Parser;
use tracing::{info, warn};
use visiond::{cli::Cli, init_logging, visiond_service};

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let _guard = init_logging(args.log_level, &args.log_path)?;

    let (server_future, cancel_token, worker_handle) = visiond_service(args)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let shutdown_token = cancel_token.clone();
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
            shutdown_token.cancel();
        }
    });

    rt.block_on(server_future)?;
    drop(rt);

    // All detector handles are gone with the runtime; the worker drains and
    // exits.
    if worker_handle.join().is_err() {
        warn!("Detector worker thread panicked during shutdown");
    }
    Ok(())
}
