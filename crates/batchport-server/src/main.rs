mod cli;
mod context;
mod grpc;
mod http;

use std::sync::Arc;

use anyhow::{Context, Result};
use batchport_runtime::spawn_reporter;
use clap::Parser;
use cli::{Cli, Command, ModelArgs, ServeArgs};
use context::{load_session, ServiceContext};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => {
            init_tracing(&args.model.log);
            serve(args).await
        }
        Command::Inspect(args) => {
            init_tracing(&args.log);
            inspect(&args)
        }
    }
}

fn init_tracing(log: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let workers = args.workers();

    // Nothing binds until the model has loaded.
    let session = load_session(&args.model, workers).context("model load failed")?;

    let (ctx, tasks) = ServiceContext::start(session, args.batch_policy());
    let reporter = args
        .stats_interval()
        .map(|every| spawn_reporter(Arc::clone(&ctx.stats), every));

    // Either listener stopping, or Ctrl-C, stops both.
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let rpc_stop = Arc::clone(&stop_tx);
    let rpc = grpc::spawn_rpc_server(ctx.clone(), args.grpc_addr(), workers, {
        let rx = stop_rx.clone();
        async move { wait_for_stop(rx).await }
    })?;
    let rpc = tokio::task::spawn_blocking(move || {
        let res = rpc.join();
        rpc_stop.send_replace(true);
        res
    });

    let signal_stop = Arc::clone(&stop_tx);
    tokio::spawn(async move {
        on_ctrl_c(tokio::signal::ctrl_c().await, &signal_stop);
    });

    let http_addr = args.http_addr();
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;
    tracing::info!(addr = %http_addr, "batchportd HTTP listening");

    let http_result = axum::serve(listener, http::router(ctx.clone()))
        .with_graceful_shutdown(wait_for_stop(stop_rx))
        .await
        .context("HTTP server failed");
    stop_tx.send_replace(true);

    let rpc_result = rpc
        .await
        .context("RPC join task failed")?
        .map_err(|_| anyhow::anyhow!("RPC server thread panicked"))?;

    // Dropping the last coordinator handle lets in-flight batches drain.
    let stats = Arc::clone(&ctx.stats);
    drop(ctx);
    let _ = tasks.batcher.await;
    let _ = tasks.worker.await;

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    stats.log_report();

    http_result?;
    rpc_result
}

/// Only a delivered signal stops the server.
fn on_ctrl_c(signal: std::io::Result<()>, stop: &watch::Sender<bool>) {
    match signal {
        Ok(()) => {
            tracing::info!("shutdown requested");
            stop.send_replace(true);
        }
        // Without a handler the listeners keep running until one of them stops.
        Err(err) => tracing::warn!(error = %err, "failed to install Ctrl-C handler"),
    }
}

async fn wait_for_stop(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn inspect(args: &ModelArgs) -> Result<()> {
    let session = load_session(args, 1).context("model load failed")?;
    let spec = session.spec();

    println!("model:           {}", args.model_path.display());
    println!("input:           {} ({} features)", spec.input_name, spec.input_features);
    match spec.output_features {
        Some(n) => println!("output:          {} ({n} features)", spec.output_name),
        None => println!("output:          {} (dynamic)", spec.output_name),
    }
    println!("providers:       {}", spec.device());
    println!("framework:       {}", spec.framework);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_signal_handler_leaves_server_running() {
        let (stop_tx, stop_rx) = watch::channel(false);
        on_ctrl_c(
            Err(std::io::Error::other("signal driver unavailable")),
            &stop_tx,
        );
        assert!(!*stop_rx.borrow());

        on_ctrl_c(Ok(()), &stop_tx);
        assert!(*stop_rx.borrow());
    }
}
