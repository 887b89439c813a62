use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod feedback;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = config::Args::parse();
    let config = args.load().context("invalid configuration")?;

    tracing::info!(
        camera = %config.camera,
        known_faces = %config.known_faces.display(),
        attendance = %config.attendance_file.display(),
        model = %config.model,
        tolerance = config.tolerance.get(),
        "rollcalld starting"
    );

    // Camera and inference sessions stay on the blocking thread for their
    // whole life; only the stop flag crosses over.
    let stop = Arc::new(AtomicBool::new(false));
    let loop_stop = stop.clone();
    let mut capture = tokio::task::spawn_blocking(move || {
        let mut engine = engine::init(&config)?;
        let result = engine.run(&loop_stop);
        tracing::debug!(
            state = ?engine.state(),
            frames = engine.summary().frames,
            records = engine.ledger().len(),
            "capture released"
        );
        result
    });

    let result = tokio::select! {
        joined = &mut capture => joined,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("stop requested, finishing current frame");
            stop.store(true, Ordering::Relaxed);
            capture.await
        }
    };

    let summary = result.context("capture loop panicked")?.context("capture loop failed")?;
    tracing::info!(
        created = summary.created,
        updated = summary.updated,
        "rollcalld stopped"
    );
    Ok(())
}
