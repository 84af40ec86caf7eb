use crate::camera::acquire_source;
use crate::config::Config;
use crate::prediction::Prediction;
use crate::server::HttpServer;
use crate::session::{Session, SessionSettings};
use crate::sink::PredictionSink;
use crate::telemetry::Metrics;

use std::{error::Error, sync::Arc};
use tokio::{
    signal,
    sync::{broadcast, watch},
};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = Arc::new(Metrics::new()?);
    let sink = PredictionSink::new();

    let session = match Session::start(
        || acquire_source(&config.camera),
        &SessionSettings::from(&config),
        sink.clone(),
        metrics.clone(),
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to start streaming session: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let server = HttpServer::new(
        metrics.clone(),
        sink.clone(),
        session.subscribe_state(),
        &config.server,
    )
    .await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;
    let display_handle = tokio::spawn(log_predictions(sink.subscribe()));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, starting graceful shutdown.");
        }
        _ = session.closed() => {
            tracing::warn!("Connection to prediction service closed, shutting down.");
        }
    }

    session.teardown().await;
    display_handle.abort();

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    let last = sink.current();
    tracing::info!(
        "Last prediction: {} ({:.1}%)",
        last.label(),
        last.confidence * 100.0
    );

    Ok(())
}

/// Stand-in for the on-screen display: reports every classification.
async fn log_predictions(mut predictions: watch::Receiver<Prediction>) {
    while predictions.changed().await.is_ok() {
        let prediction = *predictions.borrow_and_update();
        tracing::info!(
            status = prediction.label(),
            confidence = prediction.confidence,
            "Prediction received"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
