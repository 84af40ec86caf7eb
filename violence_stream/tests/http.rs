use std::sync::Arc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{broadcast, watch},
};
use violence_stream::{
    config::ServerConfig, server::HttpServer, telemetry::Metrics, ConnectionState, Prediction,
    PredictionSink,
};

async fn get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_health_metrics_and_prediction_routes() {
    let metrics = Arc::new(Metrics::new().unwrap());
    let sink = PredictionSink::new();
    let (_state_tx, state_rx) = watch::channel(ConnectionState::Open);
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
    };

    let server = HttpServer::new(metrics.clone(), sink.clone(), state_rx, &config)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = server.run(shutdown_tx.subscribe()).await.unwrap();

    metrics.record_frame_sent();
    sink.update(Prediction::new(true, 0.92));

    let health = get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#""status":"Available""#));
    assert!(health.contains(r#""connection":"open""#));

    let exported = get(addr, "/metrics").await;
    assert!(exported.starts_with("HTTP/1.1 200"));
    assert!(exported.contains("violence_stream_frames_sent_total 1"));

    let prediction = get(addr, "/prediction").await;
    assert!(prediction.contains(r#"{"isViolent":true,"confidence":0.92}"#));

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}
