use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc},
    time::timeout,
};

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum PeerCommand {
    Text(String),
    Close,
}

#[derive(Clone)]
struct PeerState {
    commands: broadcast::Sender<PeerCommand>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    connections: Arc<AtomicUsize>,
}

/// Throwaway inference peer: records every binary frame and sends whatever
/// text the test scripts.
pub struct TestPeer {
    pub url: String,
    commands: broadcast::Sender<PeerCommand>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    connections: Arc<AtomicUsize>,
}

impl TestPeer {
    pub async fn spawn() -> Self {
        let (commands, _) = broadcast::channel(16);
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let state = PeerState {
            commands: commands.clone(),
            frames: frames_tx,
            connections: connections.clone(),
        };
        let router = Router::new().route("/ws", get(upgrade)).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            url: format!("ws://{}/ws", addr),
            commands,
            frames,
            connections,
        }
    }

    pub fn send_text(&self, text: &str) {
        self.commands
            .send(PeerCommand::Text(text.to_string()))
            .unwrap();
    }

    pub fn close(&self) {
        self.commands.send(PeerCommand::Close).unwrap();
    }

    pub async fn next_frame(&mut self) -> Vec<u8> {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("peer stopped")
    }

    pub fn try_next_frame(&mut self) -> Option<Vec<u8>> {
        self.frames.try_recv().ok()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Peer that completes the handshake and then never reads, so the client's
/// socket buffers eventually fill up.
pub async fn spawn_stalled_peer() -> String {
    let router = Router::new().route(
        "/ws",
        get(|ws: WebSocketUpgrade| async move {
            ws.on_upgrade(|socket| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(socket);
            })
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("ws://{}/ws", addr)
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<PeerState>) -> Response {
    // Subscribe before the handshake completes so no scripted message is
    // missed once the client sees the connection open.
    let commands = state.commands.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| serve(socket, commands, state.frames))
}

async fn serve(
    mut socket: WebSocket,
    mut commands: broadcast::Receiver<PeerCommand>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
) {
    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Binary(data))) => {
                    let _ = frames.send(data.to_vec());
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(PeerCommand::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(PeerCommand::Close) | Err(_) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}
