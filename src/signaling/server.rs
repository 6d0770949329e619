use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::SessionDirectory;
use super::messages::{ClientMessage, ServerMessage};
use super::relay::SignalingRelay;
use super::types::{ConnId, OutboundMessage, OutboundSender, RoomKey, SignalingError};
use crate::config::ServerConfig;

pub struct SignalingServer {
    directory: SessionDirectory,
    relay: SignalingRelay,
    ping_interval: Duration,
    pong_timeout: Duration,
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new(&ServerConfig::default())
    }
}

impl SignalingServer {
    pub fn new(config: &ServerConfig) -> Self {
        let directory = SessionDirectory::new(config.room_queue_depth);
        let relay = SignalingRelay::new(directory.clone());

        Self {
            directory,
            relay,
            ping_interval: config.ping_interval(),
            pong_timeout: config.pong_timeout(),
        }
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn relay(&self) -> &SignalingRelay {
        &self.relay
    }

    /// Attach a new client whose outbound messages go to `tx`.
    pub fn connect(&self, tx: OutboundSender) -> ClientConnection {
        let mut id = ConnId::generate();
        while self.directory.is_live(&id) {
            id = ConnId::generate();
        }
        ClientConnection {
            id,
            tx,
            directory: self.directory.clone(),
            relay: self.relay.clone(),
            room: None,
        }
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("Signaling server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            let (tx, rx) = mpsc::unbounded_channel::<OutboundMessage>();
            let connection = self.connect(tx);
            let timing = (self.ping_interval, self.pong_timeout);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, connection, rx, timing).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

/// Server-side state of one client connection.
///
/// Inbound messages must be fed one at a time, which keeps per-sender
/// ordering for everything this connection relays.
pub struct ClientConnection {
    id: ConnId,
    tx: OutboundSender,
    directory: SessionDirectory,
    relay: SignalingRelay,
    room: Option<RoomKey>,
}

impl ClientConnection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn room(&self) -> Option<&RoomKey> {
        self.room.as_ref()
    }

    pub async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => self.send_error(format!("Invalid message: {}", e)),
        }
    }

    pub async fn handle_message(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Join { room, name } => {
                if self.room.is_some() {
                    self.depart().await;
                }
                match self
                    .directory
                    .join(self.id, room.clone(), name, self.tx.clone())
                    .await
                {
                    Ok(_) => self.room = Some(room),
                    Err(e) => self.send_error(e.to_string()),
                }
            }

            ClientMessage::Leave => self.depart().await,

            other => {
                if self.room.is_none() {
                    self.send_error(SignalingError::NotJoined.to_string());
                    return;
                }
                self.relay.relay(self.id, other).await;
            }
        }
    }

    /// The single exit path for a participant, whether it left explicitly
    /// or its transport went away.
    pub async fn depart(&mut self) {
        if self.room.take().is_some() {
            self.directory.leave(self.id).await;
        }
    }

    fn send_error(&self, message: String) {
        let err = ServerMessage::Error { message };
        match serde_json::to_string(&err) {
            Ok(json) => {
                let _ = self.tx.send(OutboundMessage::from(json));
            }
            Err(e) => warn!("Failed to serialize error for {}: {}", self.id, e),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    mut connection: ClientConnection,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    (ping_every, pong_timeout): (Duration, Duration),
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    info!("WebSocket connection from {} as {}", addr, connection.id());

    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut ping_interval = tokio::time::interval(ping_every);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let ws_msg = Message::Text(msg.into_inner());
                    if ws_tx.send(ws_msg).await.is_err() {
                        break;
                    }
                }
                Some(ctrl_msg) = ctrl_rx.recv() => {
                    if ws_tx.send(ctrl_msg).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
    });

    loop {
        let pong_wait = async {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(tokio::time::Instant::now() + pong_timeout);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_wait => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => connection.handle_text(&text).await,
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    connection.depart().await;

    send_task.abort();
    info!("WebSocket disconnected: {} ({})", addr, connection.id());

    Ok(())
}
