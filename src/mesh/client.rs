use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use super::coordinator::{MeshCommand, MeshCoordinator, MeshView};
use super::transport::{MediaTrack, TrackId, TransportFactory};
use crate::config::MeshConfig;
use crate::signaling::{ClientMessage, ConnId, RoomKey, ServerMessage};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("mesh client has shut down")]
    Closed,
}

/// A participant connected to a signaling server over WebSocket.
pub struct MeshClient {
    commands: mpsc::UnboundedSender<MeshCommand>,
    view: MeshView,
    driver: JoinHandle<()>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl MeshClient {
    pub async fn connect(
        url: &str,
        room: impl Into<RoomKey>,
        name: impl Into<String>,
        config: MeshConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let (coordinator, view) =
            MeshCoordinator::new(room.into(), name.into(), config, factory, signal_tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = signal_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize {}: {}", msg.kind(), e);
                        continue;
                    }
                };
                if ws_tx.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if server_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Unparseable server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("Server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        let driver = tokio::spawn(coordinator.run(server_rx, command_rx));

        Ok(Self {
            commands,
            view,
            driver,
            writer,
            reader,
        })
    }

    pub fn view(&self) -> &MeshView {
        &self.view
    }

    pub fn local_id(&self) -> Option<ConnId> {
        self.view.local_id()
    }

    fn command(&self, cmd: MeshCommand) -> Result<(), ClientError> {
        self.commands.send(cmd).map_err(|_| ClientError::Closed)
    }

    pub fn add_track(&self, track: MediaTrack) -> Result<(), ClientError> {
        self.command(MeshCommand::AddTrack(track))
    }

    pub fn remove_track(&self, id: impl Into<TrackId>) -> Result<(), ClientError> {
        self.command(MeshCommand::RemoveTrack(id.into()))
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.command(MeshCommand::SendChat(text.into()))
    }

    pub fn renegotiate(&self, remote: ConnId) -> Result<(), ClientError> {
        self.command(MeshCommand::Renegotiate(remote))
    }

    /// Leave the room and close the connection.
    pub async fn leave(self) {
        let _ = self.commands.send(MeshCommand::Leave);
        let _ = self.driver.await;
        // Links still hold signal senders for a moment after closing.
        let _ = self.writer.await;
        self.reader.abort();
    }
}
