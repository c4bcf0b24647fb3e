//! One WebSocket connection: decode frames into hub commands, encode hub
//! output back onto the socket.

use std::net::SocketAddr;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use parkping_shared::constants::CLOSE_CODE_KICKED;
use parkping_shared::protocol::{Ack, ClientFrame, ServerEvent};

use crate::hub::{HubCommand, HubHandle};
use crate::presence::Outbound;
use crate::rate_limit::TokenBucket;

/// Inbound event budget for a single connection.
#[derive(Debug, Clone, Copy)]
pub struct EventLimits {
    pub rate: f64,
    pub burst: f64,
}

pub async fn run_session(socket: WebSocket, hub: HubHandle, peer: SocketAddr, limits: EventLimits) {
    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel();

    if !hub
        .send(HubCommand::Connect {
            conn,
            tx: tx.clone(),
        })
        .await
    {
        warn!(peer = %peer, "Hub is gone, refusing connection");
        return;
    }
    debug!(conn = %conn, peer = %peer, "Connection opened");

    let (mut sender, mut receiver) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Event(event) => {
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(conn = %conn, error = %e, "Failed to encode event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let frame = CloseFrame {
                        code: CLOSE_CODE_KICKED,
                        reason: reason.into(),
                    };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let reader = async {
        let mut bucket = TokenBucket::new(limits.burst);
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            if !bucket.try_consume(limits.rate, limits.burst) {
                warn!(conn = %conn, peer = %peer, "Event rate exceeded, dropping frame");
                continue;
            }

            match ClientFrame::from_json(&text) {
                Ok(frame) => {
                    if !hub.send(HubCommand::Inbound { conn, frame }).await {
                        break;
                    }
                }
                Err(e) => {
                    debug!(conn = %conn, error = %e, "Malformed frame");
                    let ack = Ack::failure(ClientFrame::request_id_hint(&text), e.to_string());
                    let _ = tx.send(Outbound::Event(ServerEvent::Ack(ack)));
                }
            }
        }
    };

    // A kick ends the writer; the peer closing ends the reader.
    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {}
    }
    writer.abort();

    hub.send(HubCommand::Disconnect { conn }).await;
    debug!(conn = %conn, "Connection closed");
}
