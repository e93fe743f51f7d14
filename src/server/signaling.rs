use std::collections::HashMap;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::SignalingMessage;
use crate::server::{write_pump, MAILBOX, READ_DEADLINE};

/// One connected signaling peer as the hub sees it.
pub struct SignalingHandle {
    pub user_id: String,
    pub username: String,
    pub room_id: String,
    pub tx: mpsc::Sender<SignalingMessage>,
}

pub enum SignalingCommand {
    /// Add a peer to its room, creating the room on demand.
    Register(SignalingHandle),
    /// Remove a peer, notify the remaining members, and delete the room once
    /// it is empty.
    Unregister { room_id: String, user_id: String },
    /// Deliver an envelope to the one member named by its `target_id`.
    Route(SignalingMessage),
    Rooms(oneshot::Sender<Vec<String>>),
}

struct SignalingRoom {
    id: String,
    clients: HashMap<String, SignalingHandle>,
}

/// run_hub owns the signaling room table; every membership change and every
/// routed envelope funnels through its command channel. Spawn as a tokio task.
pub async fn run_hub(mut rx: mpsc::Receiver<SignalingCommand>) {
    let mut rooms: HashMap<String, SignalingRoom> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            SignalingCommand::Register(client) => {
                let room = rooms.entry(client.room_id.clone()).or_insert_with(|| {
                    debug!(room_id = %client.room_id, "signaling room created");
                    SignalingRoom {
                        id: client.room_id.clone(),
                        clients: HashMap::new(),
                    }
                });
                if room.clients.contains_key(&client.user_id) {
                    debug!(user_id = %client.user_id, room_id = %room.id, "peer already registered");
                    continue;
                }
                info!(
                    user_id = %client.user_id,
                    room_id = %room.id,
                    peers = room.clients.len() + 1,
                    "signaling peer registered"
                );
                room.clients.insert(client.user_id.clone(), client);
            }
            SignalingCommand::Unregister { room_id, user_id } => {
                let mut reap = false;
                if let Some(room) = rooms.get_mut(&room_id) {
                    if let Some(client) = room.clients.remove(&user_id) {
                        info!(
                            user_id = %user_id,
                            room_id = %room_id,
                            peers = room.clients.len(),
                            "signaling peer unregistered"
                        );
                        let notice = SignalingMessage::peer_disconnected(
                            &room_id,
                            &client.user_id,
                            &client.username,
                        );
                        for other in room.clients.values() {
                            if other.tx.try_send(notice.clone()).is_err() {
                                warn!(
                                    user_id = %other.user_id,
                                    "mailbox full, dropping disconnect notice"
                                );
                            }
                        }
                        reap = room.clients.is_empty();
                    }
                }
                if reap {
                    rooms.remove(&room_id);
                    debug!(room_id = %room_id, "empty signaling room deleted");
                }
            }
            SignalingCommand::Route(msg) => {
                let Some(room) = rooms.get(&msg.room_id) else {
                    debug!(room_id = %msg.room_id, "signal for unknown room dropped");
                    continue;
                };
                match room.clients.get(&msg.target_id) {
                    Some(target) => {
                        if target.tx.try_send(msg.clone()).is_err() {
                            warn!(
                                target_id = %msg.target_id,
                                msg_type = %msg.msg_type,
                                "target mailbox full, dropping signal"
                            );
                        }
                    }
                    None => {
                        debug!(
                            target_id = %msg.target_id,
                            room_id = %msg.room_id,
                            "signal target not found"
                        );
                        if let Some(sender) = room.clients.get(&msg.sender_id) {
                            let reply =
                                SignalingMessage::target_not_found(&msg.room_id, &msg.sender_id);
                            let _ = sender.tx.try_send(reply);
                        }
                    }
                }
            }
            SignalingCommand::Rooms(reply) => {
                let _ = reply.send(rooms.keys().cloned().collect());
            }
        }
    }
}

/// Run the reader and writer loops for one signaling connection until it
/// closes, then unregister it from the hub.
pub async fn serve_conn(
    ws: WebSocketStream<TcpStream>,
    commands: mpsc::Sender<SignalingCommand>,
    room_id: String,
    user_id: String,
    username: String,
) {
    let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX);
    if commands
        .send(SignalingCommand::Register(SignalingHandle {
            user_id: user_id.clone(),
            username: username.clone(),
            room_id: room_id.clone(),
            tx: mailbox_tx,
        }))
        .await
        .is_err()
    {
        return;
    }

    let (sink, mut stream) = ws.split();
    let writer = tokio::spawn(write_pump(sink, mailbox_rx));

    info!(user_id = %user_id, room_id = %room_id, "signaling peer connected");

    loop {
        let frame = match timeout(READ_DEADLINE, stream.next()).await {
            Err(_) => {
                debug!(user_id = %user_id, "signaling read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(user_id = %user_id, error = %e, "signaling read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        let text = match frame {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
            Message::Close(_) => break,
            // Pings are answered by the library; pongs only refresh the deadline.
            _ => continue,
        };

        let mut msg: SignalingMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "malformed signaling envelope");
                break;
            }
        };

        // Identity and routing metadata come from the connection, never from
        // the payload.
        msg.id = Uuid::new_v4().to_string();
        msg.room_id = room_id.clone();
        msg.sender_id = user_id.clone();
        msg.username = username.clone();
        msg.created_at = Some(Utc::now());

        if msg.target_id.is_empty() {
            debug!(user_id = %user_id, msg_type = %msg.msg_type, "signal without target dropped");
            continue;
        }

        commands.send(SignalingCommand::Route(msg)).await.ok();
    }

    commands
        .send(SignalingCommand::Unregister {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
        })
        .await
        .ok();
    let _ = writer.await;

    info!(user_id = %user_id, room_id = %room_id, "signaling peer disconnected");
}
