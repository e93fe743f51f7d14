use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::ChatMessage;

/// The hub's view of one connected chat client: its authenticated identity
/// plus the sending half of its outbound mailbox. Dropping the handle closes
/// the mailbox, which makes the connection's writer loop terminate.
pub struct ClientHandle {
    pub user_id: String,
    pub username: String,
    pub room_id: String,
    pub tx: mpsc::Sender<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberInfo {
    pub user_id: String,
    pub username: String,
}

pub enum HubCommand {
    /// Pre-create a room with a display name. Re-creating updates the name.
    CreateRoom { id: String, name: String },
    /// Add a client to its room, creating the room on demand. Registering an
    /// identity already present is a no-op; the incoming handle is dropped.
    Register(ClientHandle),
    /// Remove a client from a room. Notifies remaining members and reaps the
    /// room once it is empty.
    Unregister { room_id: String, user_id: String },
    /// Deliver a message to every member of its room, sender included.
    Broadcast(ChatMessage),
    Rooms(oneshot::Sender<Vec<RoomInfo>>),
    Members {
        room_id: String,
        reply: oneshot::Sender<Vec<MemberInfo>>,
    },
}

struct Room {
    id: String,
    name: String,
    clients: HashMap<String, ClientHandle>,
}

/// run_hub owns the chat room table. It is the only code that touches room
/// membership, so every mutation is serialized through the command channel.
/// It must be spawned as a tokio task and runs for the life of the process.
pub async fn run_hub(mut rx: mpsc::Receiver<HubCommand>) {
    let mut rooms: HashMap<String, Room> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::CreateRoom { id, name } => {
                let room = rooms.entry(id.clone()).or_insert_with(|| Room {
                    id,
                    name: String::new(),
                    clients: HashMap::new(),
                });
                room.name = name;
                debug!(room_id = %room.id, name = %room.name, "room created");
            }
            HubCommand::Register(client) => {
                let room = rooms.entry(client.room_id.clone()).or_insert_with(|| Room {
                    id: client.room_id.clone(),
                    name: client.room_id.clone(),
                    clients: HashMap::new(),
                });
                if room.clients.contains_key(&client.user_id) {
                    // Duplicate join: dropping the new handle closes its mailbox.
                    debug!(user_id = %client.user_id, room_id = %room.id, "already registered");
                    continue;
                }
                info!(
                    user_id = %client.user_id,
                    room_id = %room.id,
                    members = room.clients.len() + 1,
                    "client registered"
                );
                room.clients.insert(client.user_id.clone(), client);
            }
            HubCommand::Unregister { room_id, user_id } => {
                let mut reap = false;
                if let Some(room) = rooms.get_mut(&room_id) {
                    if let Some(client) = room.clients.remove(&user_id) {
                        info!(
                            user_id = %user_id,
                            room_id = %room_id,
                            members = room.clients.len(),
                            "client unregistered"
                        );
                        if room.clients.is_empty() {
                            reap = true;
                        } else {
                            let notice = ChatMessage::stamped(
                                &room_id,
                                &client.user_id,
                                &client.username,
                                format!("{} has left the chat", client.username),
                            );
                            deliver_all(room, &notice);
                        }
                    }
                }
                if reap {
                    rooms.remove(&room_id);
                    debug!(room_id = %room_id, "empty room reaped");
                }
            }
            HubCommand::Broadcast(msg) => {
                if let Some(room) = rooms.get(&msg.room_id) {
                    deliver_all(room, &msg);
                } else {
                    debug!(room_id = %msg.room_id, "broadcast to unknown room dropped");
                }
            }
            HubCommand::Rooms(reply) => {
                let rooms: Vec<RoomInfo> = rooms
                    .values()
                    .map(|r| RoomInfo {
                        id: r.id.clone(),
                        name: r.name.clone(),
                    })
                    .collect();
                let _ = reply.send(rooms);
            }
            HubCommand::Members { room_id, reply } => {
                let members = rooms
                    .get(&room_id)
                    .map(|room| {
                        room.clients
                            .values()
                            .map(|c| MemberInfo {
                                user_id: c.user_id.clone(),
                                username: c.username.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
        }
    }
}

/// Non-blocking fan-out to every member of a room. A full mailbox loses the
/// message for that one recipient; the rest still receive it.
fn deliver_all(room: &Room, msg: &ChatMessage) {
    for client in room.clients.values() {
        if client.tx.try_send(msg.clone()).is_err() {
            warn!(
                user_id = %client.user_id,
                room_id = %room.id,
                "mailbox full, dropping message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(
        user_id: &str,
        username: &str,
        room_id: &str,
        capacity: usize,
    ) -> (ClientHandle, mpsc::Receiver<ChatMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            ClientHandle {
                user_id: user_id.to_string(),
                username: username.to_string(),
                room_id: room_id.to_string(),
                tx,
            },
            rx,
        )
    }

    fn spawn_hub() -> mpsc::Sender<HubCommand> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_hub(rx));
        tx
    }

    async fn members(hub: &mpsc::Sender<HubCommand>, room_id: &str) -> Vec<MemberInfo> {
        let (reply, rx) = oneshot::channel();
        hub.send(HubCommand::Members {
            room_id: room_id.to_string(),
            reply,
        })
        .await
        .unwrap();
        rx.await.unwrap()
    }

    async fn rooms(hub: &mpsc::Sender<HubCommand>) -> Vec<RoomInfo> {
        let (reply, rx) = oneshot::channel();
        hub.send(HubCommand::Rooms(reply)).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn register_and_unregister_track_membership() {
        let hub = spawn_hub();
        let (a, _rx_a) = handle("a", "Alice", "r1", 8);
        let (b, _rx_b) = handle("b", "Bob", "r1", 8);

        hub.send(HubCommand::Register(a)).await.unwrap();
        hub.send(HubCommand::Register(b)).await.unwrap();
        let mut got: Vec<String> = members(&hub, "r1").await.into_iter().map(|m| m.user_id).collect();
        got.sort();
        assert_eq!(got, vec!["a", "b"]);

        hub.send(HubCommand::Unregister {
            room_id: "r1".to_string(),
            user_id: "a".to_string(),
        })
        .await
        .unwrap();
        let got: Vec<String> = members(&hub, "r1").await.into_iter().map(|m| m.user_id).collect();
        assert_eq!(got, vec!["b"]);
    }

    #[tokio::test]
    async fn register_is_idempotent_and_closes_duplicate_mailbox() {
        let hub = spawn_hub();
        let (a, _rx_a) = handle("a", "Alice", "r1", 8);
        let (dup, mut rx_dup) = handle("a", "Alice", "r1", 8);

        hub.send(HubCommand::Register(a)).await.unwrap();
        hub.send(HubCommand::Register(dup)).await.unwrap();

        assert_eq!(members(&hub, "r1").await.len(), 1);
        // The duplicate's handle was dropped, so its mailbox is closed.
        assert!(rx_dup.recv().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_including_sender() {
        let hub = spawn_hub();
        let (a, mut rx_a) = handle("a", "Alice", "r1", 8);
        let (b, mut rx_b) = handle("b", "Bob", "r1", 8);
        hub.send(HubCommand::Register(a)).await.unwrap();
        hub.send(HubCommand::Register(b)).await.unwrap();

        let msg = ChatMessage::stamped("r1", "a", "Alice", "hello");
        hub.send(HubCommand::Broadcast(msg)).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().content, "hello");
        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.content, "hello");
        assert_eq!(got.user_id, "a");
        assert_eq!(got.room_id, "r1");
    }

    #[tokio::test]
    async fn full_mailbox_is_skipped_without_blocking_the_hub() {
        let hub = spawn_hub();
        let (a, mut rx_a) = handle("a", "Alice", "r1", 8);
        let (b, mut rx_b) = handle("b", "Bob", "r1", 1);
        hub.send(HubCommand::Register(a)).await.unwrap();
        hub.send(HubCommand::Register(b)).await.unwrap();

        hub.send(HubCommand::Broadcast(ChatMessage::stamped("r1", "a", "Alice", "one")))
            .await
            .unwrap();
        // Bob's capacity-1 mailbox is now full; the second broadcast is
        // dropped for him but still delivered to Alice.
        hub.send(HubCommand::Broadcast(ChatMessage::stamped("r1", "a", "Alice", "two")))
            .await
            .unwrap();

        assert_eq!(rx_a.recv().await.unwrap().content, "one");
        assert_eq!(rx_a.recv().await.unwrap().content, "two");
        assert_eq!(rx_b.recv().await.unwrap().content, "one");
        assert!(rx_b.try_recv().is_err());

        // The hub loop is still responsive after the drop.
        assert_eq!(members(&hub, "r1").await.len(), 2);
    }

    #[tokio::test]
    async fn leaver_triggers_notice_to_remaining_members() {
        let hub = spawn_hub();
        let (a, _rx_a) = handle("a", "Alice", "r1", 8);
        let (b, mut rx_b) = handle("b", "Bob", "r1", 8);
        hub.send(HubCommand::Register(a)).await.unwrap();
        hub.send(HubCommand::Register(b)).await.unwrap();

        hub.send(HubCommand::Unregister {
            room_id: "r1".to_string(),
            user_id: "a".to_string(),
        })
        .await
        .unwrap();

        let notice = rx_b.recv().await.unwrap();
        assert_eq!(notice.content, "Alice has left the chat");
        assert_eq!(notice.user_id, "a");
        assert_eq!(notice.room_id, "r1");
    }

    #[tokio::test]
    async fn unregistering_last_member_reaps_the_room() {
        let hub = spawn_hub();
        let (a, _rx_a) = handle("a", "Alice", "r1", 8);
        hub.send(HubCommand::Register(a)).await.unwrap();
        assert_eq!(rooms(&hub).await.len(), 1);

        hub.send(HubCommand::Unregister {
            room_id: "r1".to_string(),
            user_id: "a".to_string(),
        })
        .await
        .unwrap();
        assert!(rooms(&hub).await.is_empty());
    }

    #[tokio::test]
    async fn unregister_closes_the_mailbox() {
        let hub = spawn_hub();
        let (a, mut rx_a) = handle("a", "Alice", "r1", 8);
        hub.send(HubCommand::Register(a)).await.unwrap();
        hub.send(HubCommand::Unregister {
            room_id: "r1".to_string(),
            user_id: "a".to_string(),
        })
        .await
        .unwrap();

        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_room_is_a_soft_failure() {
        let hub = spawn_hub();
        hub.send(HubCommand::Broadcast(ChatMessage::stamped("nope", "a", "Alice", "x")))
            .await
            .unwrap();
        // Still alive and empty.
        assert!(rooms(&hub).await.is_empty());
    }

    #[tokio::test]
    async fn create_room_sets_display_name() {
        let hub = spawn_hub();
        hub.send(HubCommand::CreateRoom {
            id: "r1".to_string(),
            name: "Standup".to_string(),
        })
        .await
        .unwrap();

        let got = rooms(&hub).await;
        assert_eq!(
            got,
            vec![RoomInfo {
                id: "r1".to_string(),
                name: "Standup".to_string(),
            }]
        );
    }
}
