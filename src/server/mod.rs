pub mod hub;
pub mod signaling;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::protocol::ChatMessage;
use crate::store::Store;
use hub::{ClientHandle, HubCommand};
use signaling::SignalingCommand;

/// Capacity of each connection's outbound mailbox.
pub const MAILBOX: usize = 32;
/// Keepalive cadence; must stay below READ_DEADLINE.
pub const PING_INTERVAL: Duration = Duration::from_secs(54);
/// How long a connection may stay silent before it is considered dead.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Upper bound on a single frame write.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

const COMMAND_BUF: usize = 256;
const WORKER_JOBS: usize = 1024;
const SAVE_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Worker pool for async persistence ─────────────────────────────────────

/// Decouples message persistence from the broadcast path: jobs are submitted
/// non-blockingly and each save runs under its own timeout, so storage
/// latency never delays real-time delivery.
struct WorkerPool {
    tx: mpsc::Sender<ChatMessage>,
}

impl WorkerPool {
    fn new(n: usize, store: Arc<Store>) -> Self {
        let (tx, rx) = mpsc::channel::<ChatMessage>(WORKER_JOBS);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..n {
            let store = store.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let msg = { rx.lock().await.recv().await };
                    let Some(msg) = msg else { break };
                    let store = store.clone();
                    let saved = timeout(
                        SAVE_TIMEOUT,
                        tokio::task::spawn_blocking(move || store.save_message(msg)),
                    )
                    .await;
                    match saved {
                        Err(_) => warn!("message persistence timed out"),
                        Ok(Err(e)) => warn!(error = %e, "persistence worker failed"),
                        Ok(Ok(Err(e))) => warn!(error = %e, "failed to persist message"),
                        Ok(Ok(Ok(()))) => {}
                    }
                }
            });
        }
        Self { tx }
    }

    fn submit(&self, msg: ChatMessage) {
        if self.tx.try_send(msg).is_err() {
            warn!("persistence queue full, message dropped from storage");
        }
    }
}

// ─── Request routing ────────────────────────────────────────────────────────

enum Endpoint {
    Chat,
    Signaling,
}

struct Route {
    endpoint: Endpoint,
    room_id: String,
    user_id: String,
    username: String,
}

struct RouteReject {
    status: StatusCode,
    reason: &'static str,
}

/// Parse `/ws/joinRoom/{room}` or `/signaling/joinRoom/{room}` plus the
/// identity the auth collaborator forwarded in the query string. The hub
/// trusts `user_id` and `username` for the lifetime of the connection.
fn parse_route(uri: &Uri) -> Result<Route, RouteReject> {
    let not_found = RouteReject {
        status: StatusCode::NOT_FOUND,
        reason: "unknown endpoint",
    };

    let mut segments = uri.path().trim_matches('/').split('/');
    let endpoint = match segments.next() {
        Some("ws") => Endpoint::Chat,
        Some("signaling") => Endpoint::Signaling,
        _ => return Err(not_found),
    };
    if segments.next() != Some("joinRoom") {
        return Err(not_found);
    }
    let room_id = match segments.next() {
        Some(room) if !room.is_empty() => room.to_string(),
        _ => return Err(not_found),
    };
    if segments.next().is_some() {
        return Err(not_found);
    }

    let mut user_id = None;
    let mut username = None;
    for pair in uri.query().unwrap_or("").split('&') {
        let mut kv = pair.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("user_id"), Some(v)) if !v.is_empty() => user_id = Some(v.to_string()),
            (Some("username"), Some(v)) if !v.is_empty() => username = Some(v.to_string()),
            _ => {}
        }
    }
    let unauthorized = |reason| RouteReject {
        status: StatusCode::UNAUTHORIZED,
        reason,
    };
    Ok(Route {
        endpoint,
        room_id,
        user_id: user_id.ok_or_else(|| unauthorized("user_id required"))?,
        username: username.ok_or_else(|| unauthorized("username required"))?,
    })
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}

// ─── Server ─────────────────────────────────────────────────────────────────

pub struct Server {
    store: Arc<Store>,
    pool: WorkerPool,
    hub_tx: mpsc::Sender<HubCommand>,
    signaling_tx: mpsc::Sender<SignalingCommand>,
}

impl Server {
    pub fn new(data_dir: &str, workers: usize) -> Result<Self> {
        let store = Arc::new(Store::new(data_dir)?);

        let (hub_tx, hub_rx) = mpsc::channel(COMMAND_BUF);
        tokio::spawn(hub::run_hub(hub_rx));

        let (signaling_tx, signaling_rx) = mpsc::channel(COMMAND_BUF);
        tokio::spawn(signaling::run_hub(signaling_rx));

        let pool = WorkerPool::new(workers, store.clone());

        Ok(Self {
            store,
            pool,
            hub_tx,
            signaling_tx,
        })
    }

    /// Command channel of the chat hub, for gateway-side callers such as the
    /// room CRUD service (create-room, room/member listings).
    pub fn chat_commands(&self) -> mpsc::Sender<HubCommand> {
        self.hub_tx.clone()
    }

    pub fn signaling_commands(&self) -> mpsc::Sender<SignalingCommand> {
        self.signaling_tx.clone()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening");
        self.serve_on(listener).await
    }

    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let srv = self.clone();
                    tokio::spawn(srv.handle_conn(stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                    return Ok(());
                }
            }
        }
    }

    /// Upgrade one inbound TCP connection and hand it to the hub named by the
    /// request path. A bad path or missing identity fails the handshake.
    async fn handle_conn(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut route = None;
        let ws = match accept_hdr_async(stream, |req: &Request, resp: Response| {
            match parse_route(req.uri()) {
                Ok(r) => {
                    route = Some(r);
                    Ok(resp)
                }
                Err(r) => Err(reject(r.status, r.reason)),
            }
        })
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%peer, error = %e, "websocket handshake failed");
                return;
            }
        };
        let Some(route) = route else { return };

        match route.endpoint {
            Endpoint::Chat => self.serve_chat(ws, route).await,
            Endpoint::Signaling => {
                signaling::serve_conn(
                    ws,
                    self.signaling_tx.clone(),
                    route.room_id,
                    route.user_id,
                    route.username,
                )
                .await
            }
        }
    }

    /// Run the reader and writer loops for one chat connection. The reader
    /// stamps identity onto every inbound payload, hands it to the hub, and
    /// unregisters on every exit path.
    async fn serve_chat(self: Arc<Self>, ws: WebSocketStream<TcpStream>, route: Route) {
        let Route {
            room_id,
            user_id,
            username,
            ..
        } = route;

        let (mailbox_tx, mailbox_rx) = mpsc::channel(MAILBOX);
        if self
            .hub_tx
            .send(HubCommand::Register(ClientHandle {
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
        let joined = ChatMessage::stamped(
            &room_id,
            &user_id,
            &username,
            format!("{} has joined the chat", username),
        );
        self.hub_tx.send(HubCommand::Broadcast(joined)).await.ok();

        let (sink, mut stream) = ws.split();
        let writer = tokio::spawn(write_pump(sink, mailbox_rx));

        info!(user_id = %user_id, room_id = %room_id, "chat client connected");

        loop {
            let frame = match timeout(READ_DEADLINE, stream.next()).await {
                Err(_) => {
                    debug!(user_id = %user_id, "read deadline expired");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(user_id = %user_id, error = %e, "websocket read error");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            let content = match frame {
                Message::Text(text) => text.to_string(),
                Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                Message::Close(_) => break,
                // Pings are answered by the library; pongs only refresh the deadline.
                _ => continue,
            };

            let msg = ChatMessage::stamped(&room_id, &user_id, &username, content);
            // Broadcast first; persistence is fire-and-forget and must never
            // delay delivery.
            self.hub_tx.send(HubCommand::Broadcast(msg.clone())).await.ok();
            self.pool.submit(msg);
        }

        self.hub_tx
            .send(HubCommand::Unregister {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
            })
            .await
            .ok();
        let _ = writer.await;

        info!(user_id = %user_id, room_id = %room_id, "chat client disconnected");
    }
}

/// Writer loop shared by both hubs: drain the mailbox onto the wire and
/// originate keepalive pings. Ends when the mailbox closes (a close frame is
/// sent first) or when any write fails or overruns its deadline.
pub(crate) async fn write_pump<S, T>(mut sink: S, mut rx: mpsc::Receiver<T>)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
    T: Serialize,
{
    let mut keepalive = interval(PING_INTERVAL);
    keepalive.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "failed to encode outbound message");
                            continue;
                        }
                    };
                    match timeout(WRITE_DEADLINE, sink.send(Message::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(error = %e, "websocket write error");
                            return;
                        }
                        Err(_) => {
                            debug!("write deadline expired");
                            return;
                        }
                    }
                }
                None => {
                    // Mailbox closed by the hub: say goodbye and stop.
                    let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = keepalive.tick() => {
                match timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new().into()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}
