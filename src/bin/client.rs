use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use huddle::protocol::{ChatMessage, SignalingMessage};

#[derive(Parser)]
#[command(name = "client", about = "huddle line-mode demo client")]
struct Args {
    /// Server address (host:port)
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Room to join
    #[arg(long)]
    room: String,

    /// Authenticated user id (trusted by the gateway as-is)
    #[arg(long)]
    user_id: String,

    /// Display name
    #[arg(long)]
    username: String,

    /// Join the signaling endpoint instead of chat; stdin lines must then be
    /// JSON envelopes, e.g. {"type":"offer","target_id":"bob","data":{}}
    #[arg(long, default_value_t = false)]
    signaling: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let endpoint = if args.signaling { "signaling" } else { "ws" };
    let url = format!(
        "ws://{}/{}/joinRoom/{}?user_id={}&username={}",
        args.addr, endpoint, args.room, args.user_id, args.username
    );

    let (ws, _) = connect_async(&url).await.context("connecting to server")?;
    let (mut sink, mut stream) = ws.split();
    eprintln!("connected to {} (type a line to send, Ctrl-D to quit)", url);

    let printer = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Close(_)) | Err(_) => break,
                _ => continue,
            };
            print_frame(&text, args.signaling);
        }
        eprintln!("server closed the connection");
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        if sink.send(Message::Text(line.into())).await.is_err() {
            break;
        }
    }

    sink.send(Message::Close(None)).await.ok();
    printer.await.ok();
    Ok(())
}

fn print_frame(text: &str, signaling: bool) {
    if signaling {
        match serde_json::from_str::<SignalingMessage>(text) {
            Ok(msg) => println!("[{}] {} -> {}: {}", msg.msg_type, msg.sender_id, msg.target_id, msg.data),
            Err(_) => println!("{}", text),
        }
        return;
    }
    match serde_json::from_str::<ChatMessage>(text) {
        Ok(msg) => println!(
            "{} {}: {}",
            msg.created_at.format("%H:%M:%S"),
            msg.username,
            msg.content
        ),
        Err(_) => println!("{}", text),
    }
}
