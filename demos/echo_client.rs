//! Echo client example.
//!
//! Run with: cargo run --example echo_client -- wss://echo.websocket.org/
//!
//! Sends a few messages to an echo server, prints what comes back and closes.
//! Set `RUST_LOG=rsws_engine=debug` to watch the engine work.

use std::error::Error;

use rsws_engine::{CloseCode, Config, DeflateConfig, Engine, Request, WebSocketEvent};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const DEFAULT_URL: &str = "wss://echo.websocket.org/";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let url = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_URL.to_string());
    let config = Config::default().with_compression(DeflateConfig::default());
    let engine = Engine::tcp(config);

    let (tx, mut events) = mpsc::unbounded_channel();
    engine.register(tx);
    engine.start(Request::new(&url)?.with_header("User-Agent", "rsws-engine-demo"))?;
    println!("Connecting to {url}");

    let messages = ["Hello", "WebSocket", "World"];
    let mut echoed = 0;
    while let Some(event) = events.recv().await {
        match event {
            WebSocketEvent::Connected(headers) => {
                println!("Connected (extensions: {:?})", headers.get("sec-websocket-extensions"));
                for message in messages {
                    engine.write_string(message).await?;
                    println!("Sent: {message}");
                }
                engine.write_ping("still there?").await?;
            }
            WebSocketEvent::Text(text) => {
                println!("Received: {text}");
                if messages.contains(&text.as_str()) {
                    echoed += 1;
                }
                if echoed == messages.len() {
                    engine.stop(CloseCode::Normal.as_u16());
                }
            }
            WebSocketEvent::Binary(data) => println!("Received {} bytes", data.len()),
            WebSocketEvent::Pong(data) => println!("Pong: {data:?}"),
            WebSocketEvent::Disconnected { reason, code } => {
                println!("Closed: {code} {reason:?}");
                break;
            }
            WebSocketEvent::Error(err) => {
                eprintln!("Failed ({}): {err}", err.kind());
                return Err(err.into());
            }
            WebSocketEvent::Cancelled => break,
            other => println!("{other:?}"),
        }
    }
    Ok(())
}
