//! Ping-pong over TCP loopback.
//!
//! Run with `RUST_LOG=debug cargo run --example ping_pong` to see the
//! connection logs.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use wirecall::{Client, Options, Server, Service, metrics_snapshot};

#[derive(Debug, Serialize, Deserialize)]
struct Ping {
    round: u32,
    sent_at_micros: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Pong {
    round: u32,
    sent_at_micros: u64,
    reply: String,
}

struct Echo;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("wirecall ping-pong");
    println!("==================\n");

    let server = Server::new();
    server.register(Service::new(Echo).method("Ping", |_: &Echo, ping: Ping| {
        Ok::<_, String>(Pong {
            round: ping.round,
            sent_at_micros: ping.sent_at_micros,
            reply: "pong".to_string(),
        })
    }))?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { server.accept(listener).await });

    let start = Instant::now();
    for codec in ["application/bincode", "application/json"] {
        let client = Client::dial(addr, Some(Options::with_codec(codec))).await?;
        for round in 0..3 {
            let ping = Ping {
                round,
                sent_at_micros: u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
            };
            let pong: Pong = client.call("Echo.Ping", &ping).await?;
            let rtt = start.elapsed() - Duration::from_micros(pong.sent_at_micros);
            println!("[{codec}] round {} -> {} in {rtt:?}", pong.round, pong.reply);
        }
        client.close().await?;
    }

    let metrics = metrics_snapshot();
    println!(
        "\ncalls sent: {}, responses: {}, served: {}",
        metrics.calls_sent, metrics.responses_received, metrics.requests_served
    );
    Ok(())
}
