//! Broadcast - one server and two clients in a single process.
//!
//! Every endpoint subscribes to `Price`. Each published price reaches all
//! three subscribers exactly once, including the publisher's own.
//!
//! ```text
//! RUST_LOG=info cargo run --example broadcast
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wirebus::{Bus, BusBuilder, Endpoint};

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Price {
    symbol: String,
    cents: u64,
}

fn bus() -> BusBuilder {
    Bus::builder().message_as::<Price>("demo.price")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let lifetime = CancellationToken::new();
    let server = bus()
        .serve(&Endpoint::tcp("127.0.0.1:0"), &lifetime)
        .await?;
    let alice = bus().connect(server.local_endpoint(), &lifetime).await?;
    let bob = bus().connect(server.local_endpoint(), &lifetime).await?;

    let mut subscriptions = Vec::new();
    for (name, endpoint) in [("server", server.bus()), ("alice", alice.bus()), ("bob", bob.bus())] {
        subscriptions.push(endpoint.subscribe(&lifetime, move |price: Price| {
            println!("{name:>6} got {} at {}", price.symbol, price.cents);
        })?);
    }

    // Give the server a moment to register both connections.
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.publish(&Price {
        symbol: "ACME".to_string(),
        cents: 1250,
    })?;
    server.publish(&Price {
        symbol: "INITECH".to_string(),
        cents: 99,
    })?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Some(last) = bob.last::<Price>()? {
        println!("bob's last price: {} at {}", last.symbol, last.cents);
    }

    lifetime.cancel();
    Ok(())
}
