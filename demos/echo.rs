//! Echo - request/response between two processes.
//!
//! Start the server, then ask it something from another terminal:
//!
//! ```text
//! cargo run --example echo -- serve
//! cargo run --example echo -- ask "hello there"
//! ```
//!
//! An optional third argument picks the endpoint, e.g. `tcp://127.0.0.1:7070`.
//! Set `RUST_LOG=wirebus=debug` to watch the traffic.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wirebus::{Bus, BusBuilder, Endpoint, MessageContext};

#[derive(Serialize, Deserialize, Debug)]
struct EchoRequest {
    message: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct EchoReply {
    echo: String,
    served_remotely: bool,
}

fn bus() -> BusBuilder {
    Bus::builder()
        .message_as::<EchoRequest>("demo.echo")
        .message_as::<EchoReply>("demo.echo.reply")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = args.first().map(String::as_str).unwrap_or("serve");
    let endpoint: Endpoint = args
        .get(2)
        .map(String::as_str)
        .unwrap_or("pipe://wirebus-echo")
        .parse()?;
    let lifetime = CancellationToken::new();

    match mode {
        "serve" => {
            let server = bus().serve(&endpoint, &lifetime).await?;
            let _handler = server.register_handler(
                &lifetime,
                |req: EchoRequest, ctx: MessageContext| async move {
                    Ok::<_, wirebus::BusError>(EchoReply {
                        echo: req.message,
                        served_remotely: ctx.is_remote(),
                    })
                },
            )?;
            println!("serving echo on {}", server.local_endpoint());

            tokio::signal::ctrl_c().await?;
            server.shutdown();
        }
        "ask" => {
            let message = args.get(1).cloned().unwrap_or_else(|| "ping".to_string());
            let client = bus().connect(&endpoint, &lifetime).await?;
            let reply: EchoReply = client
                .try_request(&EchoRequest { message }, Duration::from_secs(5), &lifetime)
                .await?;
            println!("{:?}", reply);
        }
        other => return Err(format!("unknown mode {other:?}, expected serve or ask").into()),
    }

    Ok(())
}
