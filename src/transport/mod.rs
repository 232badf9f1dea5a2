//! Transport module - where the framed byte stream comes from.
//!
//! Two transports carry identical frames:
//! - [`Endpoint::Pipe`] - OS-local named stream (Unix domain socket or
//!   Windows named pipe), many clients per name
//! - [`Endpoint::Tcp`] - `host:port`
//!
//! Endpoints parse from `pipe://name` and `tcp://host:port`.
//!
//! # Example
//!
//! ```
//! use wirebus::Endpoint;
//!
//! let ep: Endpoint = "tcp://127.0.0.1:7000".parse().unwrap();
//! assert_eq!(ep, Endpoint::tcp("127.0.0.1:7000"));
//! assert_eq!(ep.to_string(), "tcp://127.0.0.1:7000");
//! ```

mod pipe;

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{BusError, Result};

pub use pipe::{dial_pipe, pipe_path, unique_pipe_name, PipeListener, PipeStream};

/// Where a bus listens or connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Named OS-local stream.
    Pipe(String),
    /// TCP `host:port`.
    Tcp(String),
}

impl Endpoint {
    /// Pipe endpoint.
    pub fn pipe(name: impl Into<String>) -> Self {
        Endpoint::Pipe(name.into())
    }

    /// TCP endpoint.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Endpoint::Tcp(addr.into())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Pipe(name) => write!(f, "pipe://{}", name),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

impl FromStr for Endpoint {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| BusError::Config(format!("endpoint {:?} has no scheme", s)))?;
        if rest.is_empty() {
            return Err(BusError::Config(format!("endpoint {:?} has no address", s)));
        }
        match scheme {
            "pipe" => Ok(Endpoint::Pipe(rest.to_string())),
            "tcp" => Ok(Endpoint::Tcp(rest.to_string())),
            other => Err(BusError::Config(format!("unknown endpoint scheme {:?}", other))),
        }
    }
}

/// Any byte stream a connection can run on.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport stream.
pub type BoxedStream = Box<dyn DuplexStream>;

/// A bound server endpoint.
pub enum Listener {
    Pipe(PipeListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind `endpoint`. A TCP port of 0 picks a free port.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Pipe(name) => Ok(Listener::Pipe(PipeListener::bind(name).await?)),
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr.as_str()).await?)),
        }
    }

    /// Wait for the next client. Returns the stream and a peer description.
    pub async fn accept(&mut self) -> Result<(BoxedStream, String)> {
        match self {
            Listener::Pipe(listener) => {
                let stream: BoxedStream = Box::new(listener.accept().await?);
                Ok((stream, format!("pipe://{}", listener.name())))
            }
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let stream: BoxedStream = Box::new(stream);
                Ok((stream, addr.to_string()))
            }
        }
    }

    /// The endpoint clients should dial, with any ephemeral port resolved.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Listener::Pipe(listener) => Ok(Endpoint::Pipe(listener.name().to_string())),
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
        }
    }
}

/// Open a stream to `endpoint`. One attempt, no retry.
pub async fn dial(endpoint: &Endpoint) -> Result<BoxedStream> {
    match endpoint {
        Endpoint::Pipe(name) => {
            let stream: BoxedStream = Box::new(dial_pipe(name).await?);
            Ok(stream)
        }
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str()).await?;
            stream.set_nodelay(true)?;
            let stream: BoxedStream = Box::new(stream);
            Ok(stream)
        }
    }
}
