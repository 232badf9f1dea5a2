//! OS-local named duplex streams.
//!
//! - Unix: Unix domain socket, bound under the temp directory unless the
//!   name already is a path
//! - Windows: named pipe `\\.\pipe\{name}`, one server instance per client
//!
//! # Example
//!
//! ```ignore
//! let mut listener = PipeListener::bind("orders").await?;
//! let stream = listener.accept().await?;
//! ```

use uuid::Uuid;

use crate::error::Result;

/// A unique pipe name for this process, for tests and demos.
///
/// Format: `{prefix}-{pid}-{random}`.
pub fn unique_pipe_name(prefix: &str) -> String {
    format!("{}-{}-{}", prefix, std::process::id(), Uuid::new_v4().simple())
}

/// OS path for a pipe name.
///
/// - Unix: `{temp_dir}/{name}.sock`, or `name` itself if it contains `/`
/// - Windows: `\\.\pipe\{name}`
pub fn pipe_path(name: &str) -> String {
    #[cfg(unix)]
    {
        if name.contains('/') {
            name.to_string()
        } else {
            std::env::temp_dir()
                .join(format!("{}.sock", name))
                .to_string_lossy()
                .into_owned()
        }
    }

    #[cfg(windows)]
    {
        if name.starts_with(r"\\") {
            name.to_string()
        } else {
            format!(r"\\.\pipe\{}", name)
        }
    }
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::io;
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix domain socket listener. Removes its socket file on drop,
    /// unless another listener has since taken over the path.
    pub struct PipeListener {
        listener: UnixListener,
        name: String,
        path: String,
        /// `(device, inode)` of the socket file this listener created.
        file_id: (u64, u64),
    }

    fn file_id(path: &str) -> io::Result<(u64, u64)> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok((meta.dev(), meta.ino()))
    }

    /// A connected pipe stream.
    pub type PipeStream = UnixStream;

    impl PipeListener {
        /// Bind to the socket for `name`, replacing a stale socket file.
        ///
        /// # Errors
        ///
        /// `AddrInUse` if a live listener still answers on the path.
        pub async fn bind(name: &str) -> Result<Self> {
            let path = pipe_path(name);
            if Path::new(&path).exists() {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("pipe {} is served by a live listener", path),
                    )
                    .into());
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let listener = UnixListener::bind(&path)?;
            let file_id = file_id(&path)?;
            Ok(Self {
                listener,
                name: name.to_string(),
                path,
                file_id,
            })
        }

        /// Wait for the next client.
        pub async fn accept(&mut self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }

        /// Name the listener was bound with.
        pub fn name(&self) -> &str {
            &self.name
        }

        /// Socket path on disk.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            if file_id(&self.path).ok() == Some(self.file_id) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    /// Connect to the pipe called `name`.
    pub async fn dial_pipe(name: &str) -> Result<PipeStream> {
        Ok(UnixStream::connect(pipe_path(name)).await?)
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// `ERROR_PIPE_BUSY`: every server instance is taken.
    const ERROR_PIPE_BUSY: i32 = 231;

    const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

    /// Named pipe listener. Always holds one unconnected instance so
    /// clients never see the name disappear between accepts.
    pub struct PipeListener {
        next: NamedPipeServer,
        name: String,
        path: String,
    }

    /// A connected pipe stream, server side.
    pub type PipeStream = NamedPipeServer;

    impl PipeListener {
        /// Create the first pipe instance for `name`.
        pub async fn bind(name: &str) -> Result<Self> {
            let path = pipe_path(name);
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&path)?;

            Ok(Self {
                next,
                name: name.to_string(),
                path,
            })
        }

        /// Wait for the next client.
        pub async fn accept(&mut self) -> Result<PipeStream> {
            self.next.connect().await?;
            let fresh = ServerOptions::new().create(&self.path)?;
            Ok(std::mem::replace(&mut self.next, fresh))
        }

        /// Name the listener was bound with.
        pub fn name(&self) -> &str {
            &self.name
        }

        /// Pipe path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    /// Connect to the pipe called `name`, waiting while all instances are busy.
    pub async fn dial_pipe(name: &str) -> Result<NamedPipeClient> {
        let path = pipe_path(name);
        loop {
            match ClientOptions::new().open(&path) {
                Ok(client) => return Ok(client),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(BUSY_RETRY_DELAY).await;
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{dial_pipe, PipeListener, PipeStream};

#[cfg(windows)]
pub use windows_impl::{dial_pipe, PipeListener, PipeStream};
