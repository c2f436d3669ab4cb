//! Name-addressed local channels.
//!
//! Platform-specific implementations:
//! - **Linux**: abstract namespace sockets (no filesystem, auto-cleanup)
//! - **Other Unix**: filesystem sockets under `{temp_dir}/pipe-rpc/{name}.sock`
//! - **Windows**: named pipes `\\.\pipe\{name}`

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A connected duplex channel, split into independently owned halves.
pub struct PipeStream {
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl PipeStream {
    pub fn new(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self { reader, writer }
    }

    /// Wrap any duplex stream (used for in-memory channels in tests).
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(Box::new(reader), Box::new(writer))
    }

    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

fn check_name(name: &str) -> io::Result<()> {
    if name.trim().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "channel name must not be empty",
        ));
    }
    Ok(())
}

/// Server side of a named channel.
pub struct PipeListener {
    name: String,
    inner: imp::Listener,
}

impl PipeListener {
    /// Bind the channel. Must be called inside a tokio runtime.
    pub fn bind(name: &str) -> io::Result<Self> {
        check_name(name)?;
        let inner = imp::Listener::bind(name)?;
        tracing::debug!(channel = %name, "Bound channel");
        Ok(Self {
            name: name.to_string(),
            inner,
        })
    }

    pub async fn accept(&mut self) -> io::Result<PipeStream> {
        self.inner.accept().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Connect to a named channel, retrying while it is not yet available.
pub async fn connect(name: &str, timeout: Duration) -> io::Result<PipeStream> {
    check_name(name)?;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match imp::connect(name) {
            Ok(stream) => return Ok(stream),
            Err(e) if imp::is_not_ready(&e) && tokio::time::Instant::now() < deadline => {
                tracing::trace!(channel = %name, error = %e, "Channel not ready, retrying");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) if imp::is_not_ready(&e) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("could not connect to {name} within {timeout:?}: {e}"),
                ));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{
        SocketAddr, UnixListener as StdUnixListener, UnixStream as StdUnixStream,
    };

    use tokio::net::{UnixListener, UnixStream};

    use super::PipeStream;

    pub struct Listener {
        listener: UnixListener,
    }

    impl Listener {
        pub fn bind(name: &str) -> io::Result<Self> {
            let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
            let std_listener = StdUnixListener::bind_addr(&addr)?;
            std_listener.set_nonblocking(true)?;
            Ok(Self {
                listener: UnixListener::from_std(std_listener)?,
            })
        }

        pub async fn accept(&mut self) -> io::Result<PipeStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(split(stream))
        }
    }

    pub fn connect(name: &str) -> io::Result<PipeStream> {
        let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
        // tokio doesn't support abstract sockets directly
        let std_stream = StdUnixStream::connect_addr(&addr)?;
        std_stream.set_nonblocking(true)?;
        Ok(split(UnixStream::from_std(std_stream)?))
    }

    pub fn is_not_ready(e: &io::Error) -> bool {
        matches!(
            e.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        )
    }

    fn split(stream: UnixStream) -> PipeStream {
        let (read_half, write_half) = stream.into_split();
        PipeStream::new(Box::new(read_half), Box::new(write_half))
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod imp {
    use std::io;
    use std::path::PathBuf;

    use tokio::net::{UnixListener, UnixStream};

    use super::PipeStream;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join("pipe-rpc")
            .join(format!("{name}.sock"))
    }

    pub struct Listener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl Listener {
        pub fn bind(name: &str) -> io::Result<Self> {
            let path = socket_path(name);
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            tracing::trace!(path = %path.display(), "Bound socket");
            Ok(Self { listener, path })
        }

        pub async fn accept(&mut self) -> io::Result<PipeStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(split(stream))
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove socket file");
            }
        }
    }

    pub fn connect(name: &str) -> io::Result<PipeStream> {
        let std_stream = std::os::unix::net::UnixStream::connect(socket_path(name))?;
        std_stream.set_nonblocking(true)?;
        Ok(split(UnixStream::from_std(std_stream)?))
    }

    pub fn is_not_ready(e: &io::Error) -> bool {
        matches!(
            e.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        )
    }

    fn split(stream: UnixStream) -> PipeStream {
        let (read_half, write_half) = stream.into_split();
        PipeStream::new(Box::new(read_half), Box::new(write_half))
    }
}

#[cfg(windows)]
mod imp {
    use std::io;

    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    use super::PipeStream;

    const ERROR_PIPE_BUSY: i32 = 231;

    fn pipe_path(name: &str) -> String {
        format!(r"\\.\pipe\{name}")
    }

    pub struct Listener {
        path: String,
        next: NamedPipeServer,
    }

    impl Listener {
        pub fn bind(name: &str) -> io::Result<Self> {
            let path = pipe_path(name);
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&path)?;
            Ok(Self { path, next })
        }

        pub async fn accept(&mut self) -> io::Result<PipeStream> {
            self.next.connect().await?;
            // The next instance must exist before the connected one is handed
            // out, otherwise clients racing in would see "not found".
            let fresh = ServerOptions::new().create(&self.path)?;
            let connected = std::mem::replace(&mut self.next, fresh);
            Ok(PipeStream::from_io(connected))
        }
    }

    pub fn connect(name: &str) -> io::Result<PipeStream> {
        let client = ClientOptions::new().open(pipe_path(name))?;
        Ok(PipeStream::from_io(client))
    }

    pub fn is_not_ready(e: &io::Error) -> bool {
        e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(ERROR_PIPE_BUSY)
    }
}
