use std::{io, pin::Pin, task::{Context, Poll}, time::Duration};

use tokio::{io::{AsyncRead, AsyncWrite, ReadBuf}, net::TcpStream};

/// Anything a TLS upgrade may hand back in place of the raw socket.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send { }

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T { }

/// The remote endpoint of a session, kept for the cancel socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAddr {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: String },
}

impl RemoteAddr {
    /// Hosts starting with `/` are unix socket directories; the socket
    /// file name encodes the port.
    pub(crate) fn new(host: &str, port: u16) -> Self {
        #[cfg(unix)]
        if host.starts_with('/') {
            let dir = host.trim_end_matches('/');
            return Self::Unix { path: format!("{dir}/.s.PGSQL.{port}") };
        }
        Self::Tcp { host: host.to_string(), port }
    }
}

impl std::fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            #[cfg(unix)]
            Self::Unix { path } => f.write_str(path),
        }
    }
}

/// A TCP or Unix socket, possibly upgraded to TLS, which implements
/// `AsyncRead` and `AsyncWrite` transparently.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
    /// An upgraded stream returned by a TLS connector; also handy for
    /// in-memory test transports.
    Boxed(Box<dyn RawStream>),
}

impl Stream {
    /// Open a socket to `addr` under `timeout`.
    pub(crate) async fn connect(addr: &RemoteAddr, timeout: Duration) -> io::Result<Stream> {
        let connect = async {
            match addr {
                RemoteAddr::Tcp { host, port } => {
                    let socket = TcpStream::connect((host.as_str(), *port)).await?;
                    socket.set_nodelay(true)?;
                    Ok(Stream::Tcp(socket))
                }
                #[cfg(unix)]
                RemoteAddr::Unix { path } => {
                    let socket = tokio::net::UnixStream::connect(path).await?;
                    Ok(Stream::Unix(socket))
                }
            }
        };
        match tokio::time::timeout(timeout, connect).await {
            Ok(stream) => stream,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }

    /// Wrap an already-established transport.
    pub fn boxed(io: impl RawStream + 'static) -> Stream {
        Stream::Boxed(Box::new(io))
    }
}

macro_rules! delegate {
    ($self:ident, $inner:pat => $body:expr) => {
        match Pin::get_mut($self) {
            Stream::Tcp($inner) => $body,
            #[cfg(unix)]
            Stream::Unix($inner) => $body,
            Stream::Boxed($inner) => $body,
        }
    };
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Self::Unix(unix) => std::fmt::Debug::fmt(unix, f),
            Self::Boxed(_) => f.write_str("Stream::Boxed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_socket_dirs_map_to_socket_files() {
        #[cfg(unix)]
        assert_eq!(
            RemoteAddr::new("/run/postgresql", 5432),
            RemoteAddr::Unix { path: "/run/postgresql/.s.PGSQL.5432".into() },
        );
        assert_eq!(
            RemoteAddr::new("db.example.com", 5433),
            RemoteAddr::Tcp { host: "db.example.com".into(), port: 5433 },
        );
    }
}
