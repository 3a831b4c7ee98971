//! Pooled TCP connections to one downstream address.
//!
//! A connection goes back to the pool only after a call marked it clean. On recycle,
//! connections that were abandoned mid-call or that the peer has closed in the meantime
//! are discarded, so a call never starts on a dead socket.

use deadpool::managed::{self, Manager, Metrics, RecycleError, RecycleResult};
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::ConnectionConfig;
use crate::errors::TransportError;

/// A buffered connection plus whether the last exchange on it completed.
#[derive(Debug)]
pub struct Conn {
    stream: BufStream<TcpStream>,
    clean: bool,
}

impl Conn {
    /// Marks the connection reusable. Calls are expected to invoke this once their
    /// request and response have been fully exchanged.
    pub fn mark_clean(&mut self) {
        self.clean = true;
    }

    /// Checks the socket without blocking: `Ok(())` if the peer has neither closed it
    /// nor sent anything unsolicited.
    fn check_idle(&self) -> Result<(), &'static str> {
        let mut buf = [0u8; 1];
        match self.stream.get_ref().try_read(&mut buf) {
            Ok(0) => Err("closed by peer"),
            Ok(_) => Err("unexpected data on idle connection"),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(_) => Err("socket error"),
        }
    }
}

impl Deref for Conn {
    type Target = BufStream<TcpStream>;

    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}

impl DerefMut for Conn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Any use of the stream leaves it dirty until the call completes
        self.clean = false;
        &mut self.stream
    }
}

/// Opens and health-checks connections for one address.
#[derive(Debug)]
pub struct TcpManager {
    addr: String,
    connect_timeout: Duration,
}

impl TcpManager {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }
}

impl Manager for TcpManager {
    type Type = Conn;
    type Error = TransportError;

    async fn create(&self) -> Result<Conn, TransportError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(io_error(&self.addr, source)),
            Err(_) => return Err(TransportError::Timeout(self.connect_timeout)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(addr = %self.addr, error = %e, "failed to set TCP_NODELAY");
        }
        tracing::debug!(addr = %self.addr, "opened connection");
        Ok(Conn {
            stream: BufStream::new(stream),
            clean: true,
        })
    }

    async fn recycle(&self, conn: &mut Conn, _metrics: &Metrics) -> RecycleResult<TransportError> {
        if !conn.clean {
            return Err(RecycleError::Message("abandoned mid-call".into()));
        }
        conn.check_idle().map_err(|reason| {
            tracing::debug!(addr = %self.addr, reason, "discarding idle connection");
            RecycleError::Message(reason.into())
        })
    }
}

pub type Pooled = managed::Object<TcpManager>;

/// Connection pool for one address, holding at most `max_idle` connections.
#[derive(Clone, Debug)]
pub struct ConnPool {
    addr: String,
    pool: managed::Pool<TcpManager>,
}

impl ConnPool {
    pub fn new(addr: impl Into<String>, config: &ConnectionConfig) -> Result<Self, TransportError> {
        let addr = addr.into();
        let manager = TcpManager::new(addr.clone(), config.connect_timeout());
        let pool = managed::Pool::builder(manager)
            .max_size(config.max_idle.max(1))
            .build()
            .map_err(|e| TransportError::Pool {
                addr: addr.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { addr, pool })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connections currently idle in the pool.
    pub fn idle_len(&self) -> usize {
        self.pool.status().available
    }

    /// Reuses a healthy idle connection or opens a new one. The connection returns to
    /// the pool when dropped.
    pub async fn get(&self) -> Result<Pooled, TransportError> {
        self.pool.get().await.map_err(|e| match e {
            managed::PoolError::Backend(e) => e,
            other => TransportError::Pool {
                addr: self.addr.clone(),
                message: other.to_string(),
            },
        })
    }

    pub fn io_error(&self, source: std::io::Error) -> TransportError {
        io_error(&self.addr, source)
    }
}

fn io_error(addr: &str, source: std::io::Error) -> TransportError {
    if source.kind() == ErrorKind::UnexpectedEof {
        return TransportError::Closed(addr.to_string());
    }
    TransportError::Io {
        addr: addr.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::start_line_server;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    fn pool(addr: std::net::SocketAddr, max_idle: usize) -> ConnPool {
        let config = ConnectionConfig {
            max_idle,
            ..Default::default()
        };
        ConnPool::new(addr.to_string(), &config).unwrap()
    }

    #[tokio::test]
    async fn test_clean_connection_is_reused() {
        let (addr, _lines) = start_line_server(|_| None).await;
        let pool = pool(addr, 8);

        let mut conn = pool.get().await.unwrap();
        conn.write_all(b"hello\n").await.unwrap();
        conn.flush().await.unwrap();
        conn.mark_clean();
        drop(conn);
        assert_eq!(pool.idle_len(), 1);

        let _conn = pool.get().await.unwrap();
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.pool.status().size, 1);
    }

    #[tokio::test]
    async fn test_dirty_connection_is_discarded() {
        let (addr, _lines) = start_line_server(|_| None).await;
        let pool = pool(addr, 8);

        let mut conn = pool.get().await.unwrap();
        conn.write_all(b"half a request").await.unwrap();
        drop(conn);

        // Recycling rejects it and a fresh connection is opened in its place
        let conn = pool.get().await.unwrap();
        assert!(conn.clean);
        assert_eq!(pool.pool.status().size, 1);
    }

    #[tokio::test]
    async fn test_connection_closed_by_peer_is_replaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, mut accepted) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Close every connection right away
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
                let _ = accepted_tx.send(());
            }
        });
        let pool = pool(addr, 8);

        let mut conn = pool.get().await.unwrap();
        conn.mark_clean();
        drop(conn);
        accepted.recv().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let _conn = pool.get().await.unwrap();
        accepted.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind and drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = pool(addr, 8).get().await.unwrap_err();
        assert!(matches!(err, TransportError::Io { .. }));
    }
}
