//! Newline-delimited JSON-RPC client for the threshold and storage services.
//!
//! Requests are `{"method", "params": [batch], "id"}` objects, responses are
//! `{"id", "result", "error"}` objects, one per line in both directions. A non-null
//! `error`, or a result carrying a non-zero `code`, fails the call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::config::ConnectionConfig;
use crate::errors::TransportError;
use crate::transport::{ConnPool, Deliver};

pub const THRESHOLD_METHOD: &str = "Judge.Send";
pub const STORAGE_METHOD: &str = "Graph.Send";

#[derive(Serialize)]
struct Request<'a, P> {
    method: &'a str,
    params: [P; 1],
    id: u64,
}

#[derive(Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct RpcClient {
    method: &'static str,
    pool: ConnPool,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    pub fn new(
        method: &'static str,
        addr: impl Into<String>,
        config: &ConnectionConfig,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            method,
            pool: ConnPool::new(addr, config)?,
            next_id: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn call<P: Serialize>(&self, params: P) -> Result<(), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_vec(&Request {
            method: self.method,
            params: [params],
            id,
        })?;
        payload.push(b'\n');

        let mut conn = self.pool.get().await?;
        conn.write_all(&payload)
            .await
            .map_err(|e| self.pool.io_error(e))?;
        conn.flush().await.map_err(|e| self.pool.io_error(e))?;

        let mut line = String::new();
        let read = conn
            .read_line(&mut line)
            .await
            .map_err(|e| self.pool.io_error(e))?;
        if read == 0 {
            return Err(TransportError::Closed(self.pool.addr().to_string()));
        }

        let response: Response = serde_json::from_str(&line)?;
        if response.id != id {
            // Out of sync with the peer, drop the connection
            return Err(TransportError::Rpc {
                method: self.method.to_string(),
                message: format!("response id {} does not match request id {id}", response.id),
            });
        }

        conn.mark_clean();
        drop(conn);

        let message = match response.error {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(message)) => Some(message),
            Some(other) => Some(other.to_string()),
        };
        if let Some(message) = message {
            return Err(TransportError::Rpc {
                method: self.method.to_string(),
                message,
            });
        }

        let code = response
            .result
            .as_ref()
            .and_then(|result| result.get("code"))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or_default();
        if code != 0 {
            return Err(TransportError::Rpc {
                method: self.method.to_string(),
                message: format!("result code {code}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<R> Deliver<R> for RpcClient
where
    R: Serialize + Sync,
{
    async fn deliver(&self, batch: &[R]) -> Result<(), TransportError> {
        self.call(batch).await
    }

    fn destination(&self) -> &str {
        self.pool.addr()
    }
}
