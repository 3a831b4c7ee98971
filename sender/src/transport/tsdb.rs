use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::config::ConnectionConfig;
use crate::errors::TransportError;
use crate::model::ArchiveRecord;
use crate::transport::{ConnPool, Deliver};

/// Writes archive records as `put` lines. The store does not acknowledge writes, so a
/// batch counts as delivered once it is flushed to the socket.
#[derive(Clone, Debug)]
pub struct TsdbClient {
    pool: ConnPool,
}

impl TsdbClient {
    pub fn new(addr: impl Into<String>, config: &ConnectionConfig) -> Result<Self, TransportError> {
        Ok(Self {
            pool: ConnPool::new(addr, config)?,
        })
    }
}

#[async_trait]
impl Deliver<ArchiveRecord> for TsdbClient {
    async fn deliver(&self, batch: &[ArchiveRecord]) -> Result<(), TransportError> {
        let payload: String = batch.iter().map(ArchiveRecord::to_put_line).collect();

        let mut conn = self.pool.get().await?;
        conn.write_all(payload.as_bytes())
            .await
            .map_err(|e| self.pool.io_error(e))?;
        conn.flush().await.map_err(|e| self.pool.io_error(e))?;
        conn.mark_clean();
        Ok(())
    }

    fn destination(&self) -> &str {
        self.pool.addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::to_archive;
    use crate::testutils::{sample, start_line_server};

    #[tokio::test]
    async fn test_put_lines() {
        let (addr, mut lines) = start_line_server(|_| None).await;
        let client = TsdbClient::new(addr.to_string(), &ConnectionConfig::default()).unwrap();

        let mut tagged = sample("host1", "disk.used", 80.5);
        tagged.tags.insert("mount".into(), "/data".into());
        let batch = vec![to_archive(&sample("host1", "cpu.idle", 90.0)), to_archive(&tagged)];
        client.deliver(&batch).await.unwrap();

        assert_eq!(
            lines.recv().await.unwrap(),
            "put cpu.idle 1700000000 90 endpoint=host1"
        );
        assert_eq!(
            lines.recv().await.unwrap(),
            "put disk.used 1700000000 80.5 endpoint=host1 mount=/data"
        );
    }
}
