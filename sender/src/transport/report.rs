use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::errors::TransportError;
use crate::model::{ReportRecord, ReportResponse};
use crate::transport::Deliver;

/// Posts report envelopes to the external sink, one request per envelope.
#[derive(Clone, Debug)]
pub struct ReportClient {
    client: reqwest::Client,
    url: Url,
}

impl ReportClient {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    async fn post(&self, record: &ReportRecord) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(record)
            .send()
            .await?
            .error_for_status()?;

        let body: ReportResponse = response.json().await?;
        if body.result_code != 0 {
            return Err(TransportError::Rejected {
                code: body.result_code,
                message: body.result_msg,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Deliver<ReportRecord> for ReportClient {
    async fn deliver(&self, batch: &[ReportRecord]) -> Result<(), TransportError> {
        let mut failed = 0;
        let mut first_error = None;
        for record in batch {
            if let Err(e) = self.post(record).await {
                tracing::debug!(endpoint = %record.name, error = %e, "report rejected");
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) if failed == batch.len() => Err(e),
            Some(e) => Err(TransportError::Partial {
                failed,
                total: batch.len(),
                first: Box::new(e),
            }),
        }
    }

    fn destination(&self) -> &str {
        self.url.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EndpointType;
    use crate::testutils::start_http_server;
    use std::collections::BTreeMap;

    fn record(name: &str, value: f64) -> ReportRecord {
        ReportRecord {
            name: name.to_string(),
            endpoint_type: EndpointType::classify(name),
            timestamp: 1700000000000,
            data_list: BTreeMap::from([(
                "cpu".to_string(),
                BTreeMap::from([("-".to_string(), value)]),
            )]),
        }
    }

    fn client(addr: std::net::SocketAddr) -> ReportClient {
        let url = Url::parse(&format!("http://{addr}/api/receive")).unwrap();
        ReportClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_one_request_per_record() {
        let (addr, mut bodies) = start_http_server(|_| {
            serde_json::json!({"resultCode": 0, "resultMsg": "ok", "systemTime": "now"})
        })
        .await;
        let client = client(addr);

        client
            .deliver(&[record("db01", 1.0), record("sw-1-net", 2.0)])
            .await
            .unwrap();

        let first: serde_json::Value =
            serde_json::from_slice(&bodies.recv().await.unwrap()).unwrap();
        assert_eq!(
            first,
            serde_json::json!({
                "name": "db01",
                "type": "host",
                "timestamp": 1700000000000i64,
                "dataList": {"cpu": {"-": 1.0}},
            })
        );
        let second: serde_json::Value =
            serde_json::from_slice(&bodies.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "network");
    }

    #[tokio::test]
    async fn test_rejected_result_code() {
        let (addr, _bodies) = start_http_server(|_| {
            serde_json::json!({"resultCode": 3, "resultMsg": "bad data", "systemTime": "now"})
        })
        .await;

        let err = client(addr).deliver(&[record("db01", 1.0)]).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { code: 3, .. }));
        assert_eq!(err.records_lost(1), 1);
    }

    #[tokio::test]
    async fn test_partial_failure() {
        // Rejects every envelope for db02
        let (addr, _bodies) = start_http_server(|body| {
            let request: serde_json::Value = serde_json::from_slice(body).unwrap();
            let code = if request["name"] == "db02" { 1 } else { 0 };
            serde_json::json!({"resultCode": code, "resultMsg": "", "systemTime": ""})
        })
        .await;

        let batch = [record("db01", 1.0), record("db02", 2.0), record("db03", 3.0)];
        let err = client(addr).deliver(&batch).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Partial {
                failed: 1,
                total: 3,
                ..
            }
        ));
        assert_eq!(err.records_lost(batch.len()), 1);
    }
}
