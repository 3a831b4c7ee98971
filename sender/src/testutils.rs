use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::model::{CanonicalSample, GAUGE};

pub fn sample(endpoint: &str, metric: &str, value: f64) -> CanonicalSample {
    sample_with(endpoint, metric, value, 60, GAUGE)
}

pub fn sample_with(
    endpoint: &str,
    metric: &str,
    value: f64,
    step: i64,
    counter_type: &str,
) -> CanonicalSample {
    CanonicalSample {
        endpoint: endpoint.to_string(),
        metric: metric.to_string(),
        value,
        timestamp: 1700000000,
        step,
        counter_type: counter_type.to_string(),
        tags: BTreeMap::new(),
    }
}

/// Line-oriented TCP server on an ephemeral port.
///
/// Every received line is forwarded to the returned channel. When `respond` returns a
/// reply, it is written back followed by a newline.
pub async fn start_line_server<F>(respond: F) -> (SocketAddr, mpsc::UnboundedReceiver<String>)
where
    F: Fn(&str) -> Option<String> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let respond = respond.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply = respond(&line);
                    let _ = tx.send(line);
                    if let Some(mut reply) = reply {
                        reply.push('\n');
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    (addr, rx)
}

/// Answers Go-style JSON-RPC requests with an empty result, echoing the request id.
pub fn rpc_ok(line: &str) -> Option<String> {
    let request: serde_json::Value = serde_json::from_str(line).ok()?;
    Some(
        serde_json::json!({
            "id": request["id"],
            "result": {"code": 0},
            "error": null,
        })
        .to_string(),
    )
}

/// HTTP server on an ephemeral port. Request bodies go to the returned channel and
/// `respond` produces the JSON response body.
pub async fn start_http_server<F>(respond: F) -> (SocketAddr, mpsc::UnboundedReceiver<Bytes>)
where
    F: Fn(&Bytes) -> serde_json::Value + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let io = TokioIo::new(stream);
            let respond = respond.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let respond = respond.clone();
                    let tx = tx.clone();
                    async move {
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let reply = respond(&body);
                        let _ = tx.send(body);
                        let json = serde_json::to_vec(&reply).unwrap();
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(json))))
                    }
                });

                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    (addr, rx)
}
