use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use sender::{CanonicalSample, Pipeline};
use serde::Serialize;
use shared::http::{BoxedBody, make_boxed_error_response, make_boxed_response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub const PUSH_PATH: &str = "/api/push";

#[derive(Serialize)]
struct PushResponse {
    received: usize,
}

/// Accepts batches of canonical samples on `POST /api/push`.
///
/// The reply only acknowledges receipt. Whatever happens to the samples afterwards
/// (drops, decimation, failed delivery) shows up in the counters, never here.
pub struct IngestService {
    pipeline: Arc<Pipeline>,
}

impl IngestService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

fn push(pipeline: &Pipeline, body: &Bytes) -> Response<BoxedBody> {
    let samples: Vec<CanonicalSample> = match serde_json::from_slice(body) {
        Ok(samples) => samples,
        Err(e) => {
            tracing::debug!(error = %e, "rejected push body");
            return make_boxed_error_response(StatusCode::BAD_REQUEST);
        }
    };

    pipeline.push(&samples);

    match serde_json::to_vec(&PushResponse {
        received: samples.len(),
    }) {
        Ok(body) => make_boxed_response(StatusCode::OK, "application/json", body),
        Err(_) => make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

impl Service<Request<Incoming>> for IngestService {
    type Response = Response<BoxedBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            if req.uri().path() != PUSH_PATH {
                return Ok(make_boxed_error_response(StatusCode::NOT_FOUND));
            }
            if req.method() != Method::POST {
                return Ok(make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED));
            }

            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    tracing::debug!(error = %e, "failed to read push body");
                    return Ok(make_boxed_error_response(StatusCode::BAD_REQUEST));
                }
            };
            Ok(push(&pipeline, &body))
        })
    }
}
