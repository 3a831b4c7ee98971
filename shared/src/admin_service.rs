use crate::http::{BoxedBody, make_boxed_error_response, make_boxed_response};
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

/// Serves `/health`, `/ready` and `/stats`.
///
/// `is_ready` is evaluated per request. `stats` renders a JSON document that is
/// returned verbatim on `/stats`.
pub struct AdminService<R, S> {
    is_ready: R,
    stats: S,
}

impl<R, S> AdminService<R, S>
where
    R: Fn() -> bool,
    S: Fn() -> String,
{
    pub fn new(is_ready: R, stats: S) -> Self {
        Self { is_ready, stats }
    }

    fn respond(&self, path: &str) -> Response<BoxedBody> {
        match path {
            "/health" => make_boxed_response(StatusCode::OK, "text/plain", "ok\n"),
            "/ready" => match (self.is_ready)() {
                true => make_boxed_response(StatusCode::OK, "text/plain", "ok\n"),
                false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            "/stats" => make_boxed_response(StatusCode::OK, "application/json", (self.stats)()),
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl<R, S> Service<Request<Incoming>> for AdminService<R, S>
where
    R: Fn() -> bool,
    S: Fn() -> String,
{
    type Response = Response<BoxedBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}
