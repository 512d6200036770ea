//! Outbound request rewriting for replaying captured traffic through the
//! proxy instead of the real origin.

use axum::http::uri::{Authority, InvalidUri, PathAndQuery, Scheme};
use axum::http::{Request, Uri};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Wraps an HTTP client service. Requests whose authority contains the
/// monitored origin are sent to `redirect` over plain http; all others pass
/// through untouched.
#[derive(Debug, Clone)]
pub struct RewriteTransport<S> {
    inner: S,
    origin: String,
    redirect: Authority,
}

impl<S> RewriteTransport<S> {
    pub fn new(inner: S, origin: impl Into<String>, redirect: &str) -> Result<Self, InvalidUri> {
        Ok(Self {
            inner,
            origin: origin.into(),
            redirect: redirect.parse()?,
        })
    }

    fn matches<B>(&self, req: &Request<B>) -> bool {
        !self.origin.is_empty()
            && req
                .uri()
                .authority()
                .is_some_and(|a| a.as_str().contains(self.origin.as_str()))
    }

    fn rewrite<B>(&self, req: Request<B>) -> Request<B> {
        if !self.matches(&req) {
            return req;
        }

        let (mut parts, body) = req.into_parts();
        let original = parts.uri.clone();

        let mut uri = original.clone().into_parts();
        uri.scheme = Some(Scheme::HTTP);
        uri.authority = Some(self.redirect.clone());
        if uri.path_and_query.is_none() {
            uri.path_and_query = Some(PathAndQuery::from_static("/"));
        }

        match Uri::from_parts(uri) {
            Ok(rewritten) => {
                tracing::info!(from = %original, to = %rewritten, "redirecting request");
                parts.uri = rewritten;
            }
            Err(e) => tracing::warn!(uri = %original, error = %e, "could not redirect request"),
        }
        Request::from_parts(parts, body)
    }
}

impl<S, B> Service<Request<B>> for RewriteTransport<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let req = self.rewrite(req);
        self.inner.call(req)
    }
}

/// Applies [`RewriteTransport`] to a client service.
#[derive(Debug, Clone)]
pub struct RewriteLayer {
    origin: String,
    redirect: Authority,
}

impl RewriteLayer {
    pub fn new(origin: impl Into<String>, redirect: &str) -> Result<Self, InvalidUri> {
        Ok(Self {
            origin: origin.into(),
            redirect: redirect.parse()?,
        })
    }
}

impl<S> Layer<S> for RewriteLayer {
    type Service = RewriteTransport<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RewriteTransport {
            inner,
            origin: self.origin.clone(),
            redirect: self.redirect.clone(),
        }
    }
}
