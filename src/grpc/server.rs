//! Tonic server plumbing for `enforcer.v1.DecisionService`.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use tonic::body::BoxBody;
use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::{Request, Response, Status};

use super::proto::{CheckRequest, CheckResponse};

pub const SERVICE_NAME: &str = "enforcer.v1.DecisionService";
pub const CHECK_PATH: &str = "/enforcer.v1.DecisionService/Check";

/// Handler side of the decision RPC.
#[tonic::async_trait]
pub trait DecisionRpc: Send + Sync + 'static {
    async fn check(&self, request: Request<CheckRequest>) -> Result<Response<CheckResponse>, Status>;
}

/// Routes HTTP/2 requests to a [`DecisionRpc`] handler.
#[derive(Debug)]
pub struct DecisionRpcServer<T> {
    inner: Arc<T>,
}

impl<T> DecisionRpcServer<T> {
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T> Clone for DecisionRpcServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CheckSvc<T>(Arc<T>);

impl<T: DecisionRpc> UnaryService<CheckRequest> for CheckSvc<T> {
    type Response = CheckResponse;
    type Future = BoxFuture<Response<Self::Response>, Status>;

    fn call(&mut self, request: Request<CheckRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.check(request).await })
    }
}

impl<T, B> Service<http::Request<B>> for DecisionRpcServer<T>
where
    T: DecisionRpc,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            CHECK_PATH => {
                let method = CheckSvc(Arc::clone(&self.inner));
                Box::pin(async move {
                    let mut grpc = Grpc::new(tonic::codec::ProstCodec::default());
                    Ok(grpc.unary(method, req).await)
                })
            }
            _ => Box::pin(async move { Ok(unimplemented_response()) }),
        }
    }
}

impl<T> NamedService for DecisionRpcServer<T> {
    const NAME: &'static str = SERVICE_NAME;
}

fn unimplemented_response() -> http::Response<BoxBody> {
    let mut response = http::Response::new(tonic::codegen::empty_body());
    let headers = response.headers_mut();
    headers.insert(
        http::header::HeaderName::from_static("grpc-status"),
        http::HeaderValue::from(tonic::Code::Unimplemented as i32),
    );
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[tonic::async_trait]
    impl DecisionRpc for Echo {
        async fn check(&self, request: Request<CheckRequest>) -> Result<Response<CheckResponse>, Status> {
            Ok(Response::new(CheckResponse {
                correlation_id: request.into_inner().correlation_id,
                ..Default::default()
            }))
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let mut server = DecisionRpcServer::new(Echo);
        let request = http::Request::builder()
            .uri("/enforcer.v1.DecisionService/Nope")
            .body(tonic::codegen::empty_body())
            .unwrap();

        let response = server.call(request).await.unwrap();
        let status = response.headers().get("grpc-status").unwrap();
        assert_eq!(status.to_str().unwrap(), "12");
    }

    #[test]
    fn test_service_name() {
        assert_eq!(<DecisionRpcServer<Echo> as NamedService>::NAME, "enforcer.v1.DecisionService");
        assert!(CHECK_PATH.starts_with(&format!("/{SERVICE_NAME}/")));
    }
}
