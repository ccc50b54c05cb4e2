//! Request routing
//!
//! Maps method and path to an endpoint and produces the response for every
//! endpoint except the push stream, which the server hands to
//! [`EventStream`](crate::network::stream::EventStream) instead.

use crate::network::http::{Method, Request, Response, StatusCode};
use crate::network::hub::SubscriberHub;
use crate::usb::{DeviceRegistry, Operation, RegistryError};
use protocol::{BindRequest, OperationResponse, encode_snapshot};
use std::sync::Arc;
use tracing::{debug, warn};

const INDEX_HTML: &str = include_str!("../../assets/index.html");
const FAVICON_SVG: &str = include_str!("../../assets/favicon.svg");

/// Endpoints served by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Page,
    Favicon,
    Devices,
    Events,
    Mutate(Operation),
}

impl Route {
    /// Resolve a request target, or the error status to answer with
    pub fn resolve(method: Method, path: &str) -> Result<Route, StatusCode> {
        let (route, allowed): (Route, &[Method]) = match path {
            "/" | "/index.html" => (Route::Page, &[Method::Get, Method::Head]),
            "/favicon.ico" => (Route::Favicon, &[Method::Get, Method::Head]),
            "/api/devices" => (Route::Devices, &[Method::Get, Method::Head]),
            "/events" => (Route::Events, &[Method::Get]),
            "/bind" => (Route::Mutate(Operation::Bind), &[Method::Post]),
            "/unbind" => (Route::Mutate(Operation::Unbind), &[Method::Post]),
            _ => return Err(StatusCode::NotFound),
        };
        if allowed.contains(&method) {
            Ok(route)
        } else {
            Err(StatusCode::MethodNotAllowed)
        }
    }
}

/// Structured error body for a status with no better message
pub fn error_response(status: StatusCode) -> Response {
    let response = Response::json(status, &OperationResponse::failed(status.reason()));
    if status == StatusCode::MethodNotAllowed {
        response.with_header("Allow", "GET, HEAD, POST")
    } else {
        response
    }
}

pub struct Router {
    registry: Arc<DeviceRegistry>,
    hub: Arc<SubscriberHub>,
}

impl Router {
    pub fn new(registry: Arc<DeviceRegistry>, hub: Arc<SubscriberHub>) -> Self {
        Self { registry, hub }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &SubscriberHub {
        &self.hub
    }

    /// Produce the response for a non-stream route
    pub async fn respond(&self, route: Route, request: &Request) -> Response {
        let head_only = request.method == Method::Head;
        match route {
            Route::Page => Response::new(StatusCode::Ok, "text/html; charset=utf-8", INDEX_HTML)
                .with_header("Cache-Control", "no-cache")
                .head_only(head_only),
            Route::Favicon => Response::new(StatusCode::Ok, "image/svg+xml", FAVICON_SVG)
                .with_header("Cache-Control", "public, max-age=86400")
                .head_only(head_only),
            Route::Devices => self.devices().await.head_only(head_only),
            Route::Mutate(op) => self.mutate(op, &request.body).await,
            Route::Events => {
                warn!("Stream route reached the plain responder");
                error_response(StatusCode::InternalServerError)
            }
        }
    }

    async fn devices(&self) -> Response {
        let snapshot = self.registry.snapshot().await;
        match encode_snapshot(&snapshot) {
            Ok(json) => Response::new(StatusCode::Ok, "application/json", json)
                .with_header("Cache-Control", "no-cache"),
            Err(e) => {
                warn!("Failed to encode device list: {}", e);
                error_response(StatusCode::InternalServerError)
            }
        }
    }

    async fn mutate(&self, op: Operation, body: &[u8]) -> Response {
        let request: BindRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejected {} body: {}", op, e);
                return Response::json(
                    StatusCode::BadRequest,
                    &OperationResponse::failed("request body must be {\"busid\":\"<id>\"}"),
                );
            }
        };

        let result = match op {
            Operation::Bind => self.registry.bind(&request.busid).await,
            Operation::Unbind => self.registry.unbind(&request.busid).await,
        };

        match result {
            Ok(snapshot) => {
                // Pushed before the response so both carry the same snapshot
                self.hub.broadcast_snapshot(&snapshot).await;
                Response::json(StatusCode::Ok, &OperationResponse::success())
            }
            Err(e @ RegistryError::Validation(_)) => {
                Response::json(StatusCode::BadRequest, &OperationResponse::failed(e.to_string()))
            }
            Err(RegistryError::Execution { message }) => Response::json(
                StatusCode::InternalServerError,
                &OperationResponse::failed(message),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_routes() {
        assert_eq!(Route::resolve(Method::Get, "/"), Ok(Route::Page));
        assert_eq!(Route::resolve(Method::Head, "/"), Ok(Route::Page));
        assert_eq!(Route::resolve(Method::Head, "/favicon.ico"), Ok(Route::Favicon));
        assert_eq!(Route::resolve(Method::Get, "/api/devices"), Ok(Route::Devices));
        assert_eq!(Route::resolve(Method::Get, "/events"), Ok(Route::Events));
        assert_eq!(
            Route::resolve(Method::Post, "/bind"),
            Ok(Route::Mutate(Operation::Bind))
        );
        assert_eq!(
            Route::resolve(Method::Post, "/unbind"),
            Ok(Route::Mutate(Operation::Unbind))
        );
    }

    #[test]
    fn test_resolve_errors() {
        assert_eq!(
            Route::resolve(Method::Get, "/nope"),
            Err(StatusCode::NotFound)
        );
        assert_eq!(
            Route::resolve(Method::Get, "/bind"),
            Err(StatusCode::MethodNotAllowed)
        );
        assert_eq!(
            Route::resolve(Method::Post, "/api/devices"),
            Err(StatusCode::MethodNotAllowed)
        );
        assert_eq!(
            Route::resolve(Method::Head, "/events"),
            Err(StatusCode::MethodNotAllowed)
        );
    }

    #[test]
    fn test_error_response_is_json() {
        let resp = error_response(StatusCode::MethodNotAllowed);
        assert_eq!(resp.content_type, "application/json");
        assert_eq!(
            resp.body,
            br#"{"status":"failed","error":"Method Not Allowed"}"#.to_vec()
        );
        assert!(resp.headers.iter().any(|(name, _)| *name == "Allow"));
    }
}
