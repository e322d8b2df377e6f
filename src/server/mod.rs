//! Control Server — HTTP front for operator commands
//!
//! A closed set of routes, each wired to a handler supplied by the caller
//! through [`ControlHandlers`]:
//!
//! | Route | Method | Handler |
//! |---|---|---|
//! | `/start` `/go` `/stop` `/reset` | GET | [`CommandFn`] |
//! | `/status` | GET | [`StatusFn`] |
//! | `/update-config` | POST | [`BodyFn`] |
//! | `/reset-config` | GET | [`ReplyFn`] |
//! | `/post` | POST | [`BodyFn`] |
//!
//! A route whose handler is `None` is not registered, so it answers 404.
//! Command replies are sent once the handler returns; they say the request
//! was dispatched, not that the downstream action worked.

pub mod middleware;

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::defaults;

pub type HandlerFuture<T> = BoxFuture<'static, T>;

/// Runs an operator command to completion.
pub type CommandFn = Arc<dyn Fn() -> HandlerFuture<()> + Send + Sync>;

/// Produces the `/status` document.
pub type StatusFn = Arc<dyn Fn() -> HandlerFuture<Value> + Send + Sync>;

/// Runs an action whose outcome decides the reply.
pub type ReplyFn = Arc<dyn Fn() -> HandlerFuture<HandlerReply> + Send + Sync>;

/// Consumes a request body and decides the reply.
pub type BodyFn = Arc<dyn Fn(Bytes) -> HandlerFuture<HandlerReply> + Send + Sync>;

/// Status code and JSON body chosen by a [`BodyFn`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerReply {
    pub status: StatusCode,
    pub body: Value,
}

impl HandlerReply {
    pub fn new(status: StatusCode, body: Value) -> Self {
        Self { status, body }
    }

    /// `{"message": ...}` with the given status.
    pub fn message(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, json!({ "message": message.into() }))
    }
}

impl IntoResponse for HandlerReply {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Handlers for every route the server knows. `None` leaves a route out.
#[derive(Clone, Default)]
pub struct ControlHandlers {
    pub start: Option<CommandFn>,
    pub go: Option<CommandFn>,
    pub stop: Option<CommandFn>,
    pub reset: Option<CommandFn>,
    pub status: Option<StatusFn>,
    pub update_config: Option<BodyFn>,
    pub reset_config: Option<ReplyFn>,
    pub post: Option<BodyFn>,
}

/// Box an async closure as a [`CommandFn`].
pub fn command<F, Fut>(f: F) -> CommandFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Box an async closure as a [`StatusFn`].
pub fn status<F, Fut>(f: F) -> StatusFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Box an async closure as a [`ReplyFn`].
pub fn reply<F, Fut>(f: F) -> ReplyFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerReply> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Box an async closure as a [`BodyFn`].
pub fn body<F, Fut>(f: F) -> BodyFn
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerReply> + Send + 'static,
{
    Arc::new(move |bytes| f(bytes).boxed())
}

impl ControlHandlers {
    /// `METHOD /path` of every route that will be registered.
    pub fn registered_routes(&self) -> Vec<&'static str> {
        let routes = [
            (self.start.is_some(), "GET /start"),
            (self.go.is_some(), "GET /go"),
            (self.stop.is_some(), "GET /stop"),
            (self.reset.is_some(), "GET /reset"),
            (self.status.is_some(), "GET /status"),
            (self.update_config.is_some(), "POST /update-config"),
            (self.reset_config.is_some(), "GET /reset-config"),
            (self.post.is_some(), "POST /post"),
        ];
        routes
            .into_iter()
            .filter_map(|(present, route)| present.then_some(route))
            .collect()
    }
}

fn command_route(router: Router, name: &'static str, handler: Option<CommandFn>) -> Router {
    let Some(handler) = handler else {
        return router;
    };
    router.route(
        &format!("/{name}"),
        get(move || {
            let handler = handler.clone();
            async move {
                handler().await;
                Json(json!({ "message": format!("Handled GET /{name}") }))
            }
        }),
    )
}

fn body_route(router: Router, path: &'static str, handler: Option<BodyFn>) -> Router {
    let Some(handler) = handler else {
        return router;
    };
    router.route(
        path,
        post(move |bytes: Bytes| {
            let handler = handler.clone();
            async move { handler(bytes).await }
        }),
    )
}

/// Build the control router from `handlers`.
pub fn router(handlers: ControlHandlers) -> Router {
    info!(
        "[ControlServer] Routes registered: {}",
        handlers.registered_routes().join(", ")
    );

    let mut router = Router::new();
    router = command_route(router, "start", handlers.start);
    router = command_route(router, "go", handlers.go);
    router = command_route(router, "stop", handlers.stop);
    router = command_route(router, "reset", handlers.reset);

    if let Some(status) = handlers.status {
        router = router.route(
            "/status",
            get(move || {
                let status = status.clone();
                async move { Json(status().await) }
            }),
        );
    }

    router = body_route(router, "/update-config", handlers.update_config);

    if let Some(reset_config) = handlers.reset_config {
        router = router.route(
            "/reset-config",
            get(move || {
                let reset_config = reset_config.clone();
                async move { reset_config().await }
            }),
        );
    }

    router = body_route(router, "/post", handlers.post);

    // CorsLayer answers the dashboard's preflight for JSON POSTs.
    // allow_any_origin is outermost and overwrites the origin header, so each
    // reply (404 fallback included) carries exactly one `*`.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    router
        .layer(DefaultBodyLimit::max(defaults::MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::allow_any_origin))
}
