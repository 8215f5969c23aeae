use crate::context::Context;
use crate::error::Error;
use crate::http::forward::Forwarder;
use crate::http::handlers::{self, HandlerName, HttpAction};
use crate::http::{not_found, rewrite, Exchange, HttpNext, RequestTarget};
use crate::middleware;
use crate::store::{Descriptor, Match, Protocol};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

/// Turns HTTP requests into responses using the descriptor store.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    context: Context,
    forwarder: Forwarder,
}

impl Dispatcher {
    pub fn new(context: Context) -> Self {
        let forwarder = Forwarder::from_config(&context.config);
        Dispatcher { context, forwarder }
    }

    /// The descriptor that will handle `target` and the middleware that will wrap it.
    pub fn select(&self, target: &RequestTarget) -> (Option<Match>, Vec<Match>) {
        let store = &self.context.store;
        let candidates = target.candidates();
        let method = target.method.as_str();
        let matched = store
            .find(&candidates, |d| d.is(Protocol::Http))
            .find(|m| accepts(&m.descriptor, method));
        let middlewares = store
            .find(&candidates, |d| d.is(Protocol::HttpMiddleware))
            .collect();
        (matched, middlewares)
    }

    pub async fn dispatch(&self, request: Request<Body>, target: RequestTarget) -> Response {
        let (matched, middlewares) = self.select(&target);
        match &matched {
            Some(m) => debug!(
                url = %target.url(),
                candidate = %m.candidate,
                file = %m.descriptor.file.display(),
                "matched"
            ),
            None => debug!(url = %target.url(), "no matching descriptor"),
        }

        let dispatcher = self.clone();
        let terminal: HttpNext = Arc::new(move |exchange: Exchange| -> BoxFuture<'static, Response> {
            let dispatcher = dispatcher.clone();
            Box::pin(async move { dispatcher.handle(exchange).await })
        });
        let chain = middleware::compose_blocking(
            middlewares,
            self.context.plugins.clone(),
            |plugin, function| plugin.http_middleware(function),
            terminal,
        )
        .await;
        chain(Exchange {
            request,
            target,
            matched,
        })
        .await
    }

    async fn handle(&self, exchange: Exchange) -> Response {
        let Exchange {
            request,
            target,
            matched,
        } = exchange;
        let Some(matched) = matched else {
            return not_found();
        };
        let action = match self.action(&matched, &target) {
            Ok(Some(action)) => action,
            Ok(None) => return not_found(),
            Err(err) => {
                error!(file = %matched.descriptor.file.display(), "invalid http action: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let response = match action.handler {
            HandlerName::Raw => handlers::raw(&action),
            HandlerName::Serve => handlers::serve(&self.context, request, target.clone(), &action).await,
            HandlerName::Script => {
                handlers::script(&self.context, request, target.clone(), &action).await
            }
            HandlerName::Forward => self.forward(request, &target, &action).await,
            HandlerName::Unknown => not_found(),
        };
        rewrite::apply(response, &action.headers, &action.replace, &target)
    }

    /// The matched action with request placeholders and capture groups expanded. `replace` only
    /// gets `{{name}}` expansion, its `$N` belong to the replacement patterns.
    fn action(&self, matched: &Match, target: &RequestTarget) -> Result<Option<HttpAction>, Error> {
        let Some(action) = matched.descriptor.first_action::<Value>()? else {
            return Ok(None);
        };
        let mut variables = self.context.variables().with(target.variables());
        if let (Some(captures), Some(route)) = (matched.captures(), &matched.descriptor.route) {
            variables = variables.with_captures(&captures, route);
        }
        let action = match action {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        let v = if k == "replace" {
                            variables.expand_value(v)
                        } else {
                            variables.substitute_value(v)
                        };
                        (k, v)
                    })
                    .collect(),
            ),
            other => other,
        };
        Ok(Some(serde_json::from_value(action)?))
    }

    async fn forward(
        &self,
        request: Request<Body>,
        target: &RequestTarget,
        action: &HttpAction,
    ) -> Response {
        let Some(destination) = action.destination.as_deref() else {
            error!("forward action without a destination");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };
        match Forwarder::upstream_url(destination, target, action.recreate_url.unwrap_or(true)) {
            Ok(upstream) => {
                self.forwarder
                    .forward(request, upstream, &action.request_headers)
                    .await
            }
            Err(err) => {
                error!("{err}");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

/// Whether the descriptor's action accepts `method`. Descriptors without an action never handle
/// requests.
fn accepts(descriptor: &Descriptor, method: &str) -> bool {
    match descriptor.first_action::<Value>() {
        Ok(Some(Value::Object(action))) => action
            .get("method")
            .and_then(Value::as_str)
            .map_or(true, |m| m.eq_ignore_ascii_case(method)),
        Ok(_) => false,
        Err(err) => {
            error!(file = %descriptor.file.display(), "invalid http action: {err}");
            false
        }
    }
}
