use crate::context::Context;
use crate::error::Error;
use crate::http::rewrite::Replacement;
use crate::http::{not_found, status, RequestTarget};
use crate::plugin::{Arguments, Handler, PluginLoader, ScriptRequest, INDEX_UNIT};
use crate::sandbox;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// The `handler` of an HTTP action. Unrecognised names produce a 404.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandlerName {
    Raw,
    #[default]
    Serve,
    Script,
    Forward,
    #[serde(other)]
    Unknown,
}

/// The action of an `http` descriptor, after per-request expansion.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct HttpAction {
    pub method: Option<String>,
    pub handler: HandlerName,
    pub code: Option<u16>,
    pub body: Option<String>,
    pub path: Option<String>,
    pub base: Option<String>,
    pub rewrite: Option<String>,
    pub destination: Option<String>,
    pub recreate_url: Option<bool>,
    pub request_headers: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub replace: Vec<Replacement>,
    #[serde(flatten)]
    pub arguments: Arguments,
}

impl HttpAction {
    fn code(&self) -> StatusCode {
        status(self.code.unwrap_or(200))
    }
}

pub(super) fn raw(action: &HttpAction) -> Response {
    (action.code(), action.body.clone().unwrap_or_default()).into_response()
}

/// Serve `action.path` from the files root, or run the plugin unit it names.
pub(super) async fn serve(
    context: &Context,
    request: Request<Body>,
    target: RequestTarget,
    action: &HttpAction,
) -> Response {
    let root = context.plugins.root();
    let Some(path) = action.path.as_deref() else {
        return not_found();
    };
    let lookup = {
        let root = root.to_path_buf();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let resolved = sandbox::contain(&root, &path)?;
            file_or_index(&root, resolved)
        })
    };
    let resolved = match lookup.await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => {
            debug!(path, "nothing to serve inside the files root");
            return not_found();
        }
        Err(err) => {
            error!(path, "unable to look up file: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if PluginLoader::is_unit(&resolved) {
        let unit = relative(root, &resolved);
        let residual = target.path().to_string();
        return run_unit(context, &unit, request, target, "/".into(), residual, &action.arguments)
            .await;
    }
    match tokio::fs::read(&resolved).await {
        Ok(contents) => (action.code(), contents).into_response(),
        Err(err) => {
            error!(path = %resolved.display(), "unable to read file: {err}");
            not_found()
        }
    }
}

/// `path` if it's a file, otherwise the nearest `index.plugin` in it or its ancestors below `root`.
fn file_or_index(root: &Path, path: PathBuf) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path);
    }
    let mut search = path;
    loop {
        let index = search.join(INDEX_UNIT);
        if index.is_file() {
            return Some(index);
        }
        if search == root || !search.pop() || !search.starts_with(root) {
            return None;
        }
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Run the plugin unit named by `action.path`, relocating the request path per `base` and
/// `rewrite`.
pub(super) async fn script(
    context: &Context,
    request: Request<Body>,
    target: RequestTarget,
    action: &HttpAction,
) -> Response {
    let Some(unit) = action.path.as_deref() else {
        error!("script action without a path");
        return not_found();
    };
    let request_path = target.path().to_string();

    let (base, mut residual) = match action.base.as_deref() {
        Some(base) => {
            let residual = match request_path.strip_prefix(base) {
                Some(rest) => format!("/{}", rest.trim_matches('/')),
                None => request_path.clone(),
            };
            (format!("/{}", base.trim_matches('/')), residual)
        }
        None => ("/".to_string(), request_path.clone()),
    };

    if let Some(rewrite) = action.rewrite.as_deref() {
        match Regex::new(rewrite) {
            Ok(pattern) => {
                if let Some(captures) = pattern.captures(&request_path) {
                    let rewritten = captures.get(1).or_else(|| captures.get(0));
                    residual = rewritten.map_or("", |m| m.as_str()).to_string();
                }
            }
            Err(err) => {
                error!(rewrite, "invalid rewrite pattern: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }
    if !residual.starts_with('/') {
        residual.insert(0, '/');
    }

    run_unit(context, unit, request, target, base, residual, &action.arguments).await
}

async fn run_unit(
    context: &Context,
    unit_path: &str,
    request: Request<Body>,
    target: RequestTarget,
    base: String,
    path: String,
    args: &Arguments,
) -> Response {
    let unit = match context.plugins.clone().load_async(unit_path.to_string()).await {
        Ok(unit) => unit,
        Err(err) => {
            error!(path = unit_path, "unable to load plugin unit: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let script_request = ScriptRequest {
        request,
        target,
        base,
        path,
    };
    let result = match unit.handler() {
        Some(Handler::App(app)) => app.call(script_request).await,
        Some(Handler::Resource(factory)) => match factory.get_resource(&script_request, args) {
            Ok(resource) => resource.render(script_request).await,
            Err(err) => Err(err),
        },
        Some(Handler::Record(_)) | None => Err(Error::MissingEntryPoint {
            path: unit.path().to_path_buf(),
            entry: "app or get_resource",
        }
        .into()),
    };
    result.unwrap_or_else(|err| {
        error!(path = %unit.path().display(), "unhandled error in plugin unit: {err:#}");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}
