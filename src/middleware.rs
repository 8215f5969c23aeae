//! Middleware composition.
//!
//! Middleware descriptors (`dns_middleware`, `http_middleware`, `ssl_middleware`) name a
//! function of a plugin unit, plus fixed arguments:
//!
//! ```json
//! { "protocol": "http_middleware", "action": { "module": "middleware/log.plugin", "function": "http_log" } }
//! ```
//!
//! Matching middleware descriptors, taken in store order, are folded around the terminal handler
//! of a front end so that the first listed runs outermost. A middleware receives the next handler
//! and decides whether, and with what request, to call it. Not calling it short-circuits
//! everything downstream.

use crate::plugin::{Arguments, Plugin, PluginLoader};
use crate::store::Match;
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

/// A handler in a middleware chain.
pub type Next<Q, R> = Arc<dyn Fn(Q) -> R + Send + Sync>;

/// A middleware function: called with the downstream handler, the request and the fixed
/// arguments of its descriptor.
pub type MiddlewareFn<Q, R> = Arc<dyn Fn(Next<Q, R>, Q, &Arguments) -> R + Send + Sync>;

#[derive(Deserialize, Debug, Default)]
struct MiddlewareAction {
    module: Option<String>,
    function: Option<String>,
    #[serde(flatten)]
    arguments: Arguments,
}

/// Wrap `terminal` in the middleware named by `middlewares`.
///
/// `pick` selects the protocol specific function from a loaded unit. Entries without `module` or
/// `function`, whose unit fails to load, or whose function doesn't exist are logged and skipped.
pub fn compose<Q, R, F>(
    middlewares: impl IntoIterator<Item = Match>,
    plugins: &PluginLoader,
    pick: F,
    terminal: Next<Q, R>,
) -> Next<Q, R>
where
    Q: 'static,
    R: 'static,
    F: Fn(&dyn Plugin, &str) -> Option<MiddlewareFn<Q, R>>,
{
    let middlewares: Vec<Match> = middlewares.into_iter().collect();
    let mut handler = terminal;
    for m in middlewares.iter().rev() {
        let file = m.descriptor.file.display();
        let action: MiddlewareAction = match m.descriptor.first_action() {
            Ok(Some(action)) => action,
            Ok(None) => MiddlewareAction::default(),
            Err(err) => {
                error!(%file, "invalid middleware action: {err}");
                continue;
            }
        };
        let Some(module) = action.module else {
            error!(%file, "no module name specified for middleware");
            continue;
        };
        let Some(function) = action.function else {
            error!(%file, module = %module, "no function name specified for middleware");
            continue;
        };
        let unit = match plugins.load(&module) {
            Ok(unit) => unit,
            Err(err) => {
                error!(module = %module, "unable to load middleware: {err}");
                continue;
            }
        };
        let Some(f) = pick(unit.plugin(), &function) else {
            error!(module = %module, function = %function, "middleware function does not exist");
            continue;
        };

        let next = handler;
        let arguments = Arc::new(action.arguments);
        handler = Arc::new(move |request: Q| f(next.clone(), request, &arguments));
    }
    handler
}

/// [`compose`] on the blocking thread pool, for async front ends. Loading units touches the
/// filesystem.
pub async fn compose_blocking<Q, R, F>(
    middlewares: Vec<Match>,
    plugins: Arc<PluginLoader>,
    pick: F,
    terminal: Next<Q, R>,
) -> Next<Q, R>
where
    Q: 'static,
    R: 'static,
    F: Fn(&dyn Plugin, &str) -> Option<MiddlewareFn<Q, R>> + Send + 'static,
{
    if middlewares.is_empty() {
        return terminal;
    }
    let fallback = terminal.clone();
    match tokio::task::spawn_blocking(move || compose(middlewares, &plugins, pick, terminal)).await
    {
        Ok(chain) => chain,
        Err(err) => {
            error!("unable to compose middleware: {err}");
            fallback
        }
    }
}
