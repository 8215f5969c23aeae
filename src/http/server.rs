use crate::config::HttpService;
use crate::context::Context;
use crate::http::{Dispatcher, RequestTarget};
use crate::tls::{self, SniSelector};
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use futures::future::BoxFuture;
use hyper::server::conn::{AddrIncoming, Http};
use rustls::server::Acceptor;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::LazyConfigAcceptor;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// A running HTTP(S) listener.
pub type HttpServer = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Clone)]
struct ListenerState {
    dispatcher: Dispatcher,
    secure: bool,
    port: u16,
}

fn routes(state: ListenerState, timeout: Duration) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(timeout))
        .with_state(state)
}

async fn handle(State(state): State<ListenerState>, request: Request<Body>) -> Response {
    let target = RequestTarget::from_request(&request, state.secure, state.port);
    state.dispatcher.dispatch(request, target).await
}

/// Bind the service's listener. Services with a certificate are served over TLS, with the
/// certificate chosen per handshake by [`SniSelector`] once the ClientHello has been read.
///
/// # Errors
///
/// Fails if the address can't be bound or the TLS material can't be loaded.
pub async fn new(context: Context, service: &HttpService) -> anyhow::Result<HttpServer> {
    let timeout = context.config.http_timeout;
    let dispatcher = Dispatcher::new(context.clone());

    let Some((certificate, key)) = service.tls_material() else {
        let incoming = AddrIncoming::bind(&service.addr())?;
        let port = incoming.local_addr().port();
        let router = routes(
            ListenerState {
                dispatcher,
                secure: false,
                port,
            },
            timeout,
        );
        return Ok(Box::pin(async move {
            axum::Server::builder(incoming)
                .serve(router.into_make_service())
                .await?;
            Ok(())
        }));
    };

    let default = tls::load_certified_key(certificate, key)?;
    let selector = Arc::new(SniSelector::new(context, default));

    let listener = TcpListener::bind(service.addr()).await?;
    let port = listener.local_addr()?.port();
    let router = routes(
        ListenerState {
            dispatcher,
            secure: true,
            port,
        },
        timeout,
    );
    Ok(Box::pin(serve_tls(listener, selector, router)))
}

async fn serve_tls(
    listener: TcpListener,
    selector: Arc<SniSelector>,
    router: Router,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let selector = selector.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let start = match LazyConfigAcceptor::new(Acceptor::default(), stream).await {
                Ok(start) => start,
                Err(err) => {
                    debug!(%peer, "TLS handshake failed: {err}");
                    return;
                }
            };
            let server_name = start
                .client_hello()
                .server_name()
                .unwrap_or_default()
                .to_string();
            let config = selector.config(server_name).await;
            let stream = match start.into_stream(config).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%peer, "TLS handshake failed: {err}");
                    return;
                }
            };
            if let Err(err) = Http::new()
                .http1_only(true)
                .serve_connection(stream, router)
                .await
            {
                debug!(%peer, "error serving connection: {err}");
            }
        });
    }
}
