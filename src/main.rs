use anyhow::{bail, Result};
use axum::http::Method;
use clap::{Parser, Subcommand};
use is_terminal::IsTerminal;
use ruleserv::dns::{DnsQuery, Resolver};
use ruleserv::error::Error::DNSError;
use ruleserv::http::{Dispatcher, RequestTarget};
use ruleserv::{Config, Context, Match, Service};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Rule driven DNS, HTTP and HTTPS server.
#[derive(Parser, Debug)]
#[command(name = "ruleserv", version, about)]
struct Cli {
    /// JSON config file. Without one, defaults apply and no services are configured.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the config's files root.
    #[arg(long)]
    files_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the configured services (the default).
    Serve,
    /// Show which descriptors would handle each URI, without serving anything.
    ///
    /// URIs are `http://...`, `https://...` or `dns://name?type=AAAA`; bare names are DNS
    /// queries.
    Route {
        #[arg(required = true)]
        uris: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::try_from_file(path)?;
            tracing::debug!("loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };
    if let Some(files_root) = cli.files_root {
        config.files_root = files_root;
    }
    let context = Context::new(Arc::new(config))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(context).await,
        Command::Route { uris } => route(&context, &uris),
    }
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(std::io::stdout().is_terminal()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ruleserv=info".into()),
        )
        .init();
}

async fn serve(context: Context) -> Result<()> {
    if context.config.services.is_empty() {
        bail!("no services configured, pass --config");
    }

    let reloads = context.store.clone().watch();
    let mut servers = JoinSet::new();
    for service in &context.config.services {
        match service {
            Service::Http(http) | Service::Https(http) => {
                let scheme = if http.tls_material().is_some() { "HTTPS" } else { "HTTP" };
                tracing::info!("{scheme} listening on {}", http.addr());
                servers.spawn(ruleserv::new_http(context.clone(), http).await?);
            }
            Service::Dns(dns) => {
                tracing::info!("DNS listening on UDP and TCP {}", dns.addr());
                let server = ruleserv::new_dns(context.clone(), dns).await?;
                servers.spawn(async move {
                    server
                        .block_until_done()
                        .await
                        .map_err(|err| anyhow::Error::from(DNSError(err)))
                });
            }
        }
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from signal");
        },
        Some(finished) = servers.join_next() => {
            finished??;
            tracing::info!("listener stopped");
        }
    }
    servers.shutdown().await;
    reloads.abort();
    tracing::info!("goodbye");
    Ok(())
}

fn route(context: &Context, uris: &[String]) -> Result<()> {
    for uri in uris {
        let (matched, middlewares) = if uri.starts_with("http://") || uri.starts_with("https://") {
            let target = RequestTarget::parse(Method::GET, uri)?;
            Dispatcher::new(context.clone()).select(&target)
        } else {
            let query = DnsQuery::from_uri(uri)?;
            Resolver::new(context.clone()).select(&query)
        };
        println!("{}", serde_json::to_string_pretty(&report(uri, matched, &middlewares))?);
    }
    Ok(())
}

fn report(uri: &str, matched: Option<Match>, middlewares: &[Match]) -> Value {
    json!({
        "uri": uri,
        "candidate": matched.as_ref().map(|m| m.candidate.clone()),
        "descriptor": matched.map(|m| m.descriptor.to_json()),
        "middlewares": middlewares.iter().map(|m| m.descriptor.to_json()).collect::<Vec<_>>(),
    })
}
