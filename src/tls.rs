//! Certificate selection for HTTPS listeners.
//!
//! Every TLS handshake runs the `ssl_middleware` descriptors whose route matches the SNI server
//! name (the empty string when the client sent none). A middleware may return a different
//! certificate without calling the next handler; otherwise the listener's configured certificate
//! is used. Selection happens after the ClientHello is read and before the handshake continues.

use crate::context::Context;
use crate::error::Error;
use crate::middleware::{self, MiddlewareFn, Next};
use crate::store::Protocol;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

pub type SslNext = Next<String, Arc<CertifiedKey>>;
pub type SslMiddleware = MiddlewareFn<String, Arc<CertifiedKey>>;

/// Load a PEM certificate chain and private key. `key` may be the same file as `certificate`.
///
/// # Errors
///
/// Returns [`Error::IO`] if either file can't be read and [`Error::Tls`] if no certificate or no
/// usable private key is found.
pub fn load_certified_key(certificate: &Path, key: &Path) -> Result<Arc<CertifiedKey>, Error> {
    let chain: Vec<Certificate> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(certificate)?))?
            .into_iter()
            .map(Certificate)
            .collect();
    if chain.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates in {}",
            certificate.display()
        )));
    }

    let private_key = rustls_pemfile::read_all(&mut BufReader::new(File::open(key)?))?
        .into_iter()
        .find_map(|item| match item {
            Item::RSAKey(der) | Item::PKCS8Key(der) | Item::ECKey(der) => Some(PrivateKey(der)),
            _ => None,
        })
        .ok_or_else(|| Error::Tls(format!("no private key in {}", key.display())))?;
    let signing_key = sign::any_supported_type(&private_key)
        .map_err(|err| Error::Tls(format!("{}: {err}", key.display())))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Chooses the certificate for each handshake by running the `ssl_middleware` chain.
pub struct SniSelector {
    context: Context,
    default: Arc<CertifiedKey>,
    default_config: Arc<ServerConfig>,
}

impl SniSelector {
    pub fn new(context: Context, default: Arc<CertifiedKey>) -> Self {
        let default_config = server_config(default.clone());
        SniSelector {
            context,
            default,
            default_config,
        }
    }

    /// The certificate for `server_name`. Middleware runs on the blocking thread pool since it
    /// may load units and PEM files.
    pub async fn select(&self, server_name: String) -> Arc<CertifiedKey> {
        let candidates = vec![server_name.clone()];
        let middlewares: Vec<_> = self
            .context
            .store
            .find(&candidates, |d| d.is(Protocol::SslMiddleware))
            .collect();
        if middlewares.is_empty() {
            return self.default.clone();
        }
        debug!(server_name, count = middlewares.len(), "running ssl middleware");

        let default = self.default.clone();
        let terminal: SslNext = Arc::new(move |_| default.clone());
        let plugins = self.context.plugins.clone();
        let chain = tokio::task::spawn_blocking(move || {
            let chain = middleware::compose(
                middlewares,
                &plugins,
                |plugin, function| plugin.ssl_middleware(function),
                terminal,
            );
            chain(server_name)
        });
        match chain.await {
            Ok(key) => key,
            Err(err) => {
                error!("ssl middleware failed: {err}");
                self.default.clone()
            }
        }
    }

    /// The server config to finish a handshake for `server_name` with.
    pub async fn config(&self, server_name: String) -> Arc<ServerConfig> {
        let key = self.select(server_name).await;
        if Arc::ptr_eq(&key, &self.default) {
            return self.default_config.clone();
        }
        server_config(key)
    }
}

impl fmt::Debug for SniSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniSelector").finish_non_exhaustive()
    }
}

struct Selected(Arc<CertifiedKey>);

impl ResolvesServerCert for Selected {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn server_config(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(Selected(key)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::plugin::{PluginLoader, PluginRegistry};
    use crate::store::{default_sort_key, RouteStore};
    use crate::template::Variables;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub(crate) fn testdata(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    #[test]
    fn loads_pem_material() {
        let key = load_certified_key(&testdata("default.pem"), &testdata("default.key")).unwrap();
        assert_eq!(key.cert.len(), 1);

        let dir = TempDir::new().unwrap();
        let combined = dir.path().join("combined.pem");
        let mut pem = fs::read_to_string(testdata("default.pem")).unwrap();
        pem.push_str(&fs::read_to_string(testdata("default.key")).unwrap());
        fs::write(&combined, pem).unwrap();
        assert!(load_certified_key(&combined, &combined).is_ok());
    }

    #[test]
    fn rejects_missing_material() {
        let cert = testdata("default.pem");
        assert!(matches!(
            load_certified_key(&cert, &cert),
            Err(Error::Tls(_))
        ));
        assert!(matches!(
            load_certified_key(&testdata("default.key"), &testdata("default.key")),
            Err(Error::Tls(_))
        ));
        assert!(matches!(
            load_certified_key(&testdata("missing.pem"), &cert),
            Err(Error::IO(_))
        ));
    }

    #[tokio::test]
    async fn middleware_selects_certificate_by_server_name() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("routes")).unwrap();
        fs::create_dir_all(root.join("certs")).unwrap();
        fs::copy(testdata("alt.pem"), root.join("certs/alt.pem")).unwrap();
        fs::copy(testdata("alt.key"), root.join("certs/alt.key")).unwrap();
        fs::write(
            root.join("certs/alt.plugin"),
            r#"{"plugin": "certificate", "options": {"certificate": "certs/alt.pem", "key": "certs/alt.key"}}"#,
        )
        .unwrap();
        fs::write(
            root.join("routes/ssl.json"),
            r#"[{"protocol": "ssl_middleware", "route": "^alt\\.example$",
                 "action": {"module": "certs/alt.plugin", "function": "select"}}]"#,
        )
        .unwrap();

        let store = RouteStore::load(
            vec![root.join("routes/*.json").to_string_lossy().into_owned()],
            Arc::new(Variables::default()),
            Arc::new(default_sort_key),
        )
        .unwrap();
        let plugins = PluginLoader::new(root, PluginRegistry::builtin()).unwrap();
        let context = Context::from_parts(
            Arc::new(Config::default()),
            Arc::new(store),
            Arc::new(plugins),
        );
        let default = load_certified_key(&testdata("default.pem"), &testdata("default.key")).unwrap();
        let alt = load_certified_key(&testdata("alt.pem"), &testdata("alt.key")).unwrap();
        let selector = SniSelector::new(context, default.clone());

        assert!(Arc::ptr_eq(&selector.select("default.example".into()).await, &default));
        assert!(Arc::ptr_eq(&selector.select(String::new()).await, &default));
        assert_eq!(selector.select("alt.example".into()).await.cert, alt.cert);
        assert!(Arc::ptr_eq(
            &selector.config("default.example".into()).await,
            &selector.config(String::new()).await
        ));
    }
}
