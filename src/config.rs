use crate::error::Error;
use serde::Deserialize;
use serde_json::{Map, Value};
use serde_with::{serde_as, DurationSeconds};
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub type SharedConfig = Arc<Config>;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Sandbox root for served files and plugin units. Relative paths are resolved against the
    /// directory of the config file.
    pub files_root: PathBuf,
    /// Descriptor document globs, relative to `files_root`.
    pub routes: Vec<String>,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cache_invalidate_time: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub http_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub forward_timeout: Duration,
    pub forward_max_bytes: Option<usize>,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub script_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dns_tcp_timeout: Duration,
    pub services: Vec<Service>,
    pub variables: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            files_root: PathBuf::from("files"),
            routes: vec![
                "routes/**/*.json".to_string(),
                "scripts/**/*routes.json".to_string(),
            ],
            cache_invalidate_time: Duration::from_secs(60),
            http_timeout: Duration::from_secs(60),
            forward_timeout: Duration::from_secs(30),
            forward_max_bytes: None,
            script_timeout: Duration::from_secs(5),
            dns_tcp_timeout: Duration::from_secs(5),
            services: Vec::new(),
            variables: Map::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Service {
    Http(HttpService),
    /// Needs `certificate`.
    Https(HttpService),
    Dns(DnsService),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpService {
    pub port: u16,
    #[serde(default = "any_interface")]
    pub interface: IpAddr,
    /// PEM certificate chain. Enables TLS on this listener.
    pub certificate: Option<PathBuf>,
    /// PEM private key, read from `certificate` when absent.
    pub key: Option<PathBuf>,
}

impl HttpService {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }

    /// The certificate and key paths, if this is a TLS listener.
    pub fn tls_material(&self) -> Option<(&Path, &Path)> {
        let certificate = self.certificate.as_deref()?;
        Some((certificate, self.key.as_deref().unwrap_or(certificate)))
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DnsService {
    pub port: u16,
    #[serde(default = "any_interface")]
    pub interface: IpAddr,
}

impl DnsService {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }
}

fn any_interface() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Config {
    /// Load a config file. `files_root` and TLS material paths are made relative to the config
    /// file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IO`] or [`Error::InvalidJSON`] if the file can't be read or parsed
    /// (including unknown service protocols and fields), and [`Error::Config`] if no services
    /// are configured or an `https` service lacks a certificate.
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let p = p.as_ref();
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let mut conf: Config = serde_json::from_reader(reader)?;
        conf.relocate(p.parent().unwrap_or_else(|| Path::new("")));
        conf.validate()?;
        Ok(conf)
    }

    /// The configured descriptor globs, rooted at `files_root`.
    pub fn route_globs(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|g| self.files_root.join(g).to_string_lossy().into_owned())
            .collect()
    }

    fn relocate(&mut self, base: &Path) {
        self.files_root = base.join(&self.files_root);
        for service in &mut self.services {
            if let Service::Http(http) | Service::Https(http) = service {
                http.certificate = http.certificate.as_ref().map(|c| base.join(c));
                http.key = http.key.as_ref().map(|k| base.join(k));
            }
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.services.is_empty() {
            return Err(Error::Config("no services configured".to_string()));
        }
        for service in &self.services {
            match service {
                Service::Https(https) if https.certificate.is_none() => {
                    return Err(Error::Config(format!(
                        "https service on port {} has no certificate",
                        https.port
                    )));
                }
                Service::Http(http) if http.certificate.is_some() || http.key.is_some() => {
                    return Err(Error::Config(format!(
                        "http service on port {} has TLS material, use protocol https",
                        http.port
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_services_and_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            r#"{
                "files_root": "files",
                "forward_timeout": 3,
                "services": [
                    {"protocol": "http", "port": 8080},
                    {"protocol": "https", "port": 8443, "certificate": "ssl/cert.pem"},
                    {"protocol": "dns", "port": 5353, "interface": "127.0.0.1"}
                ],
                "variables": {"domain": "example.com", "count": 3}
            }"#,
        );
        let config = Config::try_from_file(&path).unwrap();

        assert_eq!(config.files_root, dir.path().join("files"));
        assert_eq!(config.forward_timeout, Duration::from_secs(3));
        assert_eq!(config.cache_invalidate_time, Duration::from_secs(60));
        assert_eq!(config.script_timeout, Duration::from_secs(5));
        assert_eq!(config.services.len(), 3);

        let Service::Http(plain) = &config.services[0] else {
            panic!("expected http service");
        };
        assert_eq!(plain.addr(), "0.0.0.0:8080".parse().unwrap());
        assert!(plain.tls_material().is_none());

        let Service::Https(tls) = &config.services[1] else {
            panic!("expected https service");
        };
        let cert = dir.path().join("ssl/cert.pem");
        assert_eq!(tls.tls_material(), Some((cert.as_path(), cert.as_path())));

        assert_eq!(
            config.services[2],
            Service::Dns(DnsService {
                port: 5353,
                interface: "127.0.0.1".parse().unwrap()
            })
        );
        assert_eq!(
            config.route_globs()[0],
            dir.path().join("files/routes/**/*.json").to_string_lossy()
        );
    }

    #[test]
    fn rejects_bad_services() {
        let dir = TempDir::new().unwrap();
        for contents in [
            r#"{"services": []}"#,
            r#"{"services": [{"protocol": "gopher", "port": 70}]}"#,
            r#"{"services": [{"protocol": "dns"}]}"#,
            r#"{"services": [{"protocol": "dns", "port": 53, "colour": "red"}]}"#,
        ] {
            let path = write(&dir, contents);
            assert!(Config::try_from_file(&path).is_err(), "{contents}");
        }
    }

    #[test]
    fn tls_material_must_match_protocol() {
        let dir = TempDir::new().unwrap();
        for contents in [
            r#"{"services": [{"protocol": "https", "port": 8443}]}"#,
            r#"{"services": [{"protocol": "https", "port": 8443, "key": "ssl/key.pem"}]}"#,
            r#"{"services": [{"protocol": "http", "port": 8080, "certificate": "ssl/cert.pem"}]}"#,
        ] {
            let path = write(&dir, contents);
            assert!(
                matches!(Config::try_from_file(&path), Err(Error::Config(_))),
                "{contents}"
            );
        }
    }
}
