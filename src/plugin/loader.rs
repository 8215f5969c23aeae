use crate::error::Error;
use crate::plugin::{Handler, HandlerKind, Plugin};
use crate::sandbox;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::debug;

/// File extension identifying plugin unit manifests.
pub const UNIT_EXTENSION: &str = "plugin";

/// Name of the unit the `serve` handler looks for in ancestor directories of a missing file.
pub const INDEX_UNIT: &str = "index.plugin";

/// Builds a plugin instance from a unit's `options`. The second argument is the files root.
pub type PluginFactory =
    Arc<dyn Fn(&Value, &Path) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync>;

/// Name to factory table for the plugins a unit manifest may refer to.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Value, &Path) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

#[derive(Deserialize)]
struct Manifest {
    plugin: String,
    #[serde(default)]
    options: Value,
}

/// A loaded plugin unit.
pub struct PluginUnit {
    path: PathBuf,
    name: String,
    mtime: SystemTime,
    plugin: Arc<dyn Plugin>,
    kind: Option<HandlerKind>,
}

impl PluginUnit {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The registered plugin name this unit instantiates.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    /// The request handling entry point, probed in the order app, resource, record.
    pub fn handler(&self) -> Option<Handler<'_>> {
        match self.kind? {
            HandlerKind::App => self.plugin.app().map(Handler::App),
            HandlerKind::Resource => self.plugin.resource().map(Handler::Resource),
            HandlerKind::Record => self.plugin.record().map(Handler::Record),
        }
    }
}

impl fmt::Debug for PluginUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginUnit")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Loads plugin units from below a sandbox root, caching them by absolute path until the
/// manifest's modification time advances.
pub struct PluginLoader {
    root: PathBuf,
    registry: PluginRegistry,
    cache: RwLock<HashMap<PathBuf, Arc<PluginUnit>>>,
}

impl PluginLoader {
    /// # Errors
    ///
    /// Returns [`Error::IO`] if `root` doesn't exist.
    pub fn new(root: impl AsRef<Path>, registry: PluginRegistry) -> Result<Self, Error> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
            registry,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// The canonical sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` names a plugin unit, by extension.
    pub fn is_unit(path: &Path) -> bool {
        path.extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case(UNIT_EXTENSION))
    }

    /// Load the unit at `path`, relative to the root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SandboxEscape`] if `path` resolves outside of the root, [`Error::IO`] or
    /// [`Error::InvalidJSON`] if the manifest can't be read, [`Error::UnknownPlugin`] if it names
    /// an unregistered plugin and [`Error::Plugin`] if the plugin factory fails.
    pub fn load(&self, path: &str) -> Result<Arc<PluginUnit>, Error> {
        let path = sandbox::contain(&self.root, path)
            .ok_or_else(|| Error::SandboxEscape(PathBuf::from(path)))?;
        let mtime = fs::metadata(&path)?.modified()?;

        if let Some(unit) = self.cached(&path) {
            if unit.mtime >= mtime {
                return Ok(unit);
            }
        }

        let manifest: Manifest = serde_json::from_slice(&fs::read(&path)?)?;
        let factory = self
            .registry
            .get(&manifest.plugin)
            .ok_or_else(|| Error::UnknownPlugin {
                name: manifest.plugin.clone(),
                path: path.clone(),
            })?;
        let plugin = factory(&manifest.options, &self.root).map_err(|source| Error::Plugin {
            path: path.clone(),
            source,
        })?;
        let unit = Arc::new(PluginUnit {
            kind: HandlerKind::probe(plugin.as_ref()),
            path: path.clone(),
            name: manifest.plugin,
            mtime,
            plugin,
        });
        debug!(path = %path.display(), plugin = %unit.name, "loaded plugin unit");

        // Only complete units are ever visible to other callers. A racing load of the same
        // version that finished first wins, so every caller shares one instance.
        let mut cache = match self.cache.write() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = cache.get(&path) {
            if existing.mtime >= mtime {
                return Ok(existing.clone());
            }
        }
        cache.insert(path, unit.clone());
        Ok(unit)
    }

    /// [`PluginLoader::load`] on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// As [`PluginLoader::load`], plus [`Error::Task`] if the blocking task fails.
    pub async fn load_async(self: Arc<Self>, path: String) -> Result<Arc<PluginUnit>, Error> {
        tokio::task::spawn_blocking(move || self.load(&path)).await?
    }

    fn cached(&self, path: &Path) -> Option<Arc<PluginUnit>> {
        let cache = match self.cache.read() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(path).cloned()
    }
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLoader")
            .field("root", &self.root)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Arguments, RecordSource};
    use std::fs::File;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use trust_dns_proto::rr::{DNSClass, RecordType};

    struct Fixed(Value);

    #[async_trait::async_trait]
    impl RecordSource for Fixed {
        async fn get_record(
            &self,
            _name: &str,
            _class: DNSClass,
            _rtype: RecordType,
            _args: &Arguments,
        ) -> anyhow::Result<Value> {
            Ok(self.0.clone())
        }
    }

    impl Plugin for Fixed {
        fn record(&self) -> Option<&dyn RecordSource> {
            Some(self)
        }
    }

    struct Inert;
    impl Plugin for Inert {}

    fn registry(built: Arc<AtomicUsize>) -> PluginRegistry {
        let mut registry = PluginRegistry::default();
        registry
            .register("fixed", move |options, _root| {
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Fixed(options.clone())))
            })
            .register("inert", |_, _| Ok(Arc::new(Inert)))
            .register("broken", |_, _| Err(anyhow::anyhow!("no")));
        registry
    }

    #[test]
    fn caches_until_mtime_advances() {
        let dir = TempDir::new().unwrap();
        let unit_path = dir.path().join("a.plugin");
        fs::write(&unit_path, r#"{"plugin": "fixed", "options": [1]}"#).unwrap();
        let built = Arc::new(AtomicUsize::new(0));
        let loader = PluginLoader::new(dir.path(), registry(built.clone())).unwrap();

        let first = loader.load("a.plugin").unwrap();
        let second = loader.load("/a.plugin").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(matches!(first.handler(), Some(Handler::Record(_))));
        assert_eq!(first.name(), "fixed");

        fs::write(&unit_path, r#"{"plugin": "fixed", "options": [2]}"#).unwrap();
        File::options()
            .write(true)
            .open(&unit_path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        let third = loader.load("a.plugin").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reports_load_failures() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("unknown.plugin"), r#"{"plugin": "nope"}"#).unwrap();
        fs::write(dir.path().join("broken.plugin"), r#"{"plugin": "broken"}"#).unwrap();
        fs::write(dir.path().join("invalid.plugin"), "{").unwrap();
        fs::write(dir.path().join("inert.plugin"), r#"{"plugin": "inert"}"#).unwrap();
        let loader =
            PluginLoader::new(dir.path(), registry(Arc::new(AtomicUsize::new(0)))).unwrap();

        assert!(matches!(
            loader.load("unknown.plugin"),
            Err(Error::UnknownPlugin { .. })
        ));
        assert!(matches!(loader.load("broken.plugin"), Err(Error::Plugin { .. })));
        assert!(matches!(loader.load("invalid.plugin"), Err(Error::InvalidJSON(_))));
        assert!(matches!(loader.load("missing.plugin"), Err(Error::IO(_))));
        assert!(loader.load("inert.plugin").unwrap().handler().is_none());
    }

    #[test]
    fn refuses_units_outside_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("files");
        fs::create_dir(&root).unwrap();
        fs::write(dir.path().join("outside.plugin"), r#"{"plugin": "inert"}"#).unwrap();
        let loader = PluginLoader::new(&root, registry(Arc::new(AtomicUsize::new(0)))).unwrap();

        assert!(matches!(
            loader.load("../outside.plugin"),
            Err(Error::SandboxEscape(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_share_one_unit() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.plugin"), r#"{"plugin": "fixed", "options": [1]}"#).unwrap();
        let built = Arc::new(AtomicUsize::new(0));
        let loader = Arc::new(PluginLoader::new(dir.path(), registry(built.clone())).unwrap());

        let mut loads = tokio::task::JoinSet::new();
        for _ in 0..16 {
            loads.spawn(loader.clone().load_async("a.plugin".into()));
        }
        let mut units = Vec::new();
        while let Some(unit) = loads.join_next().await {
            units.push(unit.unwrap().unwrap());
        }

        let cached = loader.load("a.plugin").unwrap();
        assert!(units.iter().all(|unit| Arc::ptr_eq(unit, &cached)));
        assert!(built.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn unit_extension() {
        assert!(PluginLoader::is_unit(Path::new("/x/index.plugin")));
        assert!(!PluginLoader::is_unit(Path::new("/x/index.html")));
    }
}
