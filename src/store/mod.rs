//! Descriptor storage.
//!
//! A [`RouteStore`] watches a set of glob patterns for JSON descriptor documents. Each document
//! is an array of objects:
//!
//! ```json
//! [
//!   { "protocol": "dns", "route": "^a\\.example\\.com$", "action": { "response": "{{ipv4_address}}" } },
//!   { "protocol": "http", "route": "^/raw$", "action": { "handler": "raw", "code": 202, "body": "OK" } }
//! ]
//! ```
//!
//! Lookups only ever read the current snapshot. Re-scanning is explicit ([`RouteStore::refresh`],
//! [`RouteStore::reload`]) or done by the background task from [`RouteStore::watch`], once per
//! invalidation interval, and re-reads only the documents whose modification time advanced. Documents from every source are merged into one list ordered
//! by `sort_index` (stable, so ties keep encounter order). A descriptor without an explicit
//! `sort_index` inherits one from its file name, see [`default_sort_key`].
//!
//! A document that fails to parse is logged and its previous version (if any) stays in effect.

mod descriptor;

pub use descriptor::{Descriptor, Match, Protocol};

use crate::error::Error;
use crate::template::SharedVariables;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Maps a document path to the `sort_index` of descriptors that don't specify one.
pub type SortKeyFn = Arc<dyn Fn(&Path) -> i64 + Send + Sync>;

/// An ordered, immutable view of every loaded descriptor.
pub type Snapshot = Arc<[Arc<Descriptor>]>;

pub const DEFAULT_INVALIDATE_TIME: Duration = Duration::from_secs(60);

/// Shortest period between background re-scans.
pub const MIN_WATCH_PERIOD: Duration = Duration::from_millis(100);

lazy_static! {
    static ref LEADING_DIGITS: Regex = Regex::new("^[0-9]+").unwrap();
}

/// `default*` files sort at 100, files with a numeric prefix sort at that number, and everything
/// else at 99.
pub fn default_sort_key(path: &Path) -> i64 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    if name.starts_with("default") {
        return 100;
    }
    LEADING_DIGITS
        .find(&name)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(99)
}

struct Document {
    mtime: SystemTime,
    descriptors: Vec<Arc<Descriptor>>,
}

#[derive(Default)]
struct ReloadState {
    checked: Option<Instant>,
    documents: Vec<Document>,
    positions: HashMap<PathBuf, usize>,
}

/// The descriptor store. Shared by every front end.
pub struct RouteStore {
    globs: Vec<String>,
    variables: SharedVariables,
    sort_key: SortKeyFn,
    invalidate_time: Duration,
    state: Mutex<ReloadState>,
    snapshot: RwLock<Snapshot>,
}

impl RouteStore {
    /// Create a store over `globs` and perform the initial load.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGlob`] if any of `globs` isn't a valid pattern. Unreadable or
    /// invalid documents are not an error, they are logged and skipped.
    pub fn load(
        globs: Vec<String>,
        variables: SharedVariables,
        sort_key: SortKeyFn,
    ) -> Result<Self, Error> {
        for g in &globs {
            glob::Pattern::new(g)?;
        }
        let store = RouteStore {
            globs,
            variables,
            sort_key,
            invalidate_time: DEFAULT_INVALIDATE_TIME,
            state: Mutex::new(ReloadState::default()),
            snapshot: RwLock::new(Arc::from(Vec::new())),
        };
        store.reload();
        Ok(store)
    }

    /// Set how long a reload result stays authoritative before modification times are checked
    /// again.
    #[must_use]
    pub fn with_invalidate_time(mut self, invalidate_time: Duration) -> Self {
        self.invalidate_time = invalidate_time;
        self
    }

    pub fn variables(&self) -> &SharedVariables {
        &self.variables
    }

    /// The current ordered descriptor list. Never touches the filesystem.
    pub fn descriptors(&self) -> Snapshot {
        self.current()
    }

    /// Lazily yield, in store order, every descriptor accepted by `predicate` whose `route`
    /// matches one of `candidates`. Each descriptor is yielded at most once, paired with the
    /// first candidate (in the given priority order) that matched it.
    pub fn find<'c, P>(&self, candidates: &'c [String], predicate: P) -> Matches<'c, P>
    where
        P: Fn(&Descriptor) -> bool,
    {
        Matches {
            snapshot: self.descriptors(),
            position: 0,
            candidates,
            predicate,
        }
    }

    /// The first result of [`RouteStore::find`].
    pub fn first<P>(&self, candidates: &[String], predicate: P) -> Option<Match>
    where
        P: Fn(&Descriptor) -> bool,
    {
        self.find(candidates, predicate).next()
    }

    fn current(&self) -> Snapshot {
        match self.snapshot.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-scan the sources if the invalidation interval has passed since the last scan. Blocks
    /// on filesystem reads.
    pub fn refresh(&self) {
        self.rescan(false);
    }

    /// Re-scan the sources now. Blocks on filesystem reads. Returns immediately if another scan
    /// is in progress.
    pub fn reload(&self) {
        self.rescan(true);
    }

    /// Keep the store current from a background task that re-scans once per invalidation
    /// interval on the blocking thread pool. Must be called from within a tokio runtime.
    pub fn watch(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.invalidate_time.max(MIN_WATCH_PERIOD);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate and the initial load already happened.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let store = self.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || store.reload()).await {
                    error!("descriptor reload failed: {err}");
                }
            }
        })
    }

    fn rescan(&self, force: bool) {
        // A scan already in progress elsewhere: keep serving the current snapshot.
        let mut state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        if let (false, Some(checked)) = (force, state.checked) {
            if checked.elapsed() < self.invalidate_time {
                return;
            }
        }

        if self.scan(&mut state) {
            let mut merged: Vec<Arc<Descriptor>> = state
                .documents
                .iter()
                .flat_map(|d| d.descriptors.iter().cloned())
                .collect();
            merged.sort_by_key(|d| d.sort_index);
            info!(descriptors = merged.len(), "descriptor store reloaded");
            let merged: Snapshot = Arc::from(merged);
            match self.snapshot.write() {
                Ok(mut s) => *s = merged,
                Err(poisoned) => *poisoned.into_inner() = merged,
            }
        }
        state.checked = Some(Instant::now());
    }

    /// Re-read every matched document whose modification time advanced. Returns whether any
    /// document was replaced.
    fn scan(&self, state: &mut ReloadState) -> bool {
        let mut updated = false;
        for pattern in &self.globs {
            let paths = match glob::glob(pattern) {
                Ok(paths) => paths,
                Err(err) => {
                    error!(pattern = %pattern, "invalid descriptor glob: {err}");
                    continue;
                }
            };
            for path in paths.filter_map(Result::ok) {
                let Ok(mtime) = fs::metadata(&path).and_then(|m| {
                    if m.is_file() {
                        m.modified()
                    } else {
                        Err(std::io::ErrorKind::Other.into())
                    }
                }) else {
                    continue;
                };
                let position = state.positions.get(&path).copied();
                if let Some(pos) = position {
                    if mtime <= state.documents[pos].mtime {
                        continue;
                    }
                }

                match self.parse(&path) {
                    Ok(descriptors) => {
                        debug!(path = %path.display(), count = descriptors.len(), "loaded descriptors");
                        let document = Document {
                            mtime,
                            descriptors,
                        };
                        match position {
                            Some(pos) => state.documents[pos] = document,
                            None => {
                                state.positions.insert(path, state.documents.len());
                                state.documents.push(document);
                            }
                        }
                        updated = true;
                    }
                    Err(err) => {
                        error!(path = %path.display(), "unable to parse descriptor file: {err}");
                    }
                }
            }
        }
        updated
    }

    fn parse(&self, path: &Path) -> Result<Vec<Arc<Descriptor>>, Error> {
        let contents = fs::read(path)?;
        let value: Value = serde_json::from_slice(&contents)?;
        let Value::Array(elements) = self.variables.expand_value(value) else {
            return Err(Error::InvalidDocument(path.to_path_buf()));
        };
        let default_sort_index = (self.sort_key)(path);
        elements
            .into_iter()
            .enumerate()
            .map(|(i, e)| Descriptor::from_value(e, path, i, default_sort_index).map(Arc::new))
            .collect()
    }
}

impl std::fmt::Debug for RouteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteStore")
            .field("globs", &self.globs)
            .field("invalidate_time", &self.invalidate_time)
            .finish_non_exhaustive()
    }
}

/// Lazy iterator returned by [`RouteStore::find`].
pub struct Matches<'c, P> {
    snapshot: Snapshot,
    position: usize,
    candidates: &'c [String],
    predicate: P,
}

impl<P> Iterator for Matches<'_, P>
where
    P: Fn(&Descriptor) -> bool,
{
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        while let Some(descriptor) = self.snapshot.get(self.position) {
            self.position += 1;
            if !(self.predicate)(descriptor) {
                continue;
            }
            if let Some(candidate) = self.candidates.iter().find(|c| descriptor.matches(c)) {
                debug!(candidate = %candidate, id = %descriptor.id, file = %descriptor.file.display(), "matched descriptor");
                return Some(Match {
                    descriptor: descriptor.clone(),
                    candidate: candidate.clone(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Variables;
    use std::fs::File;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    fn set_mtime(path: &Path, mtime: SystemTime) {
        let f = File::options().write(true).open(path).unwrap();
        f.set_modified(mtime).unwrap();
    }

    fn later() -> SystemTime {
        SystemTime::now() + Duration::from_secs(10)
    }

    fn store(dir: &TempDir, variables: Variables) -> RouteStore {
        let pattern = dir.path().join("**").join("*.json");
        RouteStore::load(
            vec![pattern.display().to_string()],
            Arc::new(variables),
            Arc::new(default_sort_key),
        )
        .unwrap()
    }

    fn ids(snapshot: &Snapshot) -> Vec<i64> {
        snapshot
            .iter()
            .map(|d| d.document["id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn sort_key_from_file_name() {
        assert_eq!(default_sort_key(Path::new("/r/default.json")), 100);
        assert_eq!(default_sort_key(Path::new("/r/default-dns.json")), 100);
        assert_eq!(default_sort_key(Path::new("/r/10-http.json")), 10);
        assert_eq!(default_sort_key(Path::new("/r/dns.json")), 99);
    }

    #[test]
    fn merges_and_orders_stably() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.json", r#"[{"id": 1}, {"id": 2, "sort_index": 5}]"#);
        write(&dir, "50-b.json", r#"[{"id": 3}, {"id": 4}]"#);
        write(&dir, "sub/50-c.json", r#"[{"id": 5}]"#);
        let s = store(&dir, Variables::default());
        let list = s.descriptors();
        assert_eq!(list.len(), 5);
        let sorted: Vec<i64> = list.iter().map(|d| d.sort_index).collect();
        assert_eq!(sorted, vec![5, 50, 50, 50, 100]);
        assert_eq!(ids(&list)[0], 2);
        assert_eq!(ids(&list)[1..4], [3, 4, 5]);
    }

    #[test]
    fn templates_documents_on_load() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "a.json",
            r#"[{"id": 1, "route": "^{{REPLACE}}$", "action": {"response": "{{REPLACE}}"}}]"#,
        );
        let s = store(&dir, [("REPLACE", "X.Y")].into_iter().collect());
        let d = &s.descriptors()[0];
        assert_eq!(d.route.as_ref().unwrap().as_str(), r"^X\.Y$");
        assert_eq!(d.action.as_ref().unwrap()["response"], "X.Y");
    }

    #[test]
    fn bad_document_keeps_previous_version() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.json", r#"[{"id": 1}]"#);
        write(&dir, "broken.json", "[{");
        let s = store(&dir, Variables::default()).with_invalidate_time(Duration::ZERO);
        assert_eq!(ids(&s.descriptors()), vec![1]);

        fs::write(&path, r#"[{"id": 1}, {"route": "("}]"#).unwrap();
        set_mtime(&path, later());
        s.refresh();
        assert_eq!(ids(&s.descriptors()), vec![1]);
    }

    #[test]
    fn reload_waits_for_interval_and_mtime() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.json", r#"[{"id": 1}]"#);
        let s = store(&dir, Variables::default()).with_invalidate_time(Duration::from_secs(3600));

        let mtime = later();
        fs::write(&path, r#"[{"id": 2}]"#).unwrap();
        set_mtime(&path, mtime);
        // Still inside the invalidation interval.
        s.refresh();
        assert_eq!(ids(&s.descriptors()), vec![1]);

        let s = s.with_invalidate_time(Duration::ZERO);
        assert_eq!(ids(&s.descriptors()), vec![1]);
        s.refresh();
        assert_eq!(ids(&s.descriptors()), vec![2]);

        // Content changed but the modification time did not advance.
        fs::write(&path, r#"[{"id": 3}]"#).unwrap();
        set_mtime(&path, mtime);
        s.reload();
        assert_eq!(ids(&s.descriptors()), vec![2]);
    }

    #[test]
    fn unchanged_reload_keeps_identity() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.json", r#"[{"id": 1}]"#);
        let s = store(&dir, Variables::default()).with_invalidate_time(Duration::ZERO);
        let first = s.descriptors();
        s.reload();
        let second = s.descriptors();
        assert!(Arc::ptr_eq(&first[0], &second[0]));
    }

    #[test]
    fn lookups_do_not_rescan() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.json", r#"[{"id": 1}]"#);
        let s = store(&dir, Variables::default()).with_invalidate_time(Duration::ZERO);

        fs::write(&path, r#"[{"id": 2}]"#).unwrap();
        set_mtime(&path, later());
        assert_eq!(ids(&s.descriptors()), vec![1]);
        assert!(s.first(&[String::new()], |_| true).is_some());
        assert_eq!(ids(&s.descriptors()), vec![1]);
    }

    #[tokio::test]
    async fn watch_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.json", r#"[{"id": 1}]"#);
        let s = Arc::new(store(&dir, Variables::default()).with_invalidate_time(Duration::ZERO));
        let watcher = s.clone().watch();

        fs::write(&path, r#"[{"id": 2}]"#).unwrap();
        set_mtime(&path, later());
        let deadline = Instant::now() + Duration::from_secs(10);
        while ids(&s.descriptors()) != vec![2] {
            assert!(Instant::now() < deadline, "reload never happened");
            tokio::time::sleep(MIN_WATCH_PERIOD).await;
        }
        watcher.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_see_whole_snapshots_during_reloads() {
        let dir = TempDir::new().unwrap();
        let generation = |g: u64| format!(r#"[{{"id": {g}}}, {{"id": {g}}}, {{"id": {g}}}]"#);
        let path = write(&dir, "a.json", &generation(0));
        let s = Arc::new(store(&dir, Variables::default()));

        let mut readers = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let s = s.clone();
            readers.spawn(async move {
                let candidates = vec![String::new()];
                let mut last = 0;
                for _ in 0..2000 {
                    let seen: Vec<i64> = s
                        .find(&candidates, |_| true)
                        .map(|m| m.descriptor.document["id"].as_i64().unwrap())
                        .collect();
                    assert_eq!(seen.len(), 3, "{seen:?}");
                    assert!(seen.iter().all(|id| *id == seen[0]), "{seen:?}");
                    assert!(seen[0] >= last, "went back from {last} to {}", seen[0]);
                    last = seen[0];
                    tokio::task::yield_now().await;
                }
            });
        }

        let writer = {
            let s = s.clone();
            tokio::task::spawn_blocking(move || {
                for g in 1..=20 {
                    fs::write(&path, generation(g)).unwrap();
                    set_mtime(&path, SystemTime::now() + Duration::from_secs(10 + g));
                    s.reload();
                }
            })
        };

        writer.await.unwrap();
        while let Some(reader) = readers.join_next().await {
            reader.unwrap();
        }
        assert_eq!(ids(&s.descriptors()), vec![20, 20, 20]);
    }

    #[test]
    fn find_yields_in_store_order_with_first_candidate() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "10-a.json",
            r#"[
                {"id": 1, "protocol": "http", "route": "^/path$"},
                {"id": 2, "protocol": "dns", "route": "example"},
                {"id": 3, "protocol": "http", "route": "example"},
                {"id": 4, "protocol": "http"}
            ]"#,
        );
        let s = store(&dir, Variables::default());
        let candidates = vec!["http://example.com/path".to_string(), "/path".to_string()];
        let found: Vec<(i64, String)> = s
            .find(&candidates, |d| d.is(Protocol::Http))
            .map(|m| (m.descriptor.document["id"].as_i64().unwrap(), m.candidate))
            .collect();
        assert_eq!(
            found,
            vec![
                (1, "/path".to_string()),
                (3, "http://example.com/path".to_string()),
                (4, "http://example.com/path".to_string()),
            ]
        );
        assert!(s.first(&candidates, |d| d.is(Protocol::SslMiddleware)).is_none());
    }

    #[test]
    fn invalid_glob_is_an_error() {
        let res = RouteStore::load(
            vec!["[".to_string()],
            Arc::new(Variables::default()),
            Arc::new(default_sort_key),
        );
        assert!(matches!(res, Err(Error::InvalidGlob(_))));
    }
}
