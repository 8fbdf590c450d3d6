//! Live backend set and fingerprint routing table.
//!
//! The registry publishes immutable [`Snapshot`]s. Readers clone the current
//! `Arc<Snapshot>` and keep using it for the whole request; writers build a
//! complete replacement and swap the pointer. A reader therefore sees either
//! the old or the new backend set, never a mix.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backend::client::BackendClient;
use crate::backend::discovery;
use crate::config::DiscoveryConfig;
use crate::protocol::Identity;

/// One discovered agent socket.
#[derive(Debug)]
pub struct BackendAgent {
    path: PathBuf,
    discovered_at: SystemTime,
    last_contact_ms: AtomicU64,
    identities: Arc<[Identity]>,
    alive: AtomicBool,
}

impl BackendAgent {
    pub(crate) fn new(path: PathBuf, identities: Vec<Identity>, discovered_at: SystemTime) -> Self {
        Self {
            path,
            discovered_at,
            last_contact_ms: AtomicU64::new(unix_millis(SystemTime::now())),
            identities: identities.into(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn discovered_at(&self) -> SystemTime {
        self.discovered_at
    }

    pub fn last_contact(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_contact_ms.load(Ordering::Relaxed))
    }

    /// Identities as of the last successful fetch.
    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// False once the registry has dropped this backend.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn mark_contacted(&self) {
        self.last_contact_ms
            .store(unix_millis(SystemTime::now()), Ordering::Relaxed);
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Same backend, superseded identity list.
    fn with_identities(&self, identities: Vec<Identity>) -> Self {
        Self::new(self.path.clone(), identities, self.discovered_at)
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Immutable view of the backend set and its routing table.
#[derive(Debug, Default)]
pub struct Snapshot {
    version: u64,
    backends: Vec<Arc<BackendAgent>>,
    routes: HashMap<String, usize>,
    /// `(fingerprint, owner, duplicate)` backend indexes for shadowed keys.
    shadowed: Vec<(String, usize, usize)>,
}

impl Snapshot {
    /// Build a snapshot, routing each fingerprint to its first owner in
    /// `backends` order.
    pub(crate) fn build(version: u64, backends: Vec<Arc<BackendAgent>>) -> Self {
        let mut routes = HashMap::new();
        let mut shadowed = Vec::new();
        for (index, backend) in backends.iter().enumerate() {
            for identity in backend.identities() {
                match routes.get(&identity.fingerprint).copied() {
                    None => {
                        routes.insert(identity.fingerprint.clone(), index);
                    }
                    Some(owner) if owner != index => {
                        shadowed.push((identity.fingerprint.clone(), owner, index));
                    }
                    Some(_) => {}
                }
            }
        }

        Self {
            version,
            backends,
            routes,
            shadowed,
        }
    }

    fn log_shadowed(&self) {
        for (fingerprint, owner, duplicate) in &self.shadowed {
            warn!(
                fingerprint = %fingerprint,
                owner = %self.backends[*owner].path().display(),
                duplicate = %self.backends[*duplicate].path().display(),
                "Key loaded in several agents; routing to the earliest"
            );
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Backends in discovery order.
    pub fn backends(&self) -> &[Arc<BackendAgent>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backend that owns `fingerprint`.
    pub fn lookup(&self, fingerprint: &str) -> Option<Arc<BackendAgent>> {
        self.routes
            .get(fingerprint)
            .map(|&index| Arc::clone(&self.backends[index]))
    }

    /// First backend in discovery order.
    pub fn primary(&self) -> Option<Arc<BackendAgent>> {
        self.backends.first().cloned()
    }

    pub fn get(&self, path: &Path) -> Option<&Arc<BackendAgent>> {
        self.backends.iter().find(|b| b.path() == path)
    }

    pub fn identity_count(&self) -> usize {
        self.routes.len()
    }
}

/// Outcome of a registry refresh.
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub version: u64,
    pub added: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    pub dropped: Vec<PathBuf>,
    pub identities: usize,
}

impl RefreshReport {
    pub fn backends(&self) -> usize {
        self.added.len() + self.kept.len()
    }
}

/// Shared handle to the backend registry.
#[derive(Clone)]
pub struct BackendRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    root: PathBuf,
    rules: DiscoveryConfig,
    /// Never treated as a backend (our own listening socket).
    excluded: Option<PathBuf>,
    client: BackendClient,
    current: RwLock<Arc<Snapshot>>,
    refreshing: Mutex<()>,
}

impl BackendRegistry {
    pub fn new(root: PathBuf, rules: DiscoveryConfig, client: BackendClient) -> Self {
        Self::with_excluded(root, rules, client, None)
    }

    pub fn with_excluded(
        root: PathBuf,
        rules: DiscoveryConfig,
        client: BackendClient,
        excluded: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                root,
                rules,
                excluded,
                client,
                current: RwLock::new(Arc::new(Snapshot::default())),
                refreshing: Mutex::new(()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn client(&self) -> &BackendClient {
        &self.inner.client
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.current.read())
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<Arc<BackendAgent>> {
        self.snapshot().lookup(fingerprint)
    }

    /// Backends in discovery order, for fan-out.
    pub fn current_backends(&self) -> Vec<Arc<BackendAgent>> {
        self.snapshot().backends().to_vec()
    }

    /// Candidate socket paths under the agents directory.
    pub fn scan(&self) -> Vec<PathBuf> {
        let mut candidates = discovery::scan(&self.inner.root, &self.inner.rules);
        if let Some(excluded) = &self.inner.excluded {
            candidates.retain(|path| path != excluded);
        }
        candidates
    }

    /// Rescan, probe every candidate, and publish the responders as the new
    /// backend set.
    pub async fn refresh(&self) -> RefreshReport {
        let _serialized = self.inner.refreshing.lock().await;

        let registry = self.clone();
        let candidates = match tokio::task::spawn_blocking(move || registry.scan()).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "Agents directory scan failed; probing known backends");
                self.current_backends()
                    .iter()
                    .map(|b| b.path().to_path_buf())
                    .collect()
            }
        };

        let mut probes = JoinSet::new();
        for path in candidates.iter().cloned() {
            let client = self.inner.client.clone();
            probes.spawn(async move {
                let result = client.request_identities(&path).await;
                (path, result)
            });
        }

        let mut answered: HashMap<PathBuf, Vec<Identity>> = HashMap::new();
        while let Some(joined) = probes.join_next().await {
            let (path, result) = match joined {
                Ok(probe) => probe,
                Err(e) => {
                    warn!(error = %e, "Backend probe task failed");
                    continue;
                }
            };
            match result {
                Ok(identities) => {
                    debug!(backend = %path.display(), count = identities.len(), "Backend answered");
                    answered.insert(path, identities);
                }
                Err(e) => info!(backend = %path.display(), error = %e, "Ignoring candidate"),
            }
        }

        let now = SystemTime::now();
        let (snapshot, mut report) = self.update(|previous| {
            let mut report = RefreshReport::default();
            let mut backends = Vec::with_capacity(answered.len());
            for old in previous.backends() {
                match answered.get(old.path()) {
                    Some(identities) => {
                        report.kept.push(old.path().to_path_buf());
                        backends.push(Arc::new(old.with_identities(identities.clone())));
                    }
                    None => report.dropped.push(old.path().to_path_buf()),
                }
            }
            for path in &candidates {
                if previous.get(path).is_some() {
                    continue;
                }
                if let Some(identities) = answered.get(path) {
                    report.added.push(path.clone());
                    backends.push(Arc::new(BackendAgent::new(
                        path.clone(),
                        identities.clone(),
                        now,
                    )));
                }
            }
            Some((backends, report))
        })
        .unwrap_or_else(|| (self.snapshot(), RefreshReport::default()));

        report.version = snapshot.version();
        report.identities = snapshot.identity_count();

        for path in &report.added {
            info!(backend = %path.display(), "Backend discovered");
        }
        for path in &report.dropped {
            info!(backend = %path.display(), "Backend lost");
        }
        info!(
            version = report.version,
            backends = report.backends(),
            identities = report.identities,
            "Backend registry refreshed"
        );

        report
    }

    /// Supersede the identity lists of the given backends with freshly
    /// fetched ones. Paths not in the current snapshot are ignored.
    pub fn record_identities(&self, updates: Vec<(PathBuf, Vec<Identity>)>) {
        let updates: HashMap<PathBuf, Vec<Identity>> = updates.into_iter().collect();

        let updated = self.update(|current| {
            let mut changed = false;
            let backends: Vec<_> = current
                .backends()
                .iter()
                .map(|backend| match updates.get(backend.path()) {
                    Some(identities) if identities.as_slice() != backend.identities() => {
                        changed = true;
                        Arc::new(backend.with_identities(identities.clone()))
                    }
                    Some(_) => {
                        backend.mark_contacted();
                        Arc::clone(backend)
                    }
                    None => Arc::clone(backend),
                })
                .collect();
            changed.then_some((backends, ()))
        });

        if let Some((snapshot, ())) = updated {
            debug!(version = snapshot.version(), "Identity lists updated");
        }
    }

    /// Drop a backend whose socket turned out to be dead.
    pub fn forget(&self, path: &Path) {
        let forgotten = self.update(|current| {
            let backend = Arc::clone(current.get(path)?);
            let backends = current
                .backends()
                .iter()
                .filter(|b| b.path() != path)
                .cloned()
                .collect();
            Some((backends, backend))
        });

        if let Some((snapshot, backend)) = forgotten {
            info!(
                backend = %backend.path().display(),
                version = snapshot.version(),
                "Backend lost"
            );
        }
    }

    /// Publish the backend list `edit` derives from the current snapshot.
    ///
    /// The replacement is built without holding the lock; the write lock only
    /// covers the pointer swap. If another writer published in the meantime
    /// `edit` runs again against the newer snapshot. `None` from `edit` leaves
    /// the registry untouched.
    fn update<T>(
        &self,
        mut edit: impl FnMut(&Snapshot) -> Option<(Vec<Arc<BackendAgent>>, T)>,
    ) -> Option<(Arc<Snapshot>, T)> {
        loop {
            let base = self.snapshot();
            let (backends, extra) = edit(&base)?;
            let snapshot = Arc::new(Snapshot::build(base.version() + 1, backends));

            {
                let mut guard = self.inner.current.write();
                if !Arc::ptr_eq(&*guard, &base) {
                    continue;
                }
                *guard = Arc::clone(&snapshot);
            }

            for old in base.backends() {
                if snapshot.get(old.path()).is_none() {
                    old.mark_dead();
                }
            }
            snapshot.log_shadowed();
            return Some((snapshot, extra));
        }
    }

    #[cfg(test)]
    pub(crate) fn install(&self, backends: Vec<Arc<BackendAgent>>) {
        self.update(|_| Some((backends.clone(), ())));
    }
}
