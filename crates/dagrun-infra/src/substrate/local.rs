//! Unit substrate that runs task containers as local processes.
//!
//! Each unit gets a directory under `root/units/<namespace>/<name>`. Volume
//! mount paths in commands are rewritten to directories on the host:
//! `emptyDir` volumes live inside the unit directory and workspace claims
//! under `root/claims/<namespace>/<claim>`. Images are ignored. Secret
//! references read `root/secrets/<namespace>/<secret>/<key>`; a missing
//! secret leaves the unit waiting with `CreateContainerConfigError`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SubsecRound, Utc};
use dagrun_core::allocator::UnitSubstrate;
use dagrun_types::dag::WorkspaceTemplate;
use dagrun_types::error::SubstrateError;
use dagrun_types::unit::{
    ContainerSpec, ContainerState, ContainerStatus, EnvValue, STATE_CONFIG_ERROR,
    STATE_RUN_CONTAINER_ERROR, UnitPhase, UnitSnapshot, UnitSpec, WatchEvent,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct LocalUnit {
    snapshot: UnitSnapshot,
    cancel: CancellationToken,
}

struct Subscriber {
    selector: BTreeMap<String, String>,
    namespace: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Subscriber {
    fn matches(&self, unit: &UnitSnapshot) -> bool {
        unit.namespace() == self.namespace
            && self
                .selector
                .iter()
                .all(|(k, v)| unit.spec.labels.get(k) == Some(v))
    }
}

struct Inner {
    root: PathBuf,
    units: DashMap<String, LocalUnit>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Inner {
    fn emit(&self, event: WatchEvent) {
        let unit = match &event {
            WatchEvent::Added(u) | WatchEvent::Deleted(u) => u,
            WatchEvent::Updated { new, .. } => new,
        };
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|s| !s.tx.is_closed());
        for s in subscribers.iter().filter(|s| s.matches(unit)) {
            let _ = s.tx.send(event.clone());
        }
    }

    /// Apply `change` to a live unit and publish the update.
    fn transition(&self, key: &str, change: impl FnOnce(&mut UnitSnapshot)) {
        let event = {
            let Some(mut entry) = self.units.get_mut(key) else {
                return;
            };
            let old = entry.snapshot.clone();
            change(&mut entry.snapshot);
            entry.snapshot.observed_at = transition_time(old.observed_at);
            WatchEvent::Updated {
                old,
                new: entry.snapshot.clone(),
            }
        };
        self.emit(event);
    }

    fn unit_dir(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join("units").join(namespace).join(name)
    }

    fn claim_dir(&self, namespace: &str, claim: &str) -> PathBuf {
        self.root.join("claims").join(namespace).join(claim)
    }
}

/// Current time at microsecond precision, strictly after `previous` so a
/// unit's transitions never share a timestamp in either store.
fn transition_time(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now()
        .trunc_subsecs(6)
        .max(previous + chrono::Duration::microseconds(1))
}

fn unit_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Runs units as child processes of the engine.
#[derive(Clone)]
pub struct LocalProcessSubstrate {
    inner: Arc<Inner>,
}

impl LocalProcessSubstrate {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                units: DashMap::new(),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Current snapshot of a unit, if it has not been deleted.
    pub fn snapshot(&self, name: &str, namespace: &str) -> Option<UnitSnapshot> {
        self.inner
            .units
            .get(&unit_key(namespace, name))
            .map(|u| u.snapshot.clone())
    }

    pub fn unit_count(&self) -> usize {
        self.inner.units.len()
    }
}

impl UnitSubstrate for LocalProcessSubstrate {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<String, SubstrateError> {
        let key = unit_key(&spec.namespace, &spec.name);
        let uid = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let snapshot = UnitSnapshot {
            uid: uid.clone(),
            spec: spec.clone(),
            phase: UnitPhase::Pending,
            container_statuses: Vec::new(),
            init_container_statuses: Vec::new(),
            observed_at: Utc::now().trunc_subsecs(6),
        };

        match self.inner.units.entry(key.clone()) {
            Entry::Occupied(_) => return Err(SubstrateError::AlreadyExists(spec.name.clone())),
            Entry::Vacant(slot) => {
                slot.insert(LocalUnit {
                    snapshot: snapshot.clone(),
                    cancel: cancel.clone(),
                });
            }
        }
        self.inner.emit(WatchEvent::Added(snapshot));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(unit = %key, "unit cancelled"),
                _ = execute(&inner, &key) => {}
            }
        });

        debug!(unit = %spec.name, namespace = %spec.namespace, %uid, "created local unit");
        Ok(uid)
    }

    async fn delete_unit(&self, name: &str, namespace: &str, remove_finalizer: bool) -> Result<(), SubstrateError> {
        let key = unit_key(namespace, name);
        let (_, unit) = self
            .inner
            .units
            .remove(&key)
            .ok_or_else(|| SubstrateError::NotFound(name.to_string()))?;

        // Dropping the task's future kills the child (`kill_on_drop`).
        unit.cancel.cancel();

        let dir = self.inner.unit_dir(namespace, name);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(unit = name, error = %e, "failed to remove unit directory");
        }

        let mut snapshot = unit.snapshot;
        if remove_finalizer {
            snapshot.spec.finalizers.clear();
        }
        self.inner.emit(WatchEvent::Deleted(snapshot));
        debug!(unit = name, namespace, "deleted local unit");
        Ok(())
    }

    async fn provision_workspace(
        &self,
        claim: &str,
        namespace: &str,
        template: &WorkspaceTemplate,
    ) -> Result<(), SubstrateError> {
        let dir = self.inner.claim_dir(namespace, claim);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(SubstrateError::AlreadyExists(claim.to_string()));
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SubstrateError::Other(format!("create {}: {e}", dir.display())))?;

        info!(claim, namespace, storage = ?template.storage, "provisioned workspace");
        Ok(())
    }

    async fn release_workspace(&self, claim: &str, namespace: &str) -> Result<(), SubstrateError> {
        let dir = self.inner.claim_dir(namespace, claim);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(claim, namespace, "released workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SubstrateError::NotFound(claim.to_string()))
            }
            Err(e) => Err(SubstrateError::Other(format!("remove {}: {e}", dir.display()))),
        }
    }

    fn watch(&self, selector: &BTreeMap<String, String>, namespace: &str) -> BoxStream<'static, WatchEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.push(Subscriber {
                selector: selector.clone(),
                namespace: namespace.to_string(),
                tx,
            });
        }
        UnboundedReceiverStream::new(rx).boxed()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run a unit's init containers, then its main container.
async fn execute(inner: &Inner, key: &str) {
    let Some(spec) = inner.units.get(key).map(|u| u.snapshot.spec.clone()) else {
        return;
    };
    let unit_dir = inner.unit_dir(&spec.namespace, &spec.name);
    let mounts = volume_dirs(inner, &spec, &unit_dir);

    for dir in std::iter::once(&unit_dir).chain(mounts.values()) {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(unit = %spec.name, error = %e, "failed to create volume directory");
        }
    }

    for init in &spec.init_containers {
        let status = run_container(inner, &spec, init, &mounts, &unit_dir).await;
        let failed = !matches!(status.state, ContainerState::Terminated { exit_code: 0, .. });
        inner.transition(key, |s| {
            // A waiting init container leaves the unit pending.
            if failed && matches!(status.state, ContainerState::Terminated { .. }) {
                s.phase = UnitPhase::Failed;
            }
            s.init_container_statuses.push(status);
        });
        if failed {
            return;
        }
    }

    let status = run_container(inner, &spec, &spec.container, &mounts, &unit_dir).await;
    inner.transition(key, |s| {
        if let ContainerState::Terminated { exit_code, .. } = status.state {
            s.phase = if exit_code == 0 {
                UnitPhase::Succeeded
            } else {
                UnitPhase::Failed
            };
        }
        s.container_statuses = vec![status];
    });
}

/// Start one container. Reports `Running` through the unit's status while
/// the main container executes and returns its final status.
async fn run_container(
    inner: &Inner,
    spec: &UnitSpec,
    container: &ContainerSpec,
    mounts: &BTreeMap<String, PathBuf>,
    unit_dir: &Path,
) -> ContainerStatus {
    let waiting = |reason: &str| ContainerStatus {
        name: container.name.clone(),
        state: ContainerState::Waiting {
            reason: reason.to_string(),
        },
    };

    let mut env = Vec::with_capacity(container.env.len());
    for var in &container.env {
        let value = match &var.value {
            EnvValue::Literal { value } => value.clone(),
            EnvValue::SecretKeyRef { secret, key } => {
                let path = inner.root.join("secrets").join(&spec.namespace).join(secret).join(key);
                match tokio::fs::read_to_string(&path).await {
                    Ok(v) => v.trim_end_matches('\n').to_string(),
                    Err(e) => {
                        warn!(unit = %spec.name, secret = %secret, error = %e, "secret not readable");
                        return waiting(STATE_CONFIG_ERROR);
                    }
                }
            }
        };
        env.push((var.name.clone(), value));
    }

    let argv: Vec<String> = container
        .command
        .iter()
        .chain(container.args.iter())
        .map(|a| rewrite_mount_paths(a, container, mounts))
        .collect();
    let Some((program, rest)) = argv.split_first() else {
        return waiting(STATE_RUN_CONTAINER_ERROR);
    };

    let workdir = mounts
        .get(dagrun_types::unit::WORKSPACE_VOLUME)
        .map(PathBuf::as_path)
        .unwrap_or(unit_dir);

    let started_at = Utc::now();
    let child = Command::new(program)
        .args(rest)
        .envs(env)
        .current_dir(workdir)
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            warn!(unit = %spec.name, program = %program, error = %e, "failed to start container");
            return waiting(STATE_RUN_CONTAINER_ERROR);
        }
    };

    if container.name == spec.container.name {
        let key = unit_key(&spec.namespace, &spec.name);
        let name = container.name.clone();
        inner.transition(&key, |s| {
            s.phase = UnitPhase::Running;
            s.container_statuses = vec![ContainerStatus {
                name,
                state: ContainerState::Running { started_at },
            }];
        });
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!(unit = %spec.name, error = %e, "failed to wait for container");
            -1
        }
    };

    ContainerStatus {
        name: container.name.clone(),
        state: ContainerState::Terminated {
            exit_code,
            started_at,
            finished_at: Utc::now(),
        },
    }
}

/// Host directory backing each volume of a unit.
fn volume_dirs(inner: &Inner, spec: &UnitSpec, unit_dir: &Path) -> BTreeMap<String, PathBuf> {
    spec.volumes
        .iter()
        .map(|v| {
            let dir = match v.source.get("claimName").and_then(|c| c.as_str()) {
                Some(claim) => inner.claim_dir(&spec.namespace, claim),
                None => unit_dir.join(&v.name),
            };
            (v.name.clone(), dir)
        })
        .collect()
}

/// Replace container mount paths in `arg` with the backing host directories.
fn rewrite_mount_paths(arg: &str, container: &ContainerSpec, mounts: &BTreeMap<String, PathBuf>) -> String {
    let mut out = arg.to_string();
    for m in &container.volume_mounts {
        if let Some(dir) = mounts.get(&m.name) {
            out = out.replace(&m.mount_path, &dir.display().to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use dagrun_types::dag::VolumeMount;
    use dagrun_types::unit::EnvVar;

    fn spec(name: &str, command: &[&str]) -> UnitSpec {
        UnitSpec {
            name: name.into(),
            namespace: "default".into(),
            labels: BTreeMap::from([("dagrun/id".to_string(), "t".to_string())]),
            container: ContainerSpec {
                name: "a".into(),
                image: "ignored".into(),
                command: command.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([("dagrun/id".to_string(), "t".to_string())])
    }

    /// Collect events until the unit reaches a terminal or config-error state.
    async fn until_settled(stream: &mut BoxStream<'static, WatchEvent>) -> UnitSnapshot {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), stream.next())
                .await
                .unwrap()
                .unwrap();
            if let WatchEvent::Updated { new, .. } = event
                && (new.phase.is_terminal() || new.config_error().is_some())
            {
                return new;
            }
        }
    }

    #[tokio::test]
    async fn test_unit_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = LocalProcessSubstrate::new(dir.path());
        let mut events = substrate.watch(&selector(), "default");

        let uid = substrate.create_unit(&spec("u1", &["sh", "-c", "exit 3"])).await.unwrap();
        assert!(matches!(events.next().await, Some(WatchEvent::Added(u)) if u.uid == uid));

        let done = until_settled(&mut events).await;
        assert_eq!(done.phase, UnitPhase::Failed);
        assert_eq!(done.termination().unwrap().exit_code, 3);
    }

    #[tokio::test]
    async fn test_transitions_are_stamped_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = LocalProcessSubstrate::new(dir.path());
        let mut events = substrate.watch(&selector(), "default");
        substrate.create_unit(&spec("u1", &["true"])).await.unwrap();

        let Some(WatchEvent::Added(mut last)) = events.next().await else {
            panic!("expected an added event");
        };
        loop {
            let Some(WatchEvent::Updated { old, new }) = events.next().await else {
                panic!("expected an update");
            };
            assert_eq!(old.observed_at, last.observed_at);
            assert!(new.observed_at > old.observed_at);
            if new.phase.is_terminal() {
                break;
            }
            last = new;
        }
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = LocalProcessSubstrate::new(dir.path());
        substrate.create_unit(&spec("u1", &["sleep", "5"])).await.unwrap();

        let err = substrate.create_unit(&spec("u1", &["true"])).await.unwrap_err();
        assert_eq!(err, SubstrateError::AlreadyExists("u1".into()));

        substrate.delete_unit("u1", "default", true).await.unwrap();
        let err = substrate.delete_unit("u1", "default", true).await.unwrap_err();
        assert_eq!(err, SubstrateError::NotFound("u1".into()));
    }

    #[tokio::test]
    async fn test_missing_secret_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = LocalProcessSubstrate::new(dir.path());
        let mut events = substrate.watch(&selector(), "default");

        let mut unit = spec("u2", &["true"]);
        unit.container.env.push(EnvVar {
            name: "TOKEN".into(),
            value: EnvValue::SecretKeyRef {
                secret: "missing".into(),
                key: "secret".into(),
            },
        });
        substrate.create_unit(&unit).await.unwrap();

        let settled = until_settled(&mut events).await;
        assert_eq!(settled.config_error(), Some(STATE_CONFIG_ERROR));
    }

    #[tokio::test]
    async fn test_workspace_mount_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = LocalProcessSubstrate::new(dir.path());
        let mut events = substrate.watch(&selector(), "default");
        substrate
            .provision_workspace("r-pvc", "default", &WorkspaceTemplate::default())
            .await
            .unwrap();

        let mut unit = spec("u3", &["sh", "-c", "echo hi > /workspace/out"]);
        unit.volumes.push(dagrun_types::dag::Volume {
            name: "workspace".into(),
            source: serde_json::json!({ "claimName": "r-pvc" }),
        });
        unit.container.volume_mounts.push(VolumeMount {
            name: "workspace".into(),
            mount_path: "/workspace".into(),
            read_only: false,
        });
        substrate.create_unit(&unit).await.unwrap();

        let done = until_settled(&mut events).await;
        assert_eq!(done.phase, UnitPhase::Succeeded);
        let out = std::fs::read_to_string(dir.path().join("claims/default/r-pvc/out")).unwrap();
        assert_eq!(out.trim(), "hi");

        substrate.release_workspace("r-pvc", "default").await.unwrap();
        assert!(substrate.release_workspace("r-pvc", "default").await.is_err());
    }

    #[tokio::test]
    async fn test_watch_filters_by_selector() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = LocalProcessSubstrate::new(dir.path());
        let other = BTreeMap::from([("dagrun/id".to_string(), "other".to_string())]);
        let mut events = substrate.watch(&other, "default");

        substrate.create_unit(&spec("u4", &["true"])).await.unwrap();
        let next = tokio::time::timeout(Duration::from_millis(300), events.next()).await;
        assert!(next.is_err(), "no events for other engines");
    }
}
