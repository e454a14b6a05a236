//! Event routing from the substrate watch to lifecycle worker shards.
//!
//! Every event for a given unit lands on the same shard, so one worker sees
//! that unit's transitions in arrival order while different units proceed in
//! parallel.

use dagrun_types::unit::{UnitEvent, UnitEventKind, UnitSnapshot, WatchEvent};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shard index of a unit: first 8 bytes of SHA-256(name ‖ namespace) mod N.
///
/// Stable across processes and restarts.
pub fn shard_for(name: &str, namespace: &str, shards: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(namespace.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shards.max(1) as u64) as usize
}

/// Fans watch events out to bounded per-shard queues.
pub struct EventRouter {
    shards: Vec<mpsc::Sender<UnitEvent>>,
}

impl EventRouter {
    /// Create a router with `count` shards and return the shard receivers,
    /// one per lifecycle worker.
    pub fn new(count: usize, capacity: usize) -> (Self, Vec<mpsc::Receiver<UnitEvent>>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..count.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip();
        (Self { shards: senders }, receivers)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub async fn on_add(&self, unit: UnitSnapshot) {
        debug!(uid = %unit.uid, name = unit.name(), "unit added");
        self.route(UnitEventKind::Add, unit).await;
    }

    /// Route an update when the phase changed or a container configuration
    /// error first appeared (the phase stays pending in that case).
    pub async fn on_update(&self, old: &UnitSnapshot, new: UnitSnapshot) {
        let new_config_error = new.config_error().is_some() && old.config_error().is_none();
        if old.phase == new.phase && !new_config_error {
            return;
        }
        debug!(uid = %new.uid, name = new.name(), phase = %new.phase, "unit updated");
        self.route(UnitEventKind::Update, new).await;
    }

    pub fn on_delete(&self, unit: &UnitSnapshot) {
        info!(uid = %unit.uid, name = unit.name(), "unit was deleted");
    }

    pub async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(unit) => self.on_add(unit).await,
            WatchEvent::Updated { old, new } => self.on_update(&old, new).await,
            WatchEvent::Deleted(unit) => self.on_delete(&unit),
        }
    }

    /// Consume a watch stream until it ends or `cancel` fires.
    pub async fn run(&self, mut stream: BoxStream<'static, WatchEvent>, cancel: CancellationToken) {
        info!(shards = self.shards.len(), "event router started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(event) => self.handle(event).await,
                    None => {
                        warn!("unit watch stream ended");
                        break;
                    }
                },
            }
        }
        info!("event router stopped");
    }

    async fn route(&self, kind: UnitEventKind, unit: UnitSnapshot) {
        let index = shard_for(unit.name(), unit.namespace(), self.shards.len());
        let uid = unit.uid.clone();
        let event = UnitEvent { kind, unit };

        if self.shards[index].send(event).await.is_err() {
            warn!(%uid, shard = index, "shard queue closed, dropping unit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_types::unit::{UnitPhase, UnitSpec};

    fn unit(name: &str, phase: UnitPhase) -> UnitSnapshot {
        UnitSnapshot {
            uid: format!("uid-{name}"),
            spec: UnitSpec {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            phase,
            container_statuses: vec![],
            init_container_statuses: vec![],
            observed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_shard_is_stable_and_in_range() {
        for n in 1..16 {
            let a = shard_for("task-abc", "default", n);
            assert_eq!(a, shard_for("task-abc", "default", n));
            assert!(a < n);
        }
        assert_eq!(shard_for("x", "y", 0), 0);
    }

    #[test]
    fn test_shards_spread_units() {
        let used: std::collections::HashSet<usize> = (0..64)
            .map(|i| shard_for(&format!("task-{i}"), "default", 4))
            .collect();
        assert!(used.len() > 1);
    }

    #[tokio::test]
    async fn test_same_unit_keeps_order_on_one_shard() {
        let (router, mut receivers) = EventRouter::new(4, 8);
        let shard = shard_for("task-1", "default", 4);

        router.on_add(unit("task-1", UnitPhase::Pending)).await;
        router
            .on_update(
                &unit("task-1", UnitPhase::Pending),
                unit("task-1", UnitPhase::Running),
            )
            .await;
        router
            .on_update(
                &unit("task-1", UnitPhase::Running),
                unit("task-1", UnitPhase::Succeeded),
            )
            .await;

        let rx = &mut receivers[shard];
        let phases: Vec<UnitPhase> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|e| e.unwrap().unit.phase)
            .collect();
        assert_eq!(
            phases,
            vec![UnitPhase::Pending, UnitPhase::Running, UnitPhase::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_routed_event_keeps_substrate_time() {
        let (router, mut receivers) = EventRouter::new(1, 8);
        let mut stale = unit("task-1", UnitPhase::Running);
        stale.observed_at -= chrono::Duration::minutes(10);

        router.handle(WatchEvent::Added(stale.clone())).await;

        let event = receivers[0].try_recv().unwrap();
        assert_eq!(event.unit.observed_at, stale.observed_at);
    }

    #[tokio::test]
    async fn test_unchanged_phase_is_dropped() {
        let (router, mut receivers) = EventRouter::new(1, 8);
        router
            .on_update(
                &unit("task-1", UnitPhase::Running),
                unit("task-1", UnitPhase::Running),
            )
            .await;
        router.on_delete(&unit("task-1", UnitPhase::Succeeded));
        assert!(receivers[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_config_error_is_routed() {
        use dagrun_types::unit::{ContainerState, ContainerStatus, STATE_ERR_IMAGE_PULL};

        let (router, mut receivers) = EventRouter::new(1, 8);
        let mut broken = unit("task-1", UnitPhase::Pending);
        broken.container_statuses.push(ContainerStatus {
            name: "a".into(),
            state: ContainerState::Waiting {
                reason: STATE_ERR_IMAGE_PULL.into(),
            },
        });

        router
            .on_update(&unit("task-1", UnitPhase::Pending), broken.clone())
            .await;
        router.on_update(&broken, broken.clone()).await;

        assert_eq!(receivers[0].try_recv().unwrap().unit.config_error(), Some(STATE_ERR_IMAGE_PULL));
        assert!(receivers[0].try_recv().is_err(), "repeated error is not routed twice");
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (router, mut receivers) = EventRouter::new(1, 8);
        let cancel = CancellationToken::new();
        let events = vec![WatchEvent::Added(unit("task-1", UnitPhase::Pending))];
        let stream = futures_util::stream::iter(events)
            .chain(futures_util::stream::pending())
            .boxed();

        let token = cancel.clone();
        let handle = tokio::spawn(async move { router.run(stream, token).await });

        let event = receivers[0].recv().await.unwrap();
        assert_eq!(event.kind, UnitEventKind::Add);

        cancel.cancel();
        handle.await.unwrap();
    }
}
