//! Single-container reconciliation
//!
//! A redeploy never deletes the original container before its replacement
//! is running. The target image is pulled first if it is not local. Then:
//! stop original, create replacement under a temporary name, start and
//! verify it, remove the original, rename the replacement. A failure before
//! the original is removed puts the original back the way it was.

use super::{Timeouts, STOP_SLACK};
use crate::compose::labels;
use crate::compose::{compose_file_for, ComposeDocument};
use crate::container::{Container, ContainerDelta, ContainerSpec, Mount, StartedWith};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, KeelError, RedeployStep, ResourceKind, Result};
use crate::lock::{LockGuard, LockManager, ResourceKey};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Serializes and executes changes to individual containers
#[derive(Clone)]
pub struct ContainerReconciler {
    engine: Arc<dyn Engine>,
    locks: LockManager,
    timeouts: Timeouts,
}

impl ContainerReconciler {
    pub fn new(engine: Arc<dyn Engine>, locks: LockManager, timeouts: Timeouts) -> Self {
        Self {
            engine,
            locks,
            timeouts,
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Resolve `id_or_name` to the container's full ID, lock it, and read
    /// its state again under the lock
    async fn acquire(&self, id_or_name: &str) -> Result<(LockGuard, Container)> {
        let found = self.engine.inspect_container(id_or_name).await?;
        let guard = self
            .locks
            .try_acquire(ResourceKey::Container(found.id.clone()))?;
        let current = self.engine.inspect_container(&found.id).await?;
        Ok((guard, current))
    }

    /// Replace a container with one carrying `delta` merged over its
    /// current configuration.
    ///
    /// Fails with `ResourceBusy` if another operation holds the container.
    /// Cancellation is honoured only until the original is stopped.
    pub async fn redeploy(
        &self,
        id_or_name: &str,
        delta: &ContainerDelta,
        cancel: &CancellationToken,
    ) -> Result<Container> {
        delta.validate()?;
        let (_guard, current) = self.acquire(id_or_name).await?;

        if cancel.is_cancelled() {
            info!(container = %current.name, "redeploy cancelled before any change");
            return Err(KeelError::Cancelled(current.name));
        }

        let mut target = delta.merge(&current, &current.name)?;
        if !delta.is_empty() {
            // No longer matches the compose definition it was hashed from
            target.labels.remove(labels::CONFIG_HASH);
        }
        self.replace(&current, target).await
    }

    /// `redeploy`, then record a changed image in the compose file of a
    /// compose-managed container. The file edit is best effort.
    pub async fn update(
        &self,
        id_or_name: &str,
        delta: &ContainerDelta,
        cancel: &CancellationToken,
    ) -> Result<Container> {
        let updated = self.redeploy(id_or_name, delta, cancel).await?;

        if let (Some(image), StartedWith::Compose { service, .. }) =
            (&delta.image, &updated.started_with)
        {
            if let Err(e) = patch_compose_image(&updated, service, image) {
                warn!(container = %updated.name, error = %e, "compose file not updated with new image");
            }
        }

        Ok(updated)
    }

    /// Swap `current` for a container created from `target`, ending up
    /// under `target.name`.
    ///
    /// The caller holds the lock on `current`. Once the stop has been issued
    /// the sequence always runs to commit or rollback.
    pub(crate) async fn replace(
        &self,
        current: &Container,
        mut target: ContainerSpec,
    ) -> Result<Container> {
        let name = current.name.clone();
        let final_name = std::mem::take(&mut target.name);
        let was_running = current.is_running();
        let suffix = Uuid::new_v4().simple().to_string();
        let temp_name = format!("{}-redeploy-{}", final_name, &suffix[..8]);
        target.name = temp_name.clone();

        info!(container = %name, id = %current.short_id(), image = %target.image, "redeploy started");

        if let Err(source) = self.ensure_image(&target.image).await {
            return Err(failed(&name, RedeployStep::Pull, source, None));
        }

        if was_running {
            debug!(container = %name, "stopping original");
            if let Err(source) = self.stop_or_kill(&current.id).await {
                let rollback = self.roll_back(current, was_running, None).await;
                return Err(failed(&name, RedeployStep::Stop, source, rollback));
            }
        }

        debug!(container = %name, temp = %temp_name, "creating replacement");
        let new_id = match self.engine.create_container(&target).await {
            Ok(id) => id,
            Err(source) => {
                let rollback = self.roll_back(current, was_running, None).await;
                return Err(failed(&name, RedeployStep::Create, source, rollback));
            }
        };

        if let Err((step, source)) = self.start_verified(&new_id, &temp_name).await {
            let rollback = self.roll_back(current, was_running, Some(new_id.as_str())).await;
            return Err(failed(&name, step, source, rollback));
        }

        debug!(container = %name, "replacement running, removing original");
        if let Err(source) = self.engine.remove_container(&current.id, true).await {
            let rollback = self.roll_back(current, was_running, Some(new_id.as_str())).await;
            return Err(failed(&name, RedeployStep::RemoveOriginal, source, rollback));
        }

        if let Err(source) = self.engine.rename_container(&new_id, &final_name).await {
            warn!(container = %name, temp = %temp_name, error = %source, "rename of replacement failed");
            return Err(failed(
                &name,
                RedeployStep::Rename,
                source,
                Some(format!(
                    "original already removed, replacement left running as {}",
                    temp_name
                )),
            ));
        }

        let replaced = self.engine.inspect_container(&new_id).await?;
        info!(
            container = %name,
            old = %current.short_id(),
            new = %replaced.short_id(),
            "redeploy complete"
        );
        Ok(replaced)
    }

    /// Pull `reference` unless the engine already has it
    pub(crate) async fn ensure_image(&self, reference: &str) -> EngineResult<()> {
        match self.engine.inspect_image(reference).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!(image = %reference, "image not present locally, pulling");
                self.engine.pull_image(reference).await
            }
            Err(e) => Err(e),
        }
    }

    /// Start a container and check the engine reports it running
    pub(crate) async fn start_verified(
        &self,
        id: &str,
        name: &str,
    ) -> std::result::Result<(), (RedeployStep, EngineError)> {
        match tokio::time::timeout(self.timeouts.start, self.engine.start_container(id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err((RedeployStep::Start, e)),
            Err(_) => {
                return Err((
                    RedeployStep::Start,
                    EngineError::Timeout {
                        operation: "start".to_string(),
                        id: name.to_string(),
                    },
                ))
            }
        }

        let started = self
            .engine
            .inspect_container(id)
            .await
            .map_err(|e| (RedeployStep::Verify, e))?;
        if !started.is_running() {
            return Err((
                RedeployStep::Verify,
                EngineError::NotRunning {
                    id: name.to_string(),
                    status: started.status.to_string(),
                },
            ));
        }
        Ok(())
    }

    /// Graceful stop, escalating to kill if the engine does not return in
    /// time or its own request times out
    async fn stop_or_kill(&self, id: &str) -> EngineResult<()> {
        let grace = self.timeouts.stop;
        match tokio::time::timeout(grace + STOP_SLACK, self.engine.stop_container(id, grace)).await
        {
            Ok(Err(EngineError::Timeout { .. })) | Err(_) => {
                warn!(id = %id, "stop timed out, killing container");
                match self.engine.kill_container(id).await {
                    Ok(()) => Ok(()),
                    // The stop may have landed after all
                    Err(e) => match self.engine.inspect_container(id).await {
                        Ok(c) if !c.is_running() => Ok(()),
                        _ => Err(e),
                    },
                }
            }
            Ok(result) => result,
        }
    }

    /// Remove the replacement, if any, and bring the original back to the
    /// state it was in. Returns a description of whatever could not be
    /// undone.
    async fn roll_back(
        &self,
        original: &Container,
        was_running: bool,
        replacement: Option<&str>,
    ) -> Option<String> {
        warn!(container = %original.name, "rolling back to original container");
        let mut failures = Vec::new();

        if let Some(id) = replacement {
            if let Err(e) = self.engine.remove_container(id, true).await {
                if !e.is_not_found() {
                    failures.push(format!("remove replacement: {}", e));
                }
            }
        }

        if was_running {
            let running = matches!(
                self.engine.inspect_container(&original.id).await,
                Ok(c) if c.is_running()
            );
            if !running {
                if let Err(e) = self.engine.start_container(&original.id).await {
                    failures.push(format!("restart original: {}", e));
                }
            }
        }

        if failures.is_empty() {
            None
        } else {
            let summary = failures.join("; ");
            warn!(container = %original.name, failures = %summary, "rollback incomplete");
            Some(summary)
        }
    }

    pub async fn start(&self, id_or_name: &str) -> Result<Container> {
        let (_guard, current) = self.acquire(id_or_name).await?;
        info!(container = %current.name, "starting");
        self.engine.start_container(&current.id).await?;
        Ok(self.engine.inspect_container(&current.id).await?)
    }

    pub async fn stop(&self, id_or_name: &str) -> Result<Container> {
        let (_guard, current) = self.acquire(id_or_name).await?;
        info!(container = %current.name, "stopping");
        self.stop_or_kill(&current.id).await?;
        Ok(self.engine.inspect_container(&current.id).await?)
    }

    pub async fn restart(&self, id_or_name: &str) -> Result<Container> {
        let (_guard, current) = self.acquire(id_or_name).await?;
        info!(container = %current.name, "restarting");
        self.engine
            .restart_container(&current.id, self.timeouts.stop)
            .await?;
        Ok(self.engine.inspect_container(&current.id).await?)
    }

    pub async fn remove(&self, id_or_name: &str, force: bool) -> Result<()> {
        let (_guard, current) = self.acquire(id_or_name).await?;
        info!(container = %current.name, force, "removing");
        self.engine.remove_container(&current.id, force).await?;
        Ok(())
    }

    pub async fn rename(&self, id_or_name: &str, new_name: &str) -> Result<Container> {
        let new_name = new_name.trim_start_matches('/');
        if new_name.is_empty() || new_name.contains(char::is_whitespace) {
            return Err(KeelError::InvalidDelta(format!(
                "invalid container name '{}'",
                new_name
            )));
        }

        let (_guard, current) = self.acquire(id_or_name).await?;
        info!(container = %current.name, new_name = %new_name, "renaming");
        self.engine.rename_container(&current.id, new_name).await?;
        Ok(self.engine.inspect_container(&current.id).await?)
    }

    /// Attach a running container to a network without recreating it
    pub async fn connect_network(
        &self,
        id_or_name: &str,
        network: &str,
        aliases: &[String],
    ) -> Result<Container> {
        let (_guard, current) = self.acquire(id_or_name).await?;
        info!(container = %current.name, network = %network, "connecting network");
        self.engine
            .connect_network(network, &current.id, aliases)
            .await?;
        Ok(self.engine.inspect_container(&current.id).await?)
    }

    pub async fn disconnect_network(&self, id_or_name: &str, network: &str) -> Result<Container> {
        let (_guard, current) = self.acquire(id_or_name).await?;
        info!(container = %current.name, network = %network, "disconnecting network");
        self.engine.disconnect_network(network, &current.id).await?;
        Ok(self.engine.inspect_container(&current.id).await?)
    }

    /// Mount a named volume by redeploying with one extra mount.
    ///
    /// `mode` is `rw` (default) or `ro`.
    pub async fn attach_volume(
        &self,
        id_or_name: &str,
        volume: &str,
        mount_point: &str,
        mode: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Container> {
        if !mount_point.starts_with('/') {
            return Err(KeelError::InvalidDelta(format!(
                "mount point '{}' must be an absolute path",
                mount_point
            )));
        }
        let read_only = match mode.unwrap_or("rw") {
            "rw" => false,
            "ro" => true,
            other => {
                return Err(KeelError::InvalidDelta(format!(
                    "mount mode must be 'rw' or 'ro', got '{}'",
                    other
                )))
            }
        };

        let (_guard, current) = self.acquire(id_or_name).await?;
        self.engine.inspect_volume(volume).await?;

        if current.mounts_volume(volume) {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Volume,
                id: volume.to_string(),
                message: format!("already mounted by {}", current.name),
            }
            .into());
        }
        if current.volumes.iter().any(|m| m.destination == mount_point) {
            return Err(EngineError::Conflict {
                kind: ResourceKind::Container,
                id: current.name.clone(),
                message: format!("{} is already a mount point", mount_point),
            }
            .into());
        }

        if cancel.is_cancelled() {
            return Err(KeelError::Cancelled(current.name));
        }

        let mut target = current.to_spec(&current.name);
        target
            .volumes
            .push(Mount::named(volume, mount_point).read_only(read_only));
        target
            .volumes
            .sort_by(|a, b| a.destination.cmp(&b.destination));

        self.replace(&current, target).await
    }
}

fn failed(
    container: &str,
    step: RedeployStep,
    source: EngineError,
    rollback: Option<String>,
) -> KeelError {
    KeelError::RedeployFailed {
        container: container.to_string(),
        step,
        source,
        rollback,
    }
}

fn patch_compose_image(container: &Container, service: &str, image: &str) -> Result<()> {
    let path = compose_file_for(container)?;
    let document = ComposeDocument::load(&path)?;

    let declared = document
        .config()
        .services
        .get(service)
        .and_then(|s| s.image.as_deref());
    if declared == Some(image) {
        return Ok(());
    }

    document.set_service_image(service, image)?.save(&path)?;
    info!(service = %service, image = %image, file = %path.display(), "compose file updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::NetworkAttachment;
    use crate::engine::fake::FakeEngine;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup() -> (Arc<FakeEngine>, ContainerReconciler) {
        let engine = Arc::new(FakeEngine::new().with_network("front").with_volume("logs"));
        let reconciler =
            ContainerReconciler::new(engine.clone(), LockManager::new(), Timeouts::default());
        (engine, reconciler)
    }

    fn web() -> ContainerSpec {
        ContainerSpec::new("web", "nginx:1.25")
            .port("80/tcp", 8080)
            .volume(Mount::named("html", "/usr/share/nginx/html"))
            .network(NetworkAttachment::new("front").alias("web"))
    }

    #[tokio::test]
    async fn test_redeploy_new_image_keeps_identity() {
        let (engine, reconciler) = setup();
        let original_id = engine.seed(&web(), true);
        let before = engine.container_named("web").unwrap();

        let updated = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(updated.name, "web");
        assert_eq!(updated.image, "nginx:1.26");
        assert!(updated.environment.is_empty());
        assert_eq!(updated.networks, before.networks);
        assert_eq!(updated.volumes, before.volumes);
        assert_eq!(updated.ports, before.ports);
        assert!(updated.is_running());
        assert_ne!(updated.id, original_id);

        assert!(engine.inspect_container(&original_id).await.is_err());
        assert_eq!(engine.containers().len(), 1);
    }

    #[tokio::test]
    async fn test_transaction_order() {
        let (engine, reconciler) = setup();
        engine.seed(&web(), true);

        reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap();

        let calls = engine.calls();
        assert_eq!(calls.len(), 6);
        assert_eq!(calls[0], "pull:nginx:1.26");
        assert_eq!(calls[1], "stop:web");
        assert!(calls[2].starts_with("create:web-redeploy-"));
        assert!(calls[3].starts_with("start:web-redeploy-"));
        assert_eq!(calls[4], "remove:web");
        assert!(calls[5].starts_with("rename:web-redeploy-") && calls[5].ends_with("->web"));
    }

    #[tokio::test]
    async fn test_local_image_is_not_pulled() {
        let (engine, reconciler) = setup();
        engine.seed(&web(), true);

        reconciler
            .redeploy("web", &ContainerDelta::default().with_environment(vec!["A=1".into()]), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!engine.calls().iter().any(|c| c.starts_with("pull:")));
    }

    #[tokio::test]
    async fn test_unpullable_image_leaves_original_untouched() {
        let (engine, reconciler) = setup();
        let original_id = engine.seed(&web(), true);
        engine.unpullable("nginx:nope");

        let err = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:nope"), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            KeelError::RedeployFailed {
                step: RedeployStep::Pull,
                source: EngineError::NotFound { kind, id },
                rollback: None,
                ..
            } => {
                assert_eq!(*kind, ResourceKind::Image);
                assert_eq!(id, "nginx:nope");
            }
            other => panic!("expected pull failure, got {:?}", other),
        }
        assert_eq!(engine.calls(), vec!["pull:nginx:nope".to_string()]);
        let survivor = engine.container_named("web").unwrap();
        assert_eq!(survivor.id, original_id);
        assert!(survivor.is_running());
    }

    #[tokio::test]
    async fn test_start_failure_restores_original() {
        let (engine, reconciler) = setup();
        let original_id = engine.seed(&web(), true);
        engine.fail_start_for("nginx:1.26");

        let err = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            KeelError::RedeployFailed {
                container,
                step,
                rollback,
                ..
            } => {
                assert_eq!(container, "web");
                assert_eq!(step, RedeployStep::Start);
                assert!(rollback.is_none());
            }
            other => panic!("expected RedeployFailed, got {:?}", other),
        }

        let survivor = engine.container_named("web").unwrap();
        assert_eq!(survivor.id, original_id);
        assert_eq!(survivor.image, "nginx:1.25");
        assert!(survivor.is_running());
        assert_eq!(engine.containers().len(), 1);
    }

    #[tokio::test]
    async fn test_exit_right_after_start_fails_verification() {
        let (engine, reconciler) = setup();
        let original_id = engine.seed(&web(), true);
        engine.exit_on_start_for("nginx:broken");

        let err = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:broken"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            KeelError::RedeployFailed {
                step: RedeployStep::Verify,
                ..
            }
        ));
        let survivor = engine.container_named("web").unwrap();
        assert_eq!(survivor.id, original_id);
        assert!(survivor.is_running());
    }

    #[tokio::test]
    async fn test_create_failure_restores_original() {
        let (engine, reconciler) = setup();
        let original_id = engine.seed(&web(), true);
        engine.fail_create_for("nginx:missing");

        let err = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:missing"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            KeelError::RedeployFailed {
                step: RedeployStep::Create,
                ..
            }
        ));
        assert!(err.engine_error().unwrap().is_not_found());
        let survivor = engine.container_named("web").unwrap();
        assert_eq!(survivor.id, original_id);
        assert!(survivor.is_running());
    }

    #[tokio::test]
    async fn test_remove_original_failure_rolls_back() {
        let (engine, reconciler) = setup();
        let original_id = engine.seed(&web(), true);
        engine.fail_remove_for("web");

        let err = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            KeelError::RedeployFailed {
                step: RedeployStep::RemoveOriginal,
                rollback: None,
                ..
            }
        ));
        let all = engine.containers();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, original_id);
        assert!(all[0].is_running());
    }

    #[tokio::test]
    async fn test_identical_delta_is_observably_noop() {
        let (engine, reconciler) = setup();
        engine.seed(&web().env("MODE", "prod"), true);
        let before = engine.container_named("web").unwrap();

        let after = reconciler
            .redeploy("web", &ContainerDelta::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_ne!(after.id, before.id);
        assert!(after.same_configuration(&before));
    }

    #[tokio::test]
    async fn test_concurrent_redeploys_one_is_busy() {
        let (engine, reconciler) = setup();
        engine.seed(&web(), true);
        engine.delay_start(Duration::from_millis(100));

        let other = reconciler.clone();
        let token = CancellationToken::new();
        let delta_a = ContainerDelta::image("nginx:1.26");
        let delta_b = ContainerDelta::image("nginx:1.27");
        let (first, second) = tokio::join!(
            reconciler.redeploy("web", &delta_a, &token),
            other.redeploy("web", &delta_b, &token),
        );

        let busy = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_busy()))
            .count();
        let succeeded = [&first, &second].iter().filter(|r| r.is_ok()).count();
        assert_eq!(busy, 1);
        assert_eq!(succeeded, 1);
        assert_eq!(engine.containers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_escalates_to_kill() {
        let (engine, reconciler) = setup();
        engine.seed(&web(), true);
        engine.delay_stop(Duration::from_secs(60));

        let updated = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(updated.image, "nginx:1.26");
        let calls = engine.calls();
        assert_eq!(calls[1], "kill:web");
        assert!(!calls.contains(&"stop:web".to_string()));
    }

    #[tokio::test]
    async fn test_engine_stop_timeout_escalates_to_kill() {
        let (engine, reconciler) = setup();
        engine.seed(&web(), true);
        engine.time_out_stops();

        let updated = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(updated.name, "web");
        assert!(updated.is_running());
        let calls = engine.calls();
        assert_eq!(calls[1], "stop:web");
        assert_eq!(calls[2], "kill:web");
        assert_eq!(engine.containers().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_restore_is_reported() {
        let (engine, reconciler) = setup();
        let original_id = engine.seed(&web(), true);
        engine.fail_start_for("nginx:1.26");
        engine.fail_start_for("nginx:1.25");

        let err = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            KeelError::RedeployFailed {
                step: RedeployStep::Start,
                rollback: Some(note),
                ..
            } => assert!(note.contains("restart original"), "{}", note),
            other => panic!("expected RedeployFailed with rollback failure, got {:?}", other),
        }
        assert!(err.to_string().contains("restart original"));

        let all = engine.containers();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, original_id);
        assert!(!all[0].is_running());
    }

    #[tokio::test]
    async fn test_rename_failure_leaves_replacement_under_temp_name() {
        let (engine, reconciler) = setup();
        let original_id = engine.seed(&web(), true);
        engine.fail_rename_for("web");

        let err = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap_err();

        let all = engine.containers();
        assert_eq!(all.len(), 1);
        let replacement = &all[0];
        assert_ne!(replacement.id, original_id);
        assert!(replacement.name.starts_with("web-redeploy-"));
        assert_eq!(replacement.image, "nginx:1.26");
        assert!(replacement.is_running());

        match &err {
            KeelError::RedeployFailed {
                step: RedeployStep::Rename,
                rollback: Some(note),
                ..
            } => assert!(note.contains(&replacement.name), "{}", note),
            other => panic!("expected rename failure, got {:?}", other),
        }
        assert!(err.to_string().contains(&replacement.name));
    }

    #[tokio::test]
    async fn test_cancel_before_stop_touches_nothing() {
        let (engine, reconciler) = setup();
        let id = engine.seed(&web(), true);
        let token = CancellationToken::new();
        token.cancel();

        let err = reconciler
            .redeploy("web", &ContainerDelta::image("nginx:1.26"), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, KeelError::Cancelled(_)));
        assert!(engine.calls().is_empty());
        assert!(!reconciler
            .locks()
            .is_held(&ResourceKey::Container(id)));
    }

    #[tokio::test]
    async fn test_invalid_delta_rejected_before_engine() {
        let (engine, reconciler) = setup();
        engine.seed(&web(), true);

        let delta = ContainerDelta::default().with_environment(vec!["NOEQUALS".into()]);
        let err = reconciler
            .redeploy("web", &delta, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::InvalidDelta(_)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_attach_volume() {
        let (engine, reconciler) = setup();
        engine.seed(&web(), true);
        let token = CancellationToken::new();

        let updated = reconciler
            .attach_volume("web", "logs", "/var/log/nginx", Some("ro"), &token)
            .await
            .unwrap();
        assert!(updated.mounts_volume("logs"));
        assert!(updated.mounts_volume("html"));
        assert!(updated
            .volumes
            .iter()
            .any(|m| m.destination == "/var/log/nginx" && m.read_only));

        let again = reconciler
            .attach_volume("web", "logs", "/logs", None, &token)
            .await
            .unwrap_err();
        assert!(matches!(
            again.engine_error(),
            Some(EngineError::Conflict {
                kind: ResourceKind::Volume,
                ..
            })
        ));

        let missing = reconciler
            .attach_volume("web", "nope", "/nope", None, &token)
            .await
            .unwrap_err();
        assert!(missing.engine_error().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_network_connect_keeps_container() {
        let engine = Arc::new(FakeEngine::new().with_network("front").with_network("back"));
        let reconciler =
            ContainerReconciler::new(engine.clone(), LockManager::new(), Timeouts::default());
        let id = engine.seed(&web(), true);

        let connected = reconciler
            .connect_network("web", "back", &["web".to_string()])
            .await
            .unwrap();
        assert_eq!(connected.id, id);
        assert!(connected.network_names().contains("back"));

        let disconnected = reconciler.disconnect_network("web", "front").await.unwrap();
        assert_eq!(disconnected.id, id);
        assert!(!disconnected.network_names().contains("front"));
    }

    #[tokio::test]
    async fn test_direct_lifecycle_operations() {
        let (engine, reconciler) = setup();
        let id = engine.seed(&web(), true);

        let stopped = reconciler.stop("web").await.unwrap();
        assert!(!stopped.is_running());
        let started = reconciler.start(&id).await.unwrap();
        assert!(started.is_running());
        let restarted = reconciler.restart("web").await.unwrap();
        assert_eq!(restarted.id, id);

        let renamed = reconciler.rename("web", "frontend").await.unwrap();
        assert_eq!(renamed.name, "frontend");
        assert!(reconciler.rename("frontend", " ").await.is_err());

        let err = reconciler.remove("frontend", false).await.unwrap_err();
        assert!(matches!(
            err.engine_error(),
            Some(EngineError::Conflict { .. })
        ));
        reconciler.remove("frontend", true).await.unwrap();
        assert!(engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_update_patches_compose_file() {
        let (engine, reconciler) = setup();
        let dir = tempdir().unwrap();
        let file = dir.path().join("docker-compose.yml");
        std::fs::write(
            &file,
            "services:\n  web:\n    image: nginx:1.25 # edge\n  cache:\n    image: redis:7\n",
        )
        .unwrap();

        let spec = web()
            .label(labels::PROJECT, "shop")
            .label(labels::SERVICE, "web")
            .label(labels::CONFIG_FILES, &file.display().to_string())
            .label(labels::CONFIG_HASH, "stale");
        engine.seed(&spec, true);

        let updated = reconciler
            .update("web", &ContainerDelta::image("nginx:1.26"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!updated.labels.contains_key(labels::CONFIG_HASH));
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "services:\n  web:\n    image: nginx:1.26 # edge\n  cache:\n    image: redis:7\n"
        );
    }
}
