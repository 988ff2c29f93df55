use std::sync::Arc;

use anyhow::{Result, bail};
use syncable_core::{
    FsBacking, LocalRemote, NativeFs, StorageBacking, StoreError, StoreRegistry, SyncServer,
    SyncablePath, Synchronizer,
};
use tracing::info;

/// Synchronize `path` between two on-disk replicas.
///
/// The remote replica is served in-process and every request goes through
/// the byte codec, exactly as it would over a network transport. A subtree
/// present on one side only is copied one way.
pub async fn sync(
    local: FsBacking<NativeFs>,
    remote: FsBacking<NativeFs>,
    path: &SyncablePath,
) -> Result<String> {
    let on_local = local.exists_at_path(path).await?;
    let on_remote = remote.exists_at_path(path).await?;
    if !on_local && !on_remote {
        bail!("{} exists in neither replica", path);
    }

    let registry = StoreRegistry::new(|root_id| Err(StoreError::NotFound(root_id.to_string())));
    let remote: Arc<dyn StorageBacking> = Arc::new(remote);
    registry.insert(remote);
    let server = Arc::new(SyncServer::new(Arc::new(registry)));

    let synchronizer = Synchronizer::new(Arc::new(local), Arc::new(LocalRemote::encoded(server)));
    let report = match (on_local, on_remote) {
        (true, false) => synchronizer.push(path).await,
        (false, true) => synchronizer.pull(path).await,
        _ => synchronizer.sync(path).await,
    };
    info!(
        "Sync of {} finished: {} pulled, {} pushed",
        path, report.pulled, report.pushed
    );

    let mut lines = vec![format!(
        "pulled {}, pushed {}, failed {}",
        report.pulled,
        report.pushed,
        report.failures.len()
    )];
    for failure in &report.failures {
        lines.push(format!("  {:?} {}: {}", failure.kind, failure.path, failure.message));
    }
    Ok(lines.join("\n"))
}
