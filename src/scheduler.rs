use crate::app_state::AppState;
use actix_web::web;
use std::time::Duration;

/// What one maintenance cycle did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub purged_entries: u64,
    pub pruned_identities: usize,
    pub prewarmed_providers: usize,
}

pub fn spawn(data: web::Data<AppState>) {
    let interval = Duration::from_secs(data.config.server.scheduler_interval_secs.max(1));
    actix_web::rt::spawn(async move {
        loop {
            // sleep between cycles
            actix_web::rt::time::sleep(interval).await;
            run_maintenance(&data).await;
        }
    });
}

/// Purge expired cache records, drop stale quota windows and recompute
/// adaptive timeouts for every known provider.
pub async fn run_maintenance(state: &AppState) -> MaintenanceReport {
    let purged_entries = state.cache.purge_expired().await;
    let pruned_identities = state.gatekeeper.prune_identities();

    let mut providers = state.recorder.providers();
    for name in &state.config.server.prewarm_providers {
        if !providers.contains(name) {
            providers.push(name.clone());
        }
    }
    state.governor.prewarm(&providers).await;

    if purged_entries > 0 || pruned_identities > 0 {
        log::info!(
            "Maintenance: purged {} cache entries, pruned {} identity windows",
            purged_entries,
            pruned_identities
        );
    }
    state.recorder.log_summary();

    MaintenanceReport {
        purged_entries,
        pruned_identities,
        prewarmed_providers: providers.len(),
    }
}
