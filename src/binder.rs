//! Site service: lifecycle operations with proxy routing kept in step
//!
//! Commands return a [`CommandResult`] instead of an error so callers on the
//! admin surface can report failures uniformly.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorCode, SiteError};
use crate::lifecycle::{
    MaterializeOutcome, ReconcileReport, SiteEvent, SiteManager, StopOutcome, StopReason,
};
use crate::proxy::{ProxyControlPlane, SyncReport};

/// Outcome of a site command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl CommandResult {
    fn ok(message: impl Into<String>, url: Option<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            url,
            code: None,
        }
    }

    fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            url: None,
            code: Some(code),
        }
    }

    fn from_error(err: &SiteError) -> Self {
        Self::failed(err.code(), err.to_string())
    }
}

pub struct SiteService {
    manager: Arc<SiteManager>,
    proxy: Arc<ProxyControlPlane>,
    redeploy_ready_sites: bool,
}

impl SiteService {
    pub fn new(
        manager: Arc<SiteManager>,
        proxy: Arc<ProxyControlPlane>,
        redeploy_ready_sites: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            proxy,
            redeploy_ready_sites,
        })
    }

    pub fn manager(&self) -> &Arc<SiteManager> {
        &self.manager
    }

    pub fn proxy(&self) -> &Arc<ProxyControlPlane> {
        &self.proxy
    }

    // ==================== Commands ====================

    pub async fn materialize(&self, tenant_id: &str) -> CommandResult {
        match self.manager.materialize(tenant_id).await {
            Ok(MaterializeOutcome::Built { output_dir }) => {
                CommandResult::ok(format!("Built site at {}", output_dir.display()), None)
            }
            Ok(MaterializeOutcome::AlreadyReady { port: Some(port) }) if self.redeploy_ready_sites => {
                match self.publish(tenant_id, port).await {
                    Ok(url) => CommandResult::ok("Site already ready, route refreshed", url),
                    Err(e) => CommandResult::from_error(&e),
                }
            }
            Ok(MaterializeOutcome::AlreadyReady { .. }) => {
                CommandResult::ok("Site already ready", None)
            }
            Err(e) => CommandResult::from_error(&e),
        }
    }

    pub async fn start(&self, tenant_id: &str) -> CommandResult {
        let outcome = match self.manager.start(tenant_id).await {
            Ok(outcome) => outcome,
            Err(e) => return CommandResult::from_error(&e),
        };

        match self.publish(tenant_id, outcome.port).await {
            Ok(public) => {
                let url = public.unwrap_or(outcome.url);
                let message = if outcome.already_running {
                    format!("Site already running on port {}", outcome.port)
                } else {
                    format!("Site started on port {}", outcome.port)
                };
                CommandResult::ok(message, Some(url))
            }
            Err(e) => CommandResult::from_error(&e),
        }
    }

    pub async fn stop(&self, tenant_id: &str) -> CommandResult {
        if let Err(e) = self.proxy.unpublish(tenant_id).await {
            warn!(tenant = %tenant_id, error = %e, "Failed to remove route before stopping");
        }

        let stopped = self.manager.stop(tenant_id).await;

        // A start that was in flight may have published after the first removal
        if let Err(e) = self.proxy.unpublish(tenant_id).await {
            warn!(tenant = %tenant_id, error = %e, "Failed to remove route after stopping");
        }

        match stopped {
            Ok(StopOutcome::Stopped { port }) => {
                CommandResult::ok(format!("Site stopped, port {} released", port), None)
            }
            Ok(StopOutcome::NothingToStop) => CommandResult::ok("Site was not running", None),
            Err(e) => CommandResult::from_error(&e),
        }
    }

    pub async fn redeploy(&self, tenant_id: &str) -> CommandResult {
        let result = self.manager.redeploy(tenant_id).await;

        // A failed rebuild or restart leaves the site stopped
        if !self.manager.is_running(tenant_id) {
            if let Err(e) = self.proxy.unpublish(tenant_id).await {
                warn!(tenant = %tenant_id, error = %e, "Failed to remove route after redeploy");
            }
        }

        match result {
            Ok(outcome) => match outcome.restarted {
                Some(started) => match self.publish(tenant_id, started.port).await {
                    Ok(public) => CommandResult::ok(
                        format!("Site redeployed and restarted on port {}", started.port),
                        Some(public.unwrap_or(started.url)),
                    ),
                    Err(e) => CommandResult::from_error(&e),
                },
                None => CommandResult::ok(
                    format!("Site rebuilt at {}", outcome.output_dir.display()),
                    None,
                ),
            },
            Err(e) => CommandResult::from_error(&e),
        }
    }

    pub fn touch(&self, tenant_id: &str) -> CommandResult {
        if self.manager.touch(tenant_id) {
            CommandResult::ok("Idle timer reset", None)
        } else {
            CommandResult::failed(ErrorCode::SiteNotReady, format!("site '{}' is not running", tenant_id))
        }
    }

    /// Reconcile records and processes, then bring proxy rules in line
    pub async fn reconcile(&self) -> anyhow::Result<(ReconcileReport, SyncReport)> {
        let reconciled = self.manager.reconcile().await?;
        let synced = self.proxy.sync_all().await?;
        Ok((reconciled, synced))
    }

    /// Route a running site. `Ok(None)` means routing failed outside
    /// production and the local URL stays in effect
    async fn publish(&self, tenant_id: &str, port: u16) -> Result<Option<String>, SiteError> {
        match self.proxy.publish(tenant_id, port).await {
            Ok(url) => {
                // A concurrent stop may have won the tenant lock after the start
                if !self.manager.is_running(tenant_id) {
                    debug!(tenant = %tenant_id, port, "Site stopped while publishing, removing route");
                    if let Err(e) = self.proxy.unpublish(tenant_id).await {
                        warn!(tenant = %tenant_id, error = %e, "Failed to remove route of stopped site");
                    }
                    return Ok(None);
                }
                if let Err(e) = self.manager.set_url(tenant_id, &url) {
                    warn!(tenant = %tenant_id, error = %e, "Failed to persist public URL");
                }
                Ok(Some(url))
            }
            Err(e) if self.proxy.production() => {
                error!(tenant = %tenant_id, port, error = %e, "Publishing failed, stopping site");
                if let Err(stop_err) = self.manager.stop(tenant_id).await {
                    warn!(tenant = %tenant_id, error = %stop_err, "Failed to stop unroutable site");
                }
                Err(e.into())
            }
            Err(e) => {
                warn!(tenant = %tenant_id, port, error = %e, "Publishing failed, keeping local URL");
                Ok(None)
            }
        }
    }

    // ==================== Events ====================

    /// Remove routes of sites stopped without a command, until shutdown
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<SiteEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Lifecycle events dropped, resyncing proxy rules");
                        if let Err(e) = self.proxy.sync_all().await {
                            warn!(error = %e, "Proxy sync failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn handle_event(&self, event: SiteEvent) {
        let automatic = match &event {
            SiteEvent::Started { .. } => false,
            SiteEvent::Stopped { reason, .. } => *reason != StopReason::Redeploy,
            SiteEvent::Exited { .. } | SiteEvent::Corrected { .. } => true,
        };
        if !automatic {
            return;
        }

        let tenant_id = event.tenant_id();
        // Restarted before the event arrived
        if self.manager.is_running(tenant_id) {
            debug!(tenant = %tenant_id, "Site running again, keeping route");
            return;
        }

        match self.proxy.unpublish(tenant_id).await {
            Ok(true) => info!(tenant = %tenant_id, "Removed route of stopped site"),
            Ok(false) => {}
            Err(e) => warn!(tenant = %tenant_id, error = %e, "Failed to remove route of stopped site"),
        }
    }

    /// Remove every route, then stop every site
    pub async fn shutdown(&self) {
        for site in self.manager.status().running {
            if let Err(e) = self.proxy.unpublish(&site.tenant_id).await {
                warn!(tenant = %site.tenant_id, error = %e, "Failed to remove route during shutdown");
            }
        }
        self.manager.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, SitesConfig};
    use crate::db::Database;
    use crate::pipeline::SiteBuilder;
    use crate::ports::PortAllocator;
    use crate::runtime;
    use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
    use crate::tenants::{StaticTenant, StaticTenants};
    use std::collections::HashMap;
    use std::path::Path;

    fn service(root: &Path, production: bool) -> Arc<SiteService> {
        service_with(root, production, "echo Ready; exec sleep 30")
    }

    fn service_with(root: &Path, production: bool, script: &str) -> Arc<SiteService> {
        std::fs::create_dir_all(root.join("template")).unwrap();
        std::fs::write(root.join("template/index.html.tmpl"), "{{ display_name }}").unwrap();

        let sites = SitesConfig {
            output_root: root.join("sites"),
            template_dir: root.join("template"),
            install_command: "true".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            startup_timeout_secs: 5,
            shutdown_grace_period_secs: 1,
            ..Default::default()
        };
        let proxy_config = ProxyConfig {
            rules_dir: root.join("rules"),
            reload: production,
            reload_command: Some("false".to_string()),
            production,
            ..Default::default()
        };

        let mut entries = HashMap::new();
        entries.insert(
            "t1".to_string(),
            StaticTenant {
                display_name: "Seaside Cabins".to_string(),
                domain: Some("seaside".to_string()),
                contact_email: None,
                contact_phone: None,
                listings: Vec::new(),
            },
        );

        let runtime = runtime::detect();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (supervisor, exits) =
            ProcessSupervisor::new(SupervisorConfig::from_sites(&sites), Arc::clone(&runtime));
        let manager = SiteManager::new(
            sites.clone(),
            Arc::clone(&db),
            Arc::new(StaticTenants::new(entries)),
            SiteBuilder::new(sites, Arc::clone(&runtime)),
            Arc::new(PortAllocator::new(3030, 3032)),
            supervisor,
        );
        tokio::spawn(Arc::clone(&manager).watch_exits(exits));

        let proxy = ProxyControlPlane::new(proxy_config, db, runtime);
        SiteService::new(manager, proxy, true)
    }

    #[test]
    fn test_command_result_json() {
        let ok = CommandResult::ok("Site started on port 3030", Some("http://t1.localhost".to_string()));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["url"], "http://t1.localhost");
        assert!(json.get("code").is_none());

        let failed = CommandResult::from_error(&SiteError::UnknownTenant("ghost".to_string()));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "UNKNOWN_TENANT");
        assert!(json.get("url").is_none());
    }

    #[tokio::test]
    async fn test_failures_are_results() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path(), false);

        let result = service.start("t1").await;
        assert!(!result.success);
        assert_eq!(result.code, Some(ErrorCode::SiteNotFound));

        let result = service.materialize("ghost").await;
        assert_eq!(result.code, Some(ErrorCode::UnknownTenant));

        let result = service.touch("t1");
        assert_eq!(result.code, Some(ErrorCode::SiteNotReady));

        let result = service.stop("t1").await;
        assert!(result.success);
        assert_eq!(result.message, "Site was not running");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_publishes_and_stop_unpublishes() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path(), false);
        let rule = root.path().join("rules/t1.conf");

        assert!(service.materialize("t1").await.success);

        let result = service.start("t1").await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.url.as_deref(), Some("http://seaside.localhost"));
        assert!(rule.exists());

        let record = service.manager().site("t1").unwrap().unwrap();
        assert_eq!(record.url.as_deref(), Some("http://seaside.localhost"));

        let again = service.start("t1").await;
        assert_eq!(again.url, result.url);

        let result = service.stop("t1").await;
        assert!(result.success);
        assert!(!rule.exists());
        assert!(service.manager().ports().in_use().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_during_start_leaves_no_route() {
        let root = tempfile::tempdir().unwrap();
        let service = service_with(root.path(), false, "sleep 1; echo Ready; exec sleep 30");
        let rule = root.path().join("rules/t1.conf");
        assert!(service.materialize("t1").await.success);

        let starting = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.start("t1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let stopped = service.stop("t1").await;
        assert!(stopped.success);
        assert_eq!(stopped.message, "Site stopped, port 3030 released");

        let started = starting.await.unwrap();
        assert!(started.success, "{}", started.message);

        assert!(!rule.exists());
        assert!(!service.manager().is_running("t1"));
        assert!(service.manager().ports().in_use().is_empty());
    }

    #[tokio::test]
    async fn test_stop_rejects_path_like_tenant_id() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path(), false);
        std::fs::write(root.path().join("victim.conf"), "keep").unwrap();

        let result = service.stop("../victim").await;
        assert!(!result.success);
        assert_eq!(result.code, Some(ErrorCode::InvalidTenantId));
        assert_eq!(std::fs::read_to_string(root.path().join("victim.conf")).unwrap(), "keep");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_production_publish_failure_stops_site() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path(), true);

        assert!(service.materialize("t1").await.success);

        let result = service.start("t1").await;
        assert!(!result.success);
        assert_eq!(result.code, Some(ErrorCode::ProxyError));
        assert!(!service.manager().is_running("t1"));
        assert!(service.manager().ports().in_use().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_event_loop_unpublishes_after_exit() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path(), false);
        let rule = root.path().join("rules/t1.conf");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = service.manager().subscribe();
        let handle = tokio::spawn(Arc::clone(&service).run_event_loop(events, shutdown_rx));

        assert!(service.materialize("t1").await.success);
        let started = service.start("t1").await;
        assert!(started.success);
        assert!(rule.exists());

        // Stopping outside the service leaves the rule for the event loop
        service.manager().stop("t1").await.unwrap();
        for _ in 0..50 {
            if !rule.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!rule.exists());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_redeploy_event_keeps_route() {
        let root = tempfile::tempdir().unwrap();
        let service = service(root.path(), false);
        let rule = root.path().join("rules/t1.conf");

        assert!(service.materialize("t1").await.success);
        assert!(service.start("t1").await.success);

        service
            .handle_event(SiteEvent::Stopped {
                tenant_id: "t1".to_string(),
                port: 3030,
                reason: StopReason::Redeploy,
            })
            .await;
        assert!(rule.exists());

        // Still running, so an automatic stop event is stale
        service
            .handle_event(SiteEvent::Corrected {
                tenant_id: "t1".to_string(),
            })
            .await;
        assert!(rule.exists());

        service.shutdown().await;
        assert!(!rule.exists());
        assert!(!service.manager().is_running("t1"));
    }
}
