//! Site lifecycle manager
//!
//! Owns the per-tenant state machine:
//!
//! ```text
//! absent -> building -> ready -> (starting -> running -> stopping) -> ready
//!              \-> error
//! ```
//!
//! Every operation on a tenant runs under that tenant's async mutex, so two
//! concurrent starts never double-spawn and a stop issued during a start waits
//! for it. Durable state lives in [`Database`]; live processes live in
//! `running`. [`SiteManager::reconcile`] brings the two back in line.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SitesConfig;
use crate::db::{BuildStatus, Database, SiteEventKind, SiteRecord};
use crate::error::{BuildError, SiteError};
use crate::pipeline::{validate_tenant_id, SiteBuilder, TenantData};
use crate::ports::PortAllocator;
use crate::supervisor::{ProcessExit, ProcessSupervisor, RunningProcess};
use crate::tenants::TenantSource;

/// Why a running site was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    IdleTimeout,
    Redeploy,
    Shutdown,
}

impl StopReason {
    fn as_str(&self) -> &'static str {
        match self {
            StopReason::Requested => "requested",
            StopReason::IdleTimeout => "idle timeout",
            StopReason::Redeploy => "redeploy",
            StopReason::Shutdown => "shutdown",
        }
    }
}

/// Lifecycle transitions, broadcast to anyone interested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteEvent {
    Started { tenant_id: String, port: u16, url: String },
    Stopped { tenant_id: String, port: u16, reason: StopReason },
    Exited { tenant_id: String, port: u16, code: Option<i32> },
    Corrected { tenant_id: String },
}

impl SiteEvent {
    pub fn tenant_id(&self) -> &str {
        match self {
            SiteEvent::Started { tenant_id, .. }
            | SiteEvent::Stopped { tenant_id, .. }
            | SiteEvent::Exited { tenant_id, .. }
            | SiteEvent::Corrected { tenant_id } => tenant_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    /// The pipeline ran and the site is ready
    Built { output_dir: PathBuf },
    /// The site was already ready; nothing was rebuilt
    AlreadyReady { port: Option<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub url: String,
    pub port: u16,
    pub already_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { port: u16 },
    NothingToStop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeployOutcome {
    pub output_dir: PathBuf,
    /// Set when the site was running before the redeploy
    pub restarted: Option<StartOutcome>,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub records: usize,
    /// Records whose port/url were cleared
    pub corrected: Vec<String>,
    /// Records whose port/url were restored from a live process
    pub restored: Vec<String>,
    /// Builds marked as interrupted
    pub interrupted: Vec<String>,
    /// Reservations released because no process held them
    pub released_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningSiteInfo {
    pub tenant_id: String,
    pub pid: u32,
    pub port: u16,
    pub url: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: Vec<RunningSiteInfo>,
    pub all: Vec<SiteRecord>,
}

struct RunningSite {
    process: RunningProcess,
    idle: Option<CancellationToken>,
}

/// Removes a tenant from the in-progress build set when dropped
struct BuildGuard<'a> {
    building: &'a DashSet<String>,
    tenant_id: String,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.building.remove(&self.tenant_id);
    }
}

/// Wait for an operation spawned under the tenant lock
async fn join_locked<T>(handle: JoinHandle<Result<T, SiteError>>) -> Result<T, SiteError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(SiteError::Store(anyhow::anyhow!("site task failed: {}", e))),
    }
}

/// Orchestrates builds, ports and processes for every tenant.
///
/// Like the other long-lived services, `SiteManager::new` returns `Arc<Self>`;
/// operations that arm timers need `&Arc<Self>`.
pub struct SiteManager {
    config: SitesConfig,
    db: Arc<Database>,
    tenants: Arc<dyn TenantSource>,
    builder: SiteBuilder,
    ports: Arc<PortAllocator>,
    supervisor: Arc<ProcessSupervisor>,
    running: DashMap<String, RunningSite>,
    /// Ports allocated to starts that have not finished yet
    pending_ports: Mutex<HashMap<String, u16>>,
    building: DashSet<String>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    records: DashMap<String, SiteRecord>,
    auto_shutdown: AtomicBool,
    events: broadcast::Sender<SiteEvent>,
}

impl SiteManager {
    pub fn new(
        config: SitesConfig,
        db: Arc<Database>,
        tenants: Arc<dyn TenantSource>,
        builder: SiteBuilder,
        ports: Arc<PortAllocator>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let auto_shutdown = AtomicBool::new(config.auto_shutdown);

        Arc::new(Self {
            config,
            db,
            tenants,
            builder,
            ports,
            supervisor,
            running: DashMap::new(),
            pending_ports: Mutex::new(HashMap::new()),
            building: DashSet::new(),
            locks: DashMap::new(),
            records: DashMap::new(),
            auto_shutdown,
            events,
        })
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SiteEvent> {
        self.events.subscribe()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn emit(&self, event: SiteEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn record_event(&self, tenant_id: &str, kind: SiteEventKind, detail: Option<&str>) {
        if let Err(e) = self.db.log_event(tenant_id, kind, detail) {
            warn!(tenant = %tenant_id, kind = kind.as_str(), error = %e, "Failed to record site event");
        }
    }

    fn refresh_record(&self, tenant_id: &str) {
        match self.db.get_site(tenant_id) {
            Ok(Some(record)) => {
                self.records.insert(tenant_id.to_string(), record);
            }
            Ok(None) => {
                self.records.remove(tenant_id);
            }
            Err(e) => warn!(tenant = %tenant_id, error = %e, "Failed to refresh site record"),
        }
    }

    // ==================== Materialize ====================

    /// Build a site unless a ready one already exists
    pub async fn materialize(&self, tenant_id: &str) -> Result<MaterializeOutcome, SiteError> {
        validate_tenant_id(tenant_id)?;
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        if let Some(record) = self.db.get_site(tenant_id)? {
            if record.status == BuildStatus::Ready {
                let port = self.running.get(tenant_id).map(|s| s.process.port);
                debug!(tenant = %tenant_id, ?port, "Site already ready, skipping build");
                return Ok(MaterializeOutcome::AlreadyReady { port });
            }
        }

        let output_dir = self.build_locked(tenant_id).await?;
        Ok(MaterializeOutcome::Built { output_dir })
    }

    async fn build_locked(&self, tenant_id: &str) -> Result<PathBuf, SiteError> {
        let mut tenant = self
            .tenants
            .tenant(tenant_id)
            .await
            .map_err(|e| SiteError::Tenant(format!("{:#}", e)))?
            .ok_or_else(|| SiteError::UnknownTenant(tenant_id.to_string()))?;
        let listings = self
            .tenants
            .listings(tenant_id)
            .await
            .map_err(|e| SiteError::Tenant(format!("{:#}", e)))?;

        // The domain lands in the env file and the proxy rule; reject it before any record exists
        if let Some(domain) = tenant.domain.take() {
            let domain = domain.to_lowercase();
            if crate::proxy::validate_domain(&domain).is_err() {
                warn!(tenant = %tenant_id, domain = ?domain, "Rejecting tenant with invalid domain");
                return Err(BuildError::InvalidDomain(domain).into());
            }
            tenant.domain = Some(domain);
        }

        let output_dir = self.builder.output_dir(tenant_id);
        self.db
            .upsert_site_building(tenant_id, &output_dir.display().to_string())?;
        self.record_event(tenant_id, SiteEventKind::Materialize, None);
        self.refresh_record(tenant_id);

        let domain = tenant.domain.clone();
        let data = TenantData {
            tenant,
            listings,
            api_base_url: self.config.api_base_url.clone(),
        };

        let result = {
            self.building.insert(tenant_id.to_string());
            let _building = BuildGuard {
                building: &self.building,
                tenant_id: tenant_id.to_string(),
            };
            self.builder.build(tenant_id, &data).await
        };

        match result {
            Ok(dir) => {
                self.db.mark_site_ready(tenant_id, domain.as_deref())?;
                self.record_event(tenant_id, SiteEventKind::Built, None);
                self.refresh_record(tenant_id);
                info!(tenant = %tenant_id, output = %dir.display(), "Site ready");
                Ok(dir)
            }
            Err(e) => {
                let message = e.to_string();
                error!(tenant = %tenant_id, error = %message, "Site build failed");
                self.db.mark_site_error(tenant_id, &message)?;
                self.record_event(tenant_id, SiteEventKind::BuildFailed, Some(&message));
                self.refresh_record(tenant_id);
                Err(e.into())
            }
        }
    }

    // ==================== Start / Stop ====================

    /// Start a ready site, or return the running instance.
    ///
    /// The start runs on its own task while holding the tenant lock, so a
    /// caller that goes away mid-start never leaves a port reserved.
    pub async fn start(self: &Arc<Self>, tenant_id: &str) -> Result<StartOutcome, SiteError> {
        validate_tenant_id(tenant_id)?;
        let manager = Arc::clone(self);
        let tenant_id = tenant_id.to_string();
        let handle = tokio::spawn(async move {
            let lock = manager.tenant_lock(&tenant_id);
            let _guard = lock.lock().await;
            manager.start_locked(&tenant_id).await
        });
        join_locked(handle).await
    }

    async fn start_locked(self: &Arc<Self>, tenant_id: &str) -> Result<StartOutcome, SiteError> {
        let existing = self
            .running
            .get(tenant_id)
            .map(|s| (s.process.url.clone(), s.process.port, s.process.has_exited()));

        match existing {
            Some((url, port, false)) => {
                self.arm_idle_timer(tenant_id);
                debug!(tenant = %tenant_id, port, "Site already running");
                return Ok(StartOutcome {
                    url,
                    port,
                    already_running: true,
                });
            }
            Some((_, _, true)) => {
                // Exited, but the exit notification has not been handled yet
                self.discard_exited(tenant_id, None).await;
            }
            None => {}
        }

        let record = self
            .db
            .get_site(tenant_id)?
            .ok_or_else(|| SiteError::NotMaterialized(tenant_id.to_string()))?;
        if record.status != BuildStatus::Ready {
            return Err(SiteError::NotReady {
                tenant: tenant_id.to_string(),
                status: record.status.to_string(),
            });
        }

        let port = {
            let mut pending = self.pending_ports.lock();
            let port = self.ports.allocate()?;
            pending.insert(tenant_id.to_string(), port);
            port
        };

        let mut env = HashMap::new();
        env.insert(
            "TENANT_DOMAIN".to_string(),
            record.domain.clone().unwrap_or_else(|| tenant_id.to_string()),
        );
        env.insert("API_BASE_URL".to_string(), self.config.api_base_url.clone());

        let started = self
            .supervisor
            .start(tenant_id, Path::new(&record.output_dir), port, &env)
            .await;

        let process = match started {
            Ok(process) => process,
            Err(e) => {
                self.pending_ports.lock().remove(tenant_id);
                self.ports.release(port);
                let message = e.to_string();
                if let Err(err) = self.db.clear_site_runtime(tenant_id, false) {
                    warn!(tenant = %tenant_id, error = %err, "Failed to clear runtime fields");
                }
                if let Err(err) = self.db.set_site_last_error(tenant_id, Some(&message)) {
                    warn!(tenant = %tenant_id, error = %err, "Failed to record start error");
                }
                self.record_event(tenant_id, SiteEventKind::StartFailed, Some(&message));
                self.refresh_record(tenant_id);
                return Err(e.into());
            }
        };

        let url = process.url.clone();
        self.running.insert(
            tenant_id.to_string(),
            RunningSite {
                process: process.clone(),
                idle: None,
            },
        );
        self.pending_ports.lock().remove(tenant_id);

        if let Err(e) = self.db.set_site_running(tenant_id, port, &url) {
            error!(tenant = %tenant_id, error = %e, "Failed to persist running site, stopping it");
            self.running.remove(tenant_id);
            self.supervisor.stop(&process).await;
            self.ports.release(port);
            return Err(e.into());
        }

        self.record_event(tenant_id, SiteEventKind::Started, Some(&format!("port {}", port)));
        self.refresh_record(tenant_id);
        self.arm_idle_timer(tenant_id);

        info!(tenant = %tenant_id, port, pid = process.pid, url = %url, "Site started");
        self.emit(SiteEvent::Started {
            tenant_id: tenant_id.to_string(),
            port,
            url: url.clone(),
        });

        Ok(StartOutcome {
            url,
            port,
            already_running: false,
        })
    }

    /// Stop a running site. Reports `NothingToStop` when nothing runs
    pub async fn stop(&self, tenant_id: &str) -> Result<StopOutcome, SiteError> {
        validate_tenant_id(tenant_id)?;
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;
        self.stop_locked(tenant_id, StopReason::Requested).await
    }

    async fn stop_locked(&self, tenant_id: &str, reason: StopReason) -> Result<StopOutcome, SiteError> {
        let Some((_, site)) = self.running.remove(tenant_id) else {
            if self.db.clear_site_runtime(tenant_id, false)? {
                info!(tenant = %tenant_id, "Cleared stale runtime fields");
                self.refresh_record(tenant_id);
            }
            debug!(tenant = %tenant_id, "Nothing to stop");
            return Ok(StopOutcome::NothingToStop);
        };

        if let Some(token) = site.idle {
            token.cancel();
        }

        let port = site.process.port;
        info!(tenant = %tenant_id, port, reason = reason.as_str(), "Stopping site");
        self.supervisor.stop(&site.process).await;
        self.ports.release(port);

        self.db.clear_site_runtime(tenant_id, true)?;
        self.record_event(tenant_id, SiteEventKind::Stopped, Some(reason.as_str()));
        self.refresh_record(tenant_id);

        self.emit(SiteEvent::Stopped {
            tenant_id: tenant_id.to_string(),
            port,
            reason,
        });

        Ok(StopOutcome::Stopped { port })
    }

    /// Stop (if running), rebuild, and start again if it was running
    pub async fn redeploy(self: &Arc<Self>, tenant_id: &str) -> Result<RedeployOutcome, SiteError> {
        validate_tenant_id(tenant_id)?;
        let manager = Arc::clone(self);
        let tenant_id = tenant_id.to_string();
        let handle = tokio::spawn(async move {
            let lock = manager.tenant_lock(&tenant_id);
            let _guard = lock.lock().await;
            manager.redeploy_locked(&tenant_id).await
        });
        join_locked(handle).await
    }

    async fn redeploy_locked(self: &Arc<Self>, tenant_id: &str) -> Result<RedeployOutcome, SiteError> {
        let was_running = self.running.contains_key(tenant_id);
        if was_running {
            self.stop_locked(tenant_id, StopReason::Redeploy).await?;
        }

        let output_dir = self.build_locked(tenant_id).await?;

        let restarted = if was_running {
            Some(self.start_locked(tenant_id).await?)
        } else {
            None
        };

        Ok(RedeployOutcome {
            output_dir,
            restarted,
        })
    }

    /// Reset the idle timer of a running site. Returns false if it isn't running
    pub fn touch(self: &Arc<Self>, tenant_id: &str) -> bool {
        if !self.running.contains_key(tenant_id) {
            return false;
        }
        self.arm_idle_timer(tenant_id);
        true
    }

    pub fn is_running(&self, tenant_id: &str) -> bool {
        self.running.contains_key(tenant_id)
    }

    /// Replace the URL of a running site, e.g. once it is routed publicly.
    /// Returns false if the site isn't running
    pub fn set_url(&self, tenant_id: &str, url: &str) -> anyhow::Result<bool> {
        {
            let Some(mut site) = self.running.get_mut(tenant_id) else {
                return Ok(false);
            };
            site.process.url = url.to_string();
        }
        self.db.set_site_url(tenant_id, url)?;
        self.refresh_record(tenant_id);
        Ok(true)
    }

    // ==================== Idle Timeout ====================

    pub fn auto_shutdown_enabled(&self) -> bool {
        self.auto_shutdown.load(Ordering::SeqCst)
    }

    /// Enable or disable idle auto-shutdown for every site
    pub fn set_auto_shutdown(self: &Arc<Self>, enabled: bool) {
        let previous = self.auto_shutdown.swap(enabled, Ordering::SeqCst);
        let tenant_ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();

        if enabled {
            if !previous {
                for tenant_id in &tenant_ids {
                    self.arm_idle_timer(tenant_id);
                }
            }
        } else {
            for tenant_id in &tenant_ids {
                if let Some(mut site) = self.running.get_mut(tenant_id) {
                    if let Some(token) = site.idle.take() {
                        token.cancel();
                    }
                }
            }
        }

        info!(enabled, running = tenant_ids.len(), "Auto-shutdown updated");
    }

    fn arm_idle_timer(self: &Arc<Self>, tenant_id: &str) {
        if !self.auto_shutdown_enabled() {
            return;
        }

        let token = CancellationToken::new();
        {
            let Some(mut site) = self.running.get_mut(tenant_id) else {
                return;
            };
            if let Some(previous) = site.idle.replace(token.clone()) {
                previous.cancel();
            }
        }

        let manager = Arc::clone(self);
        let tenant_id = tenant_id.to_string();
        let timeout = self.config.idle_timeout();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    manager.expire_idle(&tenant_id, &token).await;
                }
            }
        });
    }

    async fn expire_idle(&self, tenant_id: &str, token: &CancellationToken) {
        let lock = self.tenant_lock(tenant_id);
        let _guard = lock.lock().await;

        // Touched, stopped or disabled while waiting for the lock
        if token.is_cancelled() {
            return;
        }

        info!(tenant = %tenant_id, idle_secs = self.config.idle_timeout_secs, "Idle timeout reached");
        if let Err(e) = self.stop_locked(tenant_id, StopReason::IdleTimeout).await {
            warn!(tenant = %tenant_id, error = %e, "Failed to stop idle site");
        }
    }

    // ==================== Crash Cleanup ====================

    /// Handle exit notifications from the supervisor until the channel closes
    pub async fn watch_exits(self: Arc<Self>, mut exits: mpsc::UnboundedReceiver<ProcessExit>) {
        while let Some(exit) = exits.recv().await {
            self.handle_exit(exit).await;
        }
    }

    /// Clean up after a process that exited on its own
    pub async fn handle_exit(&self, exit: ProcessExit) {
        let lock = self.tenant_lock(&exit.tenant_id);
        let _guard = lock.lock().await;
        self.discard_exited(&exit.tenant_id, Some(&exit)).await;
    }

    async fn discard_exited(&self, tenant_id: &str, exit: Option<&ProcessExit>) {
        let current = self
            .running
            .get(tenant_id)
            .map(|s| (s.process.pid, s.process.port));
        let Some((pid, port)) = current else {
            debug!(tenant = %tenant_id, "Exit for a site that is no longer running");
            return;
        };
        if let Some(exit) = exit {
            if exit.pid != pid {
                debug!(tenant = %tenant_id, pid = exit.pid, current = pid, "Ignoring exit of a replaced process");
                return;
            }
        }

        if let Some((_, site)) = self.running.remove(tenant_id) {
            if let Some(token) = site.idle {
                token.cancel();
            }
        }
        self.ports.release(port);

        let code = exit.and_then(|e| e.code);
        let message = match code {
            Some(code) => format!("process exited unexpectedly with code {}", code),
            None => "process exited unexpectedly".to_string(),
        };
        warn!(tenant = %tenant_id, pid, port, ?code, "Cleaning up exited site");

        if let Err(e) = self.db.clear_site_runtime(tenant_id, true) {
            warn!(tenant = %tenant_id, error = %e, "Failed to clear runtime fields");
        }
        if let Err(e) = self.db.set_site_last_error(tenant_id, Some(&message)) {
            warn!(tenant = %tenant_id, error = %e, "Failed to record exit");
        }
        self.record_event(tenant_id, SiteEventKind::Exited, Some(&message));
        self.refresh_record(tenant_id);

        self.emit(SiteEvent::Exited {
            tenant_id: tenant_id.to_string(),
            port,
            code,
        });
    }

    // ==================== Reconciliation ====================

    /// Bring durable records, live processes and port reservations in line
    pub async fn reconcile(&self) -> anyhow::Result<ReconcileReport> {
        let records = self.db.list_sites()?;
        let mut report = ReconcileReport {
            records: records.len(),
            ..Default::default()
        };

        for record in &records {
            let tenant_id = record.tenant_id.as_str();
            let lock = self.tenant_lock(tenant_id);
            // An operation in flight owns this tenant; look again next pass
            let Ok(_guard) = lock.try_lock() else {
                debug!(tenant = %tenant_id, "Skipping busy tenant");
                continue;
            };

            let live = self
                .running
                .get(tenant_id)
                .map(|s| (s.process.port, s.process.url.clone()));

            match live {
                None if record.port.is_some() || record.url.is_some() => {
                    self.db.clear_site_runtime(tenant_id, false)?;
                    self.record_event(tenant_id, SiteEventKind::Corrected, Some("no live process"));
                    warn!(tenant = %tenant_id, port = ?record.port, "Cleared runtime fields without a live process");
                    report.corrected.push(tenant_id.to_string());
                    self.emit(SiteEvent::Corrected {
                        tenant_id: tenant_id.to_string(),
                    });
                }
                Some((port, url)) if record.port != Some(port) => {
                    self.db.restore_site_runtime(tenant_id, port, &url)?;
                    info!(tenant = %tenant_id, port, "Restored runtime fields for live site");
                    report.restored.push(tenant_id.to_string());
                }
                _ => {}
            }

            if record.status == BuildStatus::Building && !self.building.contains(tenant_id) {
                self.db.mark_site_error(tenant_id, "build interrupted")?;
                self.record_event(tenant_id, SiteEventKind::Interrupted, None);
                warn!(tenant = %tenant_id, "Marked interrupted build as failed");
                report.interrupted.push(tenant_id.to_string());
            }
        }

        {
            let pending = self.pending_ports.lock();
            let mut live: HashSet<u16> = self.running.iter().map(|s| s.process.port).collect();
            live.extend(pending.values().copied());
            report.released_ports = self.ports.retain(&live);
        }
        if !report.released_ports.is_empty() {
            warn!(ports = ?report.released_ports, "Released port reservations without a live process");
        }

        self.records.clear();
        for record in self.db.list_sites()? {
            self.records.insert(record.tenant_id.clone(), record);
        }

        debug!(
            records = report.records,
            corrected = report.corrected.len(),
            restored = report.restored.len(),
            interrupted = report.interrupted.len(),
            "Reconciliation complete"
        );
        Ok(report)
    }

    /// Reconcile on every interval until shutdown
    pub async fn run_reconcile_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.reconcile_interval();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Reconciliation failed, retrying next interval");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    // ==================== Status / Shutdown ====================

    pub fn status(&self) -> StatusReport {
        let mut running: Vec<RunningSiteInfo> = self
            .running
            .iter()
            .map(|entry| RunningSiteInfo {
                tenant_id: entry.key().clone(),
                pid: entry.process.pid,
                port: entry.process.port,
                url: entry.process.url.clone(),
                started_at: entry.process.started_at,
            })
            .collect();
        running.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        let mut all: Vec<SiteRecord> = self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        StatusReport { running, all }
    }

    /// Current durable record of a site
    pub fn site(&self, tenant_id: &str) -> anyhow::Result<Option<SiteRecord>> {
        self.db.get_site(tenant_id)
    }

    /// Stop every running site concurrently
    pub async fn shutdown(&self) {
        let tenant_ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        if tenant_ids.is_empty() {
            return;
        }

        info!(count = tenant_ids.len(), "Stopping all sites");
        futures::future::join_all(tenant_ids.iter().map(|tenant_id| async move {
            let lock = self.tenant_lock(tenant_id);
            let _guard = lock.lock().await;
            if let Err(e) = self.stop_locked(tenant_id, StopReason::Shutdown).await {
                warn!(tenant = %tenant_id, error = %e, "Failed to stop site during shutdown");
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::runtime;
    use crate::supervisor::SupervisorConfig;
    use std::time::Duration;
    use crate::tenants::{StaticTenant, StaticTenants};

    const DELAYED_READY: &str = "sleep 1; echo Ready; exec sleep 30";

    fn manager(root: &Path) -> Arc<SiteManager> {
        manager_with(root, "echo Ready; exec sleep 30")
    }

    fn manager_with(root: &Path, script: &str) -> Arc<SiteManager> {
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
        entries.insert(
            "t2".to_string(),
            StaticTenant {
                display_name: "Harbor View".to_string(),
                domain: Some("harbor\nAPI_BASE_URL=http://evil".to_string()),
                contact_email: None,
                contact_phone: None,
                listings: Vec::new(),
            },
        );
        entries.insert(
            "t3".to_string(),
            StaticTenant {
                display_name: "Lakeside".to_string(),
                domain: Some("LakeSide".to_string()),
                contact_email: None,
                contact_phone: None,
                listings: Vec::new(),
            },
        );

        let runtime = runtime::detect();
        let (supervisor, exits) =
            ProcessSupervisor::new(SupervisorConfig::from_sites(&sites), Arc::clone(&runtime));
        let manager = SiteManager::new(
            sites.clone(),
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(StaticTenants::new(entries)),
            SiteBuilder::new(sites, runtime),
            Arc::new(PortAllocator::new(3010, 3012)),
            supervisor,
        );
        tokio::spawn(Arc::clone(&manager).watch_exits(exits));
        manager
    }

    #[tokio::test]
    async fn test_unknown_tenant_creates_no_record() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());

        let err = manager.materialize("ghost").await.unwrap_err();
        assert!(matches!(err, SiteError::UnknownTenant(_)));
        assert!(manager.site("ghost").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_tenant_id_rejected() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());

        let err = manager.materialize("../t1").await.unwrap_err();
        assert!(matches!(err, SiteError::Build(_)));
    }

    #[tokio::test]
    async fn test_invalid_domain_creates_no_record() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());

        let err = manager.materialize("t2").await.unwrap_err();
        assert!(matches!(err, SiteError::Build(BuildError::InvalidDomain(_))));
        assert_eq!(err.code(), ErrorCode::BuildFailed);
        assert!(manager.site("t2").unwrap().is_none());
        assert!(!root.path().join("sites/t2/.env.local").exists());
        assert!(manager.database().get_site_events("t2", 10).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_domain_stored_lowercase() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());

        manager.materialize("t3").await.unwrap();
        let record = manager.site("t3").unwrap().unwrap();
        assert_eq!(record.domain.as_deref(), Some("lakeside"));

        let env = std::fs::read_to_string(root.path().join("sites/t3/.env.local")).unwrap();
        assert!(env.contains("TENANT_DOMAIN=lakeside\n"));
    }

    #[tokio::test]
    async fn test_start_requires_materialize() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());

        let err = manager.start("t1").await.unwrap_err();
        assert!(matches!(err, SiteError::NotMaterialized(_)));
        assert!(manager.ports().in_use().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_process() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());

        assert_eq!(manager.stop("t1").await.unwrap(), StopOutcome::NothingToStop);
        assert_eq!(manager.stop("t1").await.unwrap(), StopOutcome::NothingToStop);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_materialize_start_stop() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let mut events = manager.subscribe();

        let outcome = manager.materialize("t1").await.unwrap();
        assert_eq!(
            outcome,
            MaterializeOutcome::Built {
                output_dir: root.path().join("sites/t1")
            }
        );
        assert_eq!(
            manager.materialize("t1").await.unwrap(),
            MaterializeOutcome::AlreadyReady { port: None }
        );

        let started = manager.start("t1").await.unwrap();
        assert_eq!(started.port, 3010);
        assert!(!started.already_running);
        assert!(matches!(events.recv().await.unwrap(), SiteEvent::Started { port: 3010, .. }));

        assert_eq!(
            manager.materialize("t1").await.unwrap(),
            MaterializeOutcome::AlreadyReady { port: Some(3010) }
        );

        let status = manager.status();
        assert_eq!(status.running.len(), 1);
        assert_eq!(status.all.len(), 1);
        assert_eq!(status.all[0].port, Some(3010));

        assert_eq!(
            manager.stop("t1").await.unwrap(),
            StopOutcome::Stopped { port: 3010 }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SiteEvent::Stopped {
                tenant_id: "t1".to_string(),
                port: 3010,
                reason: StopReason::Requested
            }
        );
        assert!(manager.ports().in_use().is_empty());

        let record = manager.site("t1").unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Ready);
        assert!(record.port.is_none());
        assert!(record.last_stopped_at.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_start_leaves_no_stray_port() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager_with(root.path(), DELAYED_READY);
        manager.materialize("t1").await.unwrap();

        // Caller gives up while the process is still starting
        let dropped = tokio::time::timeout(Duration::from_millis(200), manager.start("t1")).await;
        assert!(dropped.is_err());

        // The start still runs to completion behind the tenant lock
        let stopped = manager.stop("t1").await.unwrap();
        assert_eq!(stopped, StopOutcome::Stopped { port: 3010 });
        assert!(manager.ports().in_use().is_empty());

        let report = manager.reconcile().await.unwrap();
        assert!(report.released_ports.is_empty());
        assert!(manager.ports().in_use().is_empty());

        let restarted = manager.start("t1").await.unwrap();
        assert_eq!(restarted.port, 3010);
        manager.shutdown().await;
        assert!(manager.ports().in_use().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_waits_for_inflight_start() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager_with(root.path(), DELAYED_READY);
        manager.materialize("t1").await.unwrap();

        let starting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.start("t1").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_running("t1"));

        let stopped = manager.stop("t1").await.unwrap();
        assert_eq!(stopped, StopOutcome::Stopped { port: 3010 });

        let started = starting.await.unwrap().unwrap();
        assert_eq!(started.port, 3010);
        assert!(!started.already_running);

        assert!(!manager.is_running("t1"));
        assert!(manager.ports().in_use().is_empty());
        let record = manager.site("t1").unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Ready);
        assert!(record.port.is_none());
        assert!(record.url.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_auto_shutdown_toggle() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        manager.materialize("t1").await.unwrap();

        manager.set_auto_shutdown(false);
        assert!(!manager.auto_shutdown_enabled());
        manager.start("t1").await.unwrap();
        assert!(manager.running.get("t1").unwrap().idle.is_none());

        manager.set_auto_shutdown(true);
        assert!(manager.running.get("t1").unwrap().idle.is_some());
        assert!(manager.touch("t1"));
        assert!(!manager.touch("t2"));

        manager.shutdown().await;
        assert!(!manager.is_running("t1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reconcile_marks_interrupted_build() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        manager
            .database()
            .upsert_site_building("t1", "/tmp/never-built")
            .unwrap();
        manager.ports().reserve(3011);

        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.interrupted, vec!["t1"]);
        assert_eq!(report.released_ports, vec![3011]);

        let record = manager.site("t1").unwrap().unwrap();
        assert_eq!(record.status, BuildStatus::Error);
        assert_eq!(record.last_error.as_deref(), Some("build interrupted"));
        assert_eq!(manager.status().all.len(), 1);
    }
}
