use previewgate::admin::{AdminServer, PKG_NAME, VERSION};
use previewgate::binder::SiteService;
use previewgate::config::Config;
use previewgate::db::Database;
use previewgate::lifecycle::SiteManager;
use previewgate::pipeline::SiteBuilder;
use previewgate::ports::PortAllocator;
use previewgate::proxy::ProxyControlPlane;
use previewgate::supervisor::{ProcessSupervisor, SupervisorConfig};
use previewgate::{runtime, tenants};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("previewgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime = runtime::detect();
    info!(runtime = runtime.name(), "Process runtime selected");

    let db = Arc::new(Database::open(&config.database.path)?);
    let ports = Arc::new(PortAllocator::new(config.ports.low, config.ports.high));
    let (supervisor, exits) = ProcessSupervisor::new(
        SupervisorConfig::from_sites(&config.sites),
        Arc::clone(&runtime),
    );
    let builder = SiteBuilder::new(config.sites.clone(), Arc::clone(&runtime));
    let tenant_source = tenants::from_config(&config.tenants)?;

    let manager = SiteManager::new(
        config.sites.clone(),
        Arc::clone(&db),
        tenant_source,
        builder,
        ports,
        supervisor,
    );
    let proxy = ProxyControlPlane::new(config.proxy.clone(), Arc::clone(&db), Arc::clone(&runtime));
    let service = SiteService::new(
        Arc::clone(&manager),
        Arc::clone(&proxy),
        config.sites.redeploy_ready_sites,
    );

    // Nothing runs yet, so boot reconciliation clears every stale record
    let report = manager.reconcile().await?;
    info!(
        records = report.records,
        corrected = report.corrected.len(),
        interrupted = report.interrupted.len(),
        "Boot reconciliation complete"
    );

    if let Err(e) = proxy.ensure_default_rule().await {
        if config.proxy.production {
            return Err(e.into());
        }
        warn!(error = %e, "Failed to write default proxy rule");
    }
    match proxy.sync_all().await {
        Ok(report) => info!(
            created = report.created.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "Boot proxy sync complete"
        ),
        Err(e) if config.proxy.production => return Err(e),
        Err(e) => warn!(error = %e, "Boot proxy sync failed"),
    }

    // Background loops
    let events = manager.subscribe();
    let event_handle = tokio::spawn(Arc::clone(&service).run_event_loop(events, shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&manager).watch_exits(exits));
    let reconcile_handle = tokio::spawn(Arc::clone(&manager).run_reconcile_loop(shutdown_rx.clone()));
    let sync_handle = tokio::spawn(Arc::clone(&proxy).run_sync_loop(shutdown_rx.clone()));

    // Create admin server
    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&service), shutdown_rx.clone(), admin_token);

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP reconciles now
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reconciling sites and proxy rules...");
                    match service.reconcile().await {
                        Ok((reconciled, synced)) => {
                            info!(
                                corrected = reconciled.corrected.len(),
                                restored = reconciled.restored.len(),
                                released_ports = reconciled.released_ports.len(),
                                rules_created = synced.created.len(),
                                rules_updated = synced.updated.len(),
                                rules_removed = synced.removed.len(),
                                "Reconciliation complete"
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Reconciliation failed");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Remove routes and stop all sites
    info!("Stopping all sites...");
    service.shutdown().await;

    // Wait for loops and the admin server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = event_handle.await;
        let _ = reconcile_handle.await;
        let _ = sync_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting preview site orchestrator"
    );
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        database = %config.database.path.display(),
        "Server configuration"
    );
    info!(
        low = config.ports.low,
        high = config.ports.high,
        "Port range"
    );
    info!(
        output_root = %config.sites.output_root.display(),
        template_dir = %config.sites.template_dir.display(),
        command = %config.sites.command,
        startup_timeout_secs = config.sites.startup_timeout_secs,
        idle_timeout_secs = config.sites.idle_timeout_secs,
        auto_shutdown = config.sites.auto_shutdown,
        "Site settings"
    );
    info!(
        rules_dir = %config.proxy.rules_dir.display(),
        base_domain = %config.proxy.base_domain,
        listen_port = config.proxy.listen_port,
        reload = config.proxy.reload,
        production = config.proxy.production,
        "Proxy settings"
    );
    info!(
        source = if config.tenants.api_url.is_some() { "http" } else { "static" },
        static_tenants = config.tenants.entries.len(),
        "Tenant directory"
    );
}
