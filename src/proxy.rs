//! Reverse-proxy control plane
//!
//! Each live site gets one rule file, `<rules_dir>/<tenant_id>.conf`, holding
//! a virtual-host block that forwards its public hostname to
//! `localhost:<port>`. Files whose names start with `_` belong to the
//! operator (for example the `_default.conf` catch-all) and are never
//! touched by sync.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::db::Database;
use crate::error::ProxyError;
use crate::pipeline::validate_tenant_id;
use crate::runtime::ProcessRuntime;

/// First token of the header line in every managed rule file
const MANAGED_HEADER: &str = "# previewgate";

/// Catch-all rule for unmatched hostnames
pub const DEFAULT_RULE_FILE: &str = "_default.conf";

const RULE_EXTENSION: &str = "conf";

fn label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("valid label regex"))
}

/// Check every dot-separated label of a hostname
pub fn validate_domain(domain: &str) -> Result<(), ProxyError> {
    if domain.is_empty() || domain.len() > 253 || !domain.split('.').all(|l| label_regex().is_match(l)) {
        return Err(ProxyError::InvalidHost(domain.to_string()));
    }
    Ok(())
}

/// Tenant ids name rule files, so they must stay inside the rules directory
fn check_tenant_id(tenant_id: &str) -> Result<(), ProxyError> {
    validate_tenant_id(tenant_id).map_err(|_| ProxyError::InvalidTenantId(tenant_id.to_string()))
}

pub fn validate_port(port: u16) -> Result<(), ProxyError> {
    if port < 1024 {
        return Err(ProxyError::InvalidPort(port));
    }
    Ok(())
}

/// Routing rule for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyRule {
    pub tenant_id: String,
    pub host: String,
    pub port: u16,
}

impl ProxyRule {
    /// Render the rule file. Host and port must already be validated
    pub fn render(&self, listen_port: u16) -> String {
        format!(
            "{header} tenant={tenant} host={host} port={port}
server {{
    listen {listen};
    server_name {host};

    location / {{
        proxy_pass http://localhost:{port};
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection \"upgrade\";
    }}
}}
",
            header = MANAGED_HEADER,
            tenant = self.tenant_id,
            host = self.host,
            port = self.port,
            listen = listen_port,
        )
    }

    /// Read the managed header of a rule file
    pub fn parse(contents: &str) -> Option<ProxyRule> {
        let header = contents.lines().next()?.strip_prefix(MANAGED_HEADER)?;

        let mut fields: HashMap<&str, &str> = HashMap::new();
        for pair in header.split_whitespace() {
            let (key, value) = pair.split_once('=')?;
            fields.insert(key, value);
        }

        Some(ProxyRule {
            tenant_id: fields.get("tenant")?.to_string(),
            host: fields.get("host")?.to_string(),
            port: fields.get("port")?.parse().ok()?,
        })
    }
}

fn default_rule(listen_port: u16) -> String {
    format!(
        "{header} default
server {{
    listen {listen} default_server;
    server_name _;
    return 404;
}}
",
        header = MANAGED_HEADER,
        listen = listen_port,
    )
}

/// Changes made by one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Live records that could not be turned into a valid rule
    pub skipped: Vec<String>,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        !(self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Writes and removes rule files and reloads the proxy
pub struct ProxyControlPlane {
    config: ProxyConfig,
    db: Arc<Database>,
    runtime: Arc<dyn ProcessRuntime>,
    write_lock: Mutex<()>,
}

impl ProxyControlPlane {
    pub fn new(config: ProxyConfig, db: Arc<Database>, runtime: Arc<dyn ProcessRuntime>) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            runtime,
            write_lock: Mutex::new(()),
        })
    }

    pub fn production(&self) -> bool {
        self.config.production
    }

    /// Public hostname for a tenant
    pub fn hostname(&self, tenant_id: &str, domain: Option<&str>) -> Result<String, ProxyError> {
        let label = domain.unwrap_or(tenant_id).to_lowercase();
        let host = if self.config.base_domain.is_empty() {
            label
        } else {
            format!("{}.{}", label, self.config.base_domain.to_lowercase())
        };
        validate_domain(&host)?;
        Ok(host)
    }

    /// Public URL for a hostname, omitting the scheme's default port
    pub fn external_url(&self, host: &str) -> String {
        let default_port = match self.config.scheme.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.config.listen_port == default_port {
            format!("{}://{}", self.config.scheme, host)
        } else {
            format!("{}://{}:{}", self.config.scheme, host, self.config.listen_port)
        }
    }

    fn rule_path(&self, tenant_id: &str) -> PathBuf {
        self.config
            .rules_dir
            .join(format!("{}.{}", tenant_id, RULE_EXTENSION))
    }

    fn rule_for(&self, tenant_id: &str, domain: Option<&str>, port: u16) -> Result<ProxyRule, ProxyError> {
        check_tenant_id(tenant_id)?;
        validate_port(port)?;
        Ok(ProxyRule {
            tenant_id: tenant_id.to_string(),
            host: self.hostname(tenant_id, domain)?,
            port,
        })
    }

    /// Route a tenant's hostname to a local port and return the public URL
    pub async fn publish(&self, tenant_id: &str, port: u16) -> Result<String, ProxyError> {
        let domain = match self.db.get_site(tenant_id) {
            Ok(record) => record.and_then(|r| r.domain),
            Err(e) => {
                warn!(tenant = %tenant_id, error = %e, "Failed to read site record, using tenant id as hostname");
                None
            }
        };
        let rule = self.rule_for(tenant_id, domain.as_deref(), port)?;

        {
            let _guard = self.write_lock.lock().await;
            self.write_rule(&rule).await?;
        }
        self.reload().await?;

        let url = self.external_url(&rule.host);
        info!(tenant = %tenant_id, host = %rule.host, port, url = %url, "Published proxy rule");
        Ok(url)
    }

    /// Remove a tenant's rule. Returns true if a rule existed
    pub async fn unpublish(&self, tenant_id: &str) -> Result<bool, ProxyError> {
        check_tenant_id(tenant_id)?;
        let removed = {
            let _guard = self.write_lock.lock().await;
            self.remove_rule(tenant_id).await?
        };

        if removed {
            info!(tenant = %tenant_id, "Removed proxy rule");
            self.reload().await?;
        }
        Ok(removed)
    }

    /// Write the catch-all rule if it does not exist yet
    pub async fn ensure_default_rule(&self) -> Result<bool, ProxyError> {
        let path = self.config.rules_dir.join(DEFAULT_RULE_FILE);
        let _guard = self.write_lock.lock().await;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }

        write_atomic(
            self.config.rules_dir.clone(),
            path,
            default_rule(self.config.listen_port),
        )
        .await
        .map_err(|source| ProxyError::Write {
            tenant: "_default".to_string(),
            source,
        })?;
        info!(dir = %self.config.rules_dir.display(), "Wrote default proxy rule");
        Ok(true)
    }

    /// Make the rule files match the set of live sites
    pub async fn sync_all(&self) -> anyhow::Result<SyncReport> {
        let live = self.db.list_live_sites()?;
        let mut report = SyncReport::default();

        let mut desired: HashMap<String, ProxyRule> = HashMap::new();
        for record in live {
            let Some(port) = record.port else { continue };
            match self.rule_for(&record.tenant_id, record.domain.as_deref(), port) {
                Ok(rule) => {
                    desired.insert(record.tenant_id.clone(), rule);
                }
                Err(e) => {
                    warn!(tenant = %record.tenant_id, error = %e, "Skipping live site with invalid rule");
                    report.skipped.push(record.tenant_id);
                }
            }
        }

        {
            let _guard = self.write_lock.lock().await;
            let existing = self.read_rules().await?;

            let mut tenants: Vec<&String> = desired.keys().collect();
            tenants.sort();
            for tenant_id in tenants {
                let rule = &desired[tenant_id];
                let expected = rule.render(self.config.listen_port);
                match existing.get(tenant_id) {
                    None => {
                        self.write_rule(rule).await?;
                        report.created.push(tenant_id.clone());
                    }
                    Some(contents) if *contents != expected => {
                        self.write_rule(rule).await?;
                        report.updated.push(tenant_id.clone());
                    }
                    Some(_) => {}
                }
            }

            let mut stale: Vec<&String> = existing.keys().filter(|t| !desired.contains_key(*t)).collect();
            stale.sort();
            for tenant_id in stale {
                if self.remove_rule(tenant_id).await? {
                    report.removed.push(tenant_id.clone());
                }
            }
        }

        if report.changed() {
            info!(
                created = report.created.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "Proxy rules synchronised"
            );
            self.reload().await?;
        } else {
            debug!("Proxy rules in sync");
        }

        Ok(report)
    }

    /// Sync on every interval until shutdown
    pub async fn run_sync_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.sync_interval();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sync_all().await {
                        warn!(error = %e, "Proxy sync failed, retrying next interval");
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

    /// Tenant rule files currently on disk, keyed by tenant id
    async fn read_rules(&self) -> anyhow::Result<HashMap<String, String>> {
        let mut rules = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&self.config.rules_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(rules),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_rule_file(&path) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('_') {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            rules.insert(stem.to_string(), contents);
        }

        Ok(rules)
    }

    async fn write_rule(&self, rule: &ProxyRule) -> Result<(), ProxyError> {
        write_atomic(
            self.config.rules_dir.clone(),
            self.rule_path(&rule.tenant_id),
            rule.render(self.config.listen_port),
        )
        .await
        .map_err(|source| ProxyError::Write {
            tenant: rule.tenant_id.clone(),
            source,
        })?;
        debug!(tenant = %rule.tenant_id, host = %rule.host, port = rule.port, "Wrote proxy rule");
        Ok(())
    }

    async fn remove_rule(&self, tenant_id: &str) -> Result<bool, ProxyError> {
        match tokio::fs::remove_file(self.rule_path(tenant_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ProxyError::Write {
                tenant: tenant_id.to_string(),
                source,
            }),
        }
    }

    /// Run the reload command. Failures are only fatal in production
    pub async fn reload(&self) -> Result<(), ProxyError> {
        if !self.config.reload {
            debug!("Proxy reload disabled");
            return Ok(());
        }

        let result = self.run_reload().await;
        match result {
            Ok(()) => {
                debug!("Proxy reloaded");
                Ok(())
            }
            Err(message) if self.config.production => Err(ProxyError::Reload(message)),
            Err(message) => {
                warn!(error = %message, "Proxy reload failed; rules apply on the next reload");
                Ok(())
            }
        }
    }

    async fn run_reload(&self) -> Result<(), String> {
        let argv = match self.config.reload_command {
            Some(ref command) => shell_words::split(command).map_err(|e| format!("invalid reload command: {}", e))?,
            None => self.runtime.default_reload_command(),
        };
        let Some((program, args)) = argv.split_first() else {
            return Err("empty reload command".to_string());
        };

        let mut cmd = Command::new(self.runtime.resolve_program(program));
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.config.reload_timeout();
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| format!("reload timed out after {}s", timeout.as_secs()))?
            .map_err(|e| format!("failed to run '{}': {}", program, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "'{}' exited with code {}: {}",
                program,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

/// Write via a temp file in the same directory, then rename into place
async fn write_atomic(dir: PathBuf, path: PathBuf, contents: String) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir)?;
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

fn is_rule_file(path: &Path) -> bool {
    path.extension().map(|e| e == RULE_EXTENSION).unwrap_or(false)
}
