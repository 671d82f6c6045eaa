use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tenants::StaticTenant;

/// Global configuration for the orchestrator
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin server and daemon settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Durable record store
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Port range handed out to site processes
    #[serde(default)]
    pub ports: PortRangeConfig,

    /// Site build and process settings
    #[serde(default)]
    pub sites: SitesConfig,

    /// Reverse proxy control plane
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Tenant directory
    #[serde(default)]
    pub tenants: TenantsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortRangeConfig {
    /// Lowest port handed out (inclusive)
    #[serde(default = "default_port_low")]
    pub low: u16,

    /// Highest port handed out (inclusive)
    #[serde(default = "default_port_high")]
    pub high: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            low: default_port_low(),
            high: default_port_high(),
        }
    }
}

/// Settings for building and running tenant sites
///
/// # Security Warning
///
/// `command`, `install_command` and `build_command` are executed directly.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct SitesConfig {
    /// Directory holding one output directory per tenant
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,

    /// Shared template tree copied into every site
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Extension marking files to render (without the dot)
    #[serde(default = "default_template_extension")]
    pub template_extension: String,

    /// File and directory names skipped when copying the template
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Read-only dependency cache linked into each site (optional)
    pub shared_deps_dir: Option<PathBuf>,

    /// Name of the linked dependency directory inside a site
    #[serde(default = "default_deps_link_name")]
    pub deps_link_name: String,

    /// Command used when the shared cache is unavailable
    #[serde(default = "default_install_command")]
    pub install_command: String,

    /// Hard limit for the install command
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// Optional build step run after dependencies (e.g. "npm run build")
    pub build_command: Option<String>,

    /// Hard limit for the build step
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Environment file written into each site
    #[serde(default = "default_env_file")]
    pub env_file: String,

    /// Data file holding tenant metadata and listings
    #[serde(default = "default_data_file")]
    pub data_file: String,

    /// Program that serves a built site
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments for the site program
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment for site processes
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Substring on stdout that signals the server is listening
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,

    /// Substring on stderr that signals a bind conflict
    #[serde(default = "default_port_in_use_marker")]
    pub port_in_use_marker: String,

    /// Time allowed for the readiness marker to appear
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period between the termination signal and a forced kill
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Idle time after which a running site is stopped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Whether idle sites are stopped automatically
    #[serde(default = "default_true")]
    pub auto_shutdown: bool,

    /// Interval between reconciliation passes
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Upstream API base URL handed to sites
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Re-publish the proxy rule when materialize finds a ready site
    #[serde(default = "default_true")]
    pub redeploy_ready_sites: bool,
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            template_dir: default_template_dir(),
            template_extension: default_template_extension(),
            exclude: default_exclude(),
            shared_deps_dir: None,
            deps_link_name: default_deps_link_name(),
            install_command: default_install_command(),
            install_timeout_secs: default_install_timeout(),
            build_command: None,
            build_timeout_secs: default_build_timeout(),
            env_file: default_env_file(),
            data_file: default_data_file(),
            command: default_command(),
            args: default_args(),
            env: HashMap::new(),
            ready_marker: default_ready_marker(),
            port_in_use_marker: default_port_in_use_marker(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            idle_timeout_secs: default_idle_timeout(),
            auto_shutdown: true,
            reconcile_interval_secs: default_reconcile_interval(),
            api_base_url: default_api_base_url(),
            redeploy_ready_sites: true,
        }
    }
}

impl SitesConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Directory holding one rule file per tenant
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,

    /// Domain appended to tenant hostnames (empty for bare labels)
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Scheme used in public URLs
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Port the proxy listens on
    #[serde(default = "default_proxy_listen_port")]
    pub listen_port: u16,

    /// Whether the proxy is reloaded after rule changes
    #[serde(default = "default_true")]
    pub reload: bool,

    /// Reload command (default depends on the platform)
    pub reload_command: Option<String>,

    /// Hard limit for the reload command
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_secs: u64,

    /// Interval between rule synchronisation passes
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Production posture: reload and write failures are fatal
    #[serde(default)]
    pub production: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rules_dir: default_rules_dir(),
            base_domain: default_base_domain(),
            scheme: default_scheme(),
            listen_port: default_proxy_listen_port(),
            reload: true,
            reload_command: None,
            reload_timeout_secs: default_reload_timeout(),
            sync_interval_secs: default_sync_interval(),
            production: false,
        }
    }
}

impl ProxyConfig {
    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TenantsConfig {
    /// Base URL of the tenant API. When set, tenants are fetched over HTTP
    pub api_url: Option<String>,

    /// Timeout for tenant API requests
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Tenants declared inline, keyed by tenant id
    #[serde(default)]
    pub entries: HashMap<String, StaticTenant>,
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9800
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/previewgate.db")
}

fn default_port_low() -> u16 {
    3010
}

fn default_port_high() -> u16 {
    3099
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./sites")
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("./template")
}

fn default_template_extension() -> String {
    "tmpl".to_string()
}

fn default_exclude() -> Vec<String> {
    ["node_modules", ".next", "dist", "build", ".git", ".cache"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_deps_link_name() -> String {
    "node_modules".to_string()
}

fn default_install_command() -> String {
    "npm install --no-audit --no-fund".to_string()
}

fn default_install_timeout() -> u64 {
    600 // 10 minutes
}

fn default_build_timeout() -> u64 {
    600
}

fn default_env_file() -> String {
    ".env.local".to_string()
}

fn default_data_file() -> String {
    "site-data.json".to_string()
}

fn default_command() -> String {
    "npm".to_string()
}

fn default_args() -> Vec<String> {
    vec!["run".to_string(), "start".to_string()]
}

fn default_ready_marker() -> String {
    "Ready".to_string()
}

fn default_port_in_use_marker() -> String {
    "EADDRINUSE".to_string()
}

fn default_startup_timeout() -> u64 {
    120 // 2 minutes
}

fn default_shutdown_grace_period() -> u64 {
    2
}

fn default_idle_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_api_base_url() -> String {
    "http://localhost:4000/api".to_string()
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("./proxy/sites")
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_proxy_listen_port() -> u16 {
    80
}

fn default_reload_timeout() -> u64 {
    15
}

fn default_sync_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.low < 1024 {
            errors.push(format!("ports: 'low' ({}) must be at least 1024", self.ports.low));
        }
        if self.ports.low > self.ports.high {
            errors.push(format!(
                "ports: 'low' ({}) must not exceed 'high' ({})",
                self.ports.low, self.ports.high
            ));
        }
        if self.sites.command.trim().is_empty() {
            errors.push("sites: 'command' must not be empty".to_string());
        }
        if self.sites.ready_marker.is_empty() {
            errors.push("sites: 'ready_marker' must not be empty".to_string());
        }
        if self.sites.template_extension.is_empty() || self.sites.template_extension.contains('.') {
            errors.push("sites: 'template_extension' must be a bare extension like \"tmpl\"".to_string());
        }
        if let Err(e) = shell_words::split(&self.sites.install_command) {
            errors.push(format!("sites: invalid 'install_command': {}", e));
        }
        if let Some(ref build) = self.sites.build_command {
            if let Err(e) = shell_words::split(build) {
                errors.push(format!("sites: invalid 'build_command': {}", e));
            }
        }
        if self.sites.reconcile_interval_secs == 0 {
            errors.push("sites: 'reconcile_interval_secs' must be greater than 0".to_string());
        }
        if self.proxy.sync_interval_secs == 0 {
            errors.push("proxy: 'sync_interval_secs' must be greater than 0".to_string());
        }
        if let Some(ref reload) = self.proxy.reload_command {
            if let Err(e) = shell_words::split(reload) {
                errors.push(format!("proxy: invalid 'reload_command': {}", e));
            }
        }
        if !self.proxy.base_domain.is_empty() {
            if let Err(e) = crate::proxy::validate_domain(&self.proxy.base_domain) {
                errors.push(format!("proxy: invalid 'base_domain': {}", e));
            }
        }
        for (id, tenant) in &self.tenants.entries {
            if tenant.display_name.trim().is_empty() {
                errors.push(format!("Tenant '{}': 'display_name' must not be empty", id));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
admin_port = 9100
admin_token = "secret"

[database]
path = "/var/lib/previewgate/sites.db"

[ports]
low = 4000
high = 4010

[sites]
output_root = "/srv/sites"
template_dir = "/srv/template"
command = "node"
args = ["server.js"]
ready_marker = "listening"
idle_timeout_secs = 60

[sites.env]
NODE_ENV = "production"

[proxy]
rules_dir = "/etc/nginx/previews"
base_domain = "preview.example.com"
scheme = "https"
listen_port = 443
production = true

[tenants.entries.t1]
display_name = "Seaside Cabins"
domain = "seaside"
contact_email = "host@seaside.example"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.admin_port, 9100);
        assert_eq!(config.ports.low, 4000);
        assert_eq!(config.sites.command, "node");
        assert_eq!(config.sites.args, vec!["server.js"]);
        assert_eq!(config.sites.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.sites.env.get("NODE_ENV"), Some(&"production".to_string()));
        assert_eq!(config.proxy.base_domain, "preview.example.com");
        assert!(config.proxy.production);
        let tenant = config.tenants.entries.get("t1").unwrap();
        assert_eq!(tenant.domain.as_deref(), Some("seaside"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.admin_port, 9800);
        assert_eq!(config.ports.low, 3010);
        assert_eq!(config.ports.high, 3099);
        assert_eq!(config.sites.startup_timeout(), Duration::from_secs(120));
        assert_eq!(config.sites.shutdown_grace_period(), Duration::from_secs(2));
        assert_eq!(config.sites.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.sites.reconcile_interval(), Duration::from_secs(60));
        assert!(config.sites.auto_shutdown);
        assert!(config.sites.redeploy_ready_sites);
        assert_eq!(config.sites.exclude.len(), 6);
        assert_eq!(config.proxy.sync_interval(), Duration::from_secs(10));
        assert!(!config.proxy.production);
        assert!(config.tenants.api_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_port_range() {
        let toml = r#"
[ports]
low = 5000
high = 4000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must not exceed"));
    }

    #[test]
    fn test_validate_privileged_ports() {
        let toml = r#"
[ports]
low = 80
high = 90
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("at least 1024"));
    }

    #[test]
    fn test_validate_reports_all_errors() {
        let toml = r#"
[sites]
command = ""
template_extension = ".tmpl"
install_command = "npm install 'unterminated"

[proxy]
base_domain = "bad_domain!"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'command' must not be empty"));
        assert!(err.contains("template_extension"));
        assert!(err.contains("install_command"));
        assert!(err.contains("base_domain"));
    }

    #[test]
    fn test_empty_base_domain_is_allowed() {
        let toml = r#"
[proxy]
base_domain = ""
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
    }
}
