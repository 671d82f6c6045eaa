//! Site build pipeline
//!
//! Turns the shared template into a runnable site directory for one tenant:
//! 1. Wipe and recreate `<output_root>/<tenant_id>`
//! 2. Copy the template tree, skipping excluded names
//! 3. Render `*.tmpl` files against the tenant's placeholder values
//! 4. Write the site data file
//! 5. Link the shared dependency cache, or run the install command
//! 6. Run the optional build command
//! 7. Write the environment file

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SitesConfig;
use crate::error::BuildError;
use crate::runtime::ProcessRuntime;
use crate::tenants::Tenant;

/// Number of output lines kept for failure messages
const OUTPUT_TAIL_LINES: usize = 20;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid placeholder regex"))
}

fn tenant_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid tenant id regex"))
}

/// Check that a tenant id is safe to use as a directory name
pub fn validate_tenant_id(tenant_id: &str) -> Result<(), BuildError> {
    if tenant_id_regex().is_match(tenant_id) {
        Ok(())
    } else {
        Err(BuildError::InvalidTenantId(tenant_id.to_string()))
    }
}

/// Everything the pipeline needs to know about a tenant
#[derive(Debug, Clone, Serialize)]
pub struct TenantData {
    pub tenant: Tenant,
    pub listings: Vec<serde_json::Value>,
    pub api_base_url: String,
}

impl TenantData {
    /// Routable label for the tenant, falling back to the id
    pub fn domain(&self) -> &str {
        self.tenant.domain.as_deref().unwrap_or(&self.tenant.id)
    }

    /// Flat key/value projection used for template rendering
    pub fn placeholders(&self) -> HashMap<&'static str, String> {
        let mut values = HashMap::new();
        values.insert("tenant_id", self.tenant.id.clone());
        values.insert("display_name", self.tenant.display_name.clone());
        values.insert("contact_email", self.tenant.contact_email.clone().unwrap_or_default());
        values.insert("contact_phone", self.tenant.contact_phone.clone().unwrap_or_default());
        values.insert("api_base_url", self.api_base_url.clone());
        values.insert("domain", self.domain().to_string());
        values.insert("listing_count", self.listings.len().to_string());
        values
    }
}

/// Substitute `{{ key }}` placeholders. Returns the first unknown key on failure
pub fn render(template: &str, values: &HashMap<&str, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder_regex().captures_iter(template) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = values.get(key.as_str()).ok_or_else(|| key.as_str().to_string())?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Builds tenant site directories from the shared template
pub struct SiteBuilder {
    config: SitesConfig,
    runtime: Arc<dyn ProcessRuntime>,
}

impl SiteBuilder {
    pub fn new(config: SitesConfig, runtime: Arc<dyn ProcessRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Output directory for a tenant
    pub fn output_dir(&self, tenant_id: &str) -> PathBuf {
        self.config.output_root.join(tenant_id)
    }

    /// Run the full pipeline and return the output directory
    pub async fn build(&self, tenant_id: &str, data: &TenantData) -> Result<PathBuf, BuildError> {
        validate_tenant_id(tenant_id)?;

        let template_dir = self.config.template_dir.clone();
        if !tokio::fs::metadata(&template_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(BuildError::MissingTemplate(template_dir.display().to_string()));
        }

        let out = self.output_dir(tenant_id);
        let start = Instant::now();
        info!(tenant = %tenant_id, output = %out.display(), "Building site");

        // Stage and render
        {
            let out = out.clone();
            let exclude = self.config.exclude.clone();
            let extension = self.config.template_extension.clone();
            let values: HashMap<&'static str, String> = data.placeholders();
            blocking(move || {
                stage_output_dir(&out)?;
                copy_template(&template_dir, &out, &exclude)?;
                render_templates(&out, &extension, &values)
            })
            .await?;
        }

        let site_data = serde_json::to_vec_pretty(data).map_err(io::Error::from)?;
        tokio::fs::write(out.join(&self.config.data_file), site_data).await?;

        self.install_dependencies(tenant_id, &out).await?;

        if let Some(ref build_command) = self.config.build_command {
            self.run_step(
                tenant_id,
                "build",
                build_command,
                &out,
                self.config.build_timeout(),
                BuildError::Command,
            )
            .await?;
        }

        self.write_env_file(data, &out).await?;

        info!(
            tenant = %tenant_id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Site build completed"
        );
        Ok(out)
    }

    async fn install_dependencies(&self, tenant_id: &str, out: &Path) -> Result<(), BuildError> {
        let link = out.join(&self.config.deps_link_name);

        if let Some(ref shared) = self.config.shared_deps_dir {
            if shared.is_dir() {
                match self.runtime.link_dir(shared, &link) {
                    Ok(()) => {
                        debug!(tenant = %tenant_id, shared = %shared.display(), "Linked shared dependencies");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(tenant = %tenant_id, error = %e, "Failed to link shared dependencies, installing");
                    }
                }
            } else {
                warn!(
                    tenant = %tenant_id,
                    shared = %shared.display(),
                    "Shared dependency directory missing, installing"
                );
            }
        }

        self.run_step(
            tenant_id,
            "install",
            &self.config.install_command,
            out,
            self.config.install_timeout(),
            BuildError::Install,
        )
        .await
    }

    /// Run a shell-words command in `dir`, killing it on timeout
    async fn run_step(
        &self,
        tenant_id: &str,
        step: &str,
        command: &str,
        dir: &Path,
        timeout: Duration,
        fail: fn(String) -> BuildError,
    ) -> Result<(), BuildError> {
        let argv = shell_words::split(command).map_err(|e| fail(format!("invalid command: {}", e)))?;
        let Some((program, args)) = argv.split_first() else {
            return Err(fail("empty command".to_string()));
        };

        let program = self.runtime.resolve_program(program);
        info!(tenant = %tenant_id, step, command = %command, "Running build step");

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| fail(format!("failed to spawn '{}': {}", program, e)))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(collect_output(stdout, tenant_id.to_string(), Arc::clone(&tail))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(collect_output(stderr, tenant_id.to_string(), Arc::clone(&tail))));
        }

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(tenant = %tenant_id, step, timeout_secs = timeout.as_secs(), "Build step timed out, killing");
                let _ = child.kill().await;
                for reader in readers {
                    reader.abort();
                }
                return Err(BuildError::Timeout {
                    step: step.to_string(),
                    secs: timeout.as_secs(),
                });
            }
        };

        // Readers finish at EOF; don't hang on grandchildren holding the pipes
        let _ = tokio::time::timeout(Duration::from_secs(1), futures::future::join_all(readers)).await;

        if status.success() {
            return Ok(());
        }

        let output: Vec<String> = tail.lock().iter().cloned().collect();
        let mut message = format!("'{}' exited with code {}", command, status.code().unwrap_or(-1));
        if !output.is_empty() {
            message.push_str(": ");
            message.push_str(&output.join("\n"));
        }
        Err(fail(message))
    }

    async fn write_env_file(&self, data: &TenantData, out: &Path) -> Result<(), BuildError> {
        let domain = data.domain();
        if domain.contains(['\n', '\r', '=']) {
            return Err(BuildError::InvalidDomain(domain.to_string()));
        }
        let contents = format!(
            "TENANT_ID={}\nTENANT_DOMAIN={}\nAPI_BASE_URL={}\n",
            data.tenant.id,
            data.domain(),
            data.api_base_url
        );
        tokio::fs::write(out.join(&self.config.env_file), contents).await?;
        Ok(())
    }
}

async fn collect_output<R>(reader: R, tenant_id: String, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(tenant = %tenant_id, "{}", line);
        let mut tail = tail.lock();
        if tail.len() == OUTPUT_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

async fn blocking<F>(f: F) -> Result<(), BuildError>
where
    F: FnOnce() -> Result<(), BuildError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BuildError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn stage_output_dir(out: &Path) -> Result<(), BuildError> {
    match std::fs::symlink_metadata(out) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(out)?,
        Ok(_) => std::fs::remove_file(out)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(out)?;
    Ok(())
}

fn copy_template(src: &Path, dst: &Path, exclude: &[String]) -> Result<(), BuildError> {
    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        !exclude.iter().any(|e| *e == name)
    });

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

fn render_templates(
    dir: &Path,
    extension: &str,
    values: &HashMap<&'static str, String>,
) -> Result<(), BuildError> {
    let templates: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|ext| ext == extension).unwrap_or(false))
        .collect();

    for path in templates {
        let source = std::fs::read_to_string(&path)?;
        let rel = path.strip_prefix(dir).unwrap_or(&path).display().to_string();
        let rendered = render(&source, values).map_err(|key| BuildError::Template {
            file: rel.clone(),
            message: format!("unknown placeholder '{}'", key),
        })?;

        std::fs::write(path.with_extension(""), rendered)?;
        std::fs::remove_file(&path)?;
        debug!(file = %rel, "Rendered template");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use std::fs;

    fn tenant_data() -> TenantData {
        TenantData {
            tenant: Tenant {
                id: "t1".to_string(),
                display_name: "Seaside Cabins".to_string(),
                domain: Some("seaside".to_string()),
                contact_email: Some("host@seaside.example".to_string()),
                contact_phone: None,
            },
            listings: vec![serde_json::json!({"title": "Cabin A"})],
            api_base_url: "http://api.test".to_string(),
        }
    }

    fn write_template(dir: &Path) {
        fs::create_dir_all(dir.join("pages")).unwrap();
        fs::create_dir_all(dir.join("node_modules/left-pad")).unwrap();
        fs::create_dir_all(dir.join(".git")).unwrap();
        fs::write(dir.join("package.json"), "{}").unwrap();
        fs::write(dir.join("node_modules/left-pad/index.js"), "").unwrap();
        fs::write(dir.join(".git/HEAD"), "ref").unwrap();
        fs::write(
            dir.join("pages/index.html.tmpl"),
            "<h1>{{ display_name }}</h1><p>{{listing_count}} listings at {{ domain }}</p>",
        )
        .unwrap();
    }

    fn builder_for(root: &Path) -> SiteBuilder {
        let config = SitesConfig {
            output_root: root.join("sites"),
            template_dir: root.join("template"),
            install_command: "true".to_string(),
            ..Default::default()
        };
        SiteBuilder::new(config, runtime::detect())
    }

    #[test]
    fn test_render() {
        let data = tenant_data();
        let values = data.placeholders();

        let out = render("Hi {{ display_name }} ({{tenant_id}})", &values).unwrap();
        assert_eq!(out, "Hi Seaside Cabins (t1)");

        let out = render("no placeholders", &values).unwrap();
        assert_eq!(out, "no placeholders");

        assert_eq!(render("{{ price }}", &values).unwrap_err(), "price");
    }

    #[test]
    fn test_placeholders_fall_back_to_id() {
        let mut data = tenant_data();
        data.tenant.domain = None;
        let values = data.placeholders();
        assert_eq!(values["domain"], "t1");
        assert_eq!(values["contact_phone"], "");
        assert_eq!(values["listing_count"], "1");
    }

    #[test]
    fn test_validate_tenant_id() {
        assert!(validate_tenant_id("t1").is_ok());
        assert!(validate_tenant_id("Tenant_42-a").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("../etc").is_err());
        assert!(validate_tenant_id("a b").is_err());
        assert!(validate_tenant_id(&"x".repeat(129)).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_site() {
        let root = tempfile::tempdir().unwrap();
        write_template(&root.path().join("template"));
        let builder = builder_for(root.path());

        let out = builder.build("t1", &tenant_data()).await.unwrap();
        assert_eq!(out, root.path().join("sites/t1"));

        let index = fs::read_to_string(out.join("pages/index.html")).unwrap();
        assert_eq!(index, "<h1>Seaside Cabins</h1><p>1 listings at seaside</p>");
        assert!(!out.join("pages/index.html.tmpl").exists());
        assert!(out.join("package.json").exists());
        assert!(!out.join("node_modules").exists());
        assert!(!out.join(".git").exists());

        let env = fs::read_to_string(out.join(".env.local")).unwrap();
        assert!(env.contains("TENANT_ID=t1\n"));
        assert!(env.contains("TENANT_DOMAIN=seaside\n"));
        assert!(env.contains("API_BASE_URL=http://api.test\n"));

        let site_data: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(out.join("site-data.json")).unwrap()).unwrap();
        assert_eq!(site_data["tenant"]["display_name"], "Seaside Cabins");
        assert_eq!(site_data["listings"][0]["title"], "Cabin A");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rebuild_wipes_output() {
        let root = tempfile::tempdir().unwrap();
        write_template(&root.path().join("template"));
        let builder = builder_for(root.path());

        let out = builder.build("t1", &tenant_data()).await.unwrap();
        fs::write(out.join("stale.txt"), "old").unwrap();

        let out = builder.build("t1", &tenant_data()).await.unwrap();
        assert!(!out.join("stale.txt").exists());
        assert!(out.join("pages/index.html").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_links_shared_dependencies() {
        let root = tempfile::tempdir().unwrap();
        write_template(&root.path().join("template"));
        let shared = root.path().join("shared_modules");
        fs::create_dir_all(shared.join("react")).unwrap();

        let config = SitesConfig {
            output_root: root.path().join("sites"),
            template_dir: root.path().join("template"),
            shared_deps_dir: Some(shared),
            install_command: "false".to_string(),
            ..Default::default()
        };
        let builder = SiteBuilder::new(config, runtime::detect());

        let out = builder.build("t1", &tenant_data()).await.unwrap();
        let link = out.join("node_modules");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert!(link.join("react").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_failure_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        write_template(&root.path().join("template"));
        let config = SitesConfig {
            output_root: root.path().join("sites"),
            template_dir: root.path().join("template"),
            shared_deps_dir: Some(root.path().join("missing")),
            install_command: "sh -c 'echo resolving; echo registry unreachable >&2; exit 3'".to_string(),
            ..Default::default()
        };
        let builder = SiteBuilder::new(config, runtime::detect());

        let err = builder.build("t1", &tenant_data()).await.unwrap_err();
        match err {
            BuildError::Install(message) => {
                assert!(message.contains("exited with code 3"));
                assert!(message.contains("registry unreachable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_step_timeout() {
        let root = tempfile::tempdir().unwrap();
        write_template(&root.path().join("template"));
        let config = SitesConfig {
            output_root: root.path().join("sites"),
            template_dir: root.path().join("template"),
            install_command: "true".to_string(),
            build_command: Some("sleep 30".to_string()),
            build_timeout_secs: 1,
            ..Default::default()
        };
        let builder = SiteBuilder::new(config, runtime::detect());

        let err = builder.build("t1", &tenant_data()).await.unwrap_err();
        assert!(matches!(err, BuildError::Timeout { ref step, secs: 1 } if step == "build"));
    }

    #[tokio::test]
    async fn test_unknown_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let template = root.path().join("template");
        fs::create_dir_all(&template).unwrap();
        fs::write(template.join("about.md.tmpl"), "Price: {{ nightly_rate }}").unwrap();
        let builder = builder_for(root.path());

        let err = builder.build("t1", &tenant_data()).await.unwrap_err();
        match err {
            BuildError::Template { file, message } => {
                assert_eq!(file, "about.md.tmpl");
                assert!(message.contains("nightly_rate"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_template_and_bad_id() {
        let root = tempfile::tempdir().unwrap();
        let builder = builder_for(root.path());

        let err = builder.build("t1", &tenant_data()).await.unwrap_err();
        assert!(matches!(err, BuildError::MissingTemplate(_)));

        let err = builder.build("../escape", &tenant_data()).await.unwrap_err();
        assert!(matches!(err, BuildError::InvalidTenantId(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_file_rejects_multiline_domain() {
        let root = tempfile::tempdir().unwrap();
        write_template(&root.path().join("template"));
        let builder = builder_for(root.path());

        let mut data = tenant_data();
        data.tenant.domain = Some("seaside\nAPI_BASE_URL=http://evil".to_string());

        let err = builder.build("t1", &data).await.unwrap_err();
        assert!(matches!(err, BuildError::InvalidDomain(_)));

        let env = root.path().join("sites/t1/.env.local");
        let contents = fs::read_to_string(&env).unwrap_or_default();
        assert!(!contents.contains("evil"));
    }
}
