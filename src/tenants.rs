//! Tenant directory
//!
//! Read-only access to tenant metadata and listable items. Tenants can be
//! declared in the config file or fetched from an HTTP API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::TenantsConfig;

/// Display metadata for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub display_name: String,
    /// Routable subdomain label
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
}

#[async_trait]
pub trait TenantSource: Send + Sync {
    /// Look up a tenant. `Ok(None)` means the tenant does not exist
    async fn tenant(&self, id: &str) -> Result<Option<Tenant>>;

    /// Listable items for a tenant, as opaque JSON objects
    async fn listings(&self, id: &str) -> Result<Vec<serde_json::Value>>;
}

/// Tenant declared inline in the config file
#[derive(Debug, Clone, Deserialize)]
pub struct StaticTenant {
    pub display_name: String,
    pub domain: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub listings: Vec<serde_json::Value>,
}

/// Tenants from the `[tenants.entries]` config table
pub struct StaticTenants {
    entries: HashMap<String, StaticTenant>,
}

impl StaticTenants {
    pub fn new(entries: HashMap<String, StaticTenant>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl TenantSource for StaticTenants {
    async fn tenant(&self, id: &str) -> Result<Option<Tenant>> {
        Ok(self.entries.get(id).map(|entry| Tenant {
            id: id.to_string(),
            display_name: entry.display_name.clone(),
            domain: entry.domain.clone(),
            contact_email: entry.contact_email.clone(),
            contact_phone: entry.contact_phone.clone(),
        }))
    }

    async fn listings(&self, id: &str) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .entries
            .get(id)
            .map(|entry| entry.listings.clone())
            .unwrap_or_default())
    }
}

/// Tenants served by an HTTP API
///
/// `GET {base}/tenants/{id}` returns the tenant (404 when unknown) and
/// `GET {base}/tenants/{id}/listings` returns a JSON array of items.
pub struct HttpTenantSource {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpTenantSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn tenant_url(&self, id: &str) -> String {
        format!("{}/tenants/{}", self.base_url, urlencoding::encode(id))
    }
}

#[derive(Deserialize)]
struct TenantPayload {
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "name")]
    display_name: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default, alias = "email")]
    contact_email: Option<String>,
    #[serde(default, alias = "phone")]
    contact_phone: Option<String>,
}

#[async_trait]
impl TenantSource for HttpTenantSource {
    async fn tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let url = self.tenant_url(id);
        debug!(%url, "Fetching tenant");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Tenant request failed: {}", url))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let payload: TenantPayload = response
            .error_for_status()?
            .json()
            .await
            .context("Invalid tenant payload")?;

        Ok(Some(Tenant {
            id: payload.id.unwrap_or_else(|| id.to_string()),
            display_name: payload.display_name,
            domain: payload.domain,
            contact_email: payload.contact_email,
            contact_phone: payload.contact_phone,
        }))
    }

    async fn listings(&self, id: &str) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/listings", self.tenant_url(id));
        debug!(%url, "Fetching listings");

        let items = self
            .http_client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Listings request failed: {}", url))?
            .error_for_status()?
            .json()
            .await
            .context("Invalid listings payload")?;

        Ok(items)
    }
}

/// Build the tenant source described by the config
pub fn from_config(config: &TenantsConfig) -> Result<Arc<dyn TenantSource>> {
    match config.api_url {
        Some(ref url) => {
            let timeout = Duration::from_secs(config.request_timeout_secs.unwrap_or(10));
            Ok(Arc::new(HttpTenantSource::new(url.clone(), timeout)?))
        }
        None => Ok(Arc::new(StaticTenants::new(config.entries.clone()))),
    }
}
