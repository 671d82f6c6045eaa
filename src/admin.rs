use crate::binder::{CommandResult, SiteService};
use crate::error::{json_error_response, ErrorCode};
use crate::pipeline::validate_tenant_id;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the daemon
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 500;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn command_response(result: CommandResult) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
    match result.code {
        None => json_response(StatusCode::OK, body),
        Some(code) => Response::builder()
            .status(code.status_code())
            .header("content-type", "application/json")
            .header("X-Previewgate-Error", code.as_header_value())
            .body(Full::new(Bytes::from(body)))
            .expect("valid response with StatusCode enum and static headers"),
    }
}

/// Admin API: the command surface for site operations
pub struct AdminServer {
    bind_addr: SocketAddr,
    service: Arc<SiteService>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        service: Arc<SiteService>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            service,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let service = Arc::clone(&self.service);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, service, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    service: Arc<SiteService>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let service = Arc::clone(&service);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, service, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct AutoShutdownRequest {
    enabled: bool,
}

async fn read_json<B, T>(body: B) -> Result<T, Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: serde::de::DeserializeOwned,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| json_error_response(ErrorCode::BadRequest, format!("failed to read body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&bytes)
        .map_err(|e| json_error_response(ErrorCode::BadRequest, format!("invalid JSON body: {}", e)))
}

fn event_limit(query: Option<&str>) -> usize {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.strip_prefix("limit="))
        .find_map(|value| value.parse::<usize>().ok())
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT)
}

/// Route one admin request
pub async fn handle_admin_request<B>(
    req: Request<B>,
    service: Arc<SiteService>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    // Health check and version need no auth
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error_response(ErrorCode::Unauthorized, "unauthorized"));
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["sites"]) => {
            let status = service.manager().status();
            match serde_json::to_string(&status) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
            }
        }

        (&Method::GET, ["sites", tenant_id]) => {
            if let Err(e) = validate_tenant_id(tenant_id) {
                return Ok(json_error_response(ErrorCode::InvalidTenantId, e.to_string()));
            }
            match service.manager().site(tenant_id) {
                Ok(Some(site)) => {
                    let body = serde_json::json!({
                        "site": site,
                        "running": service.manager().is_running(tenant_id),
                    });
                    json_response(StatusCode::OK, body.to_string())
                }
                Ok(None) => json_error_response(
                    ErrorCode::SiteNotFound,
                    format!("no site for tenant '{}'", tenant_id),
                ),
                Err(e) => json_error_response(ErrorCode::InternalError, format!("{:#}", e)),
            }
        }

        (&Method::GET, ["sites", tenant_id, "events"]) => {
            if let Err(e) = validate_tenant_id(tenant_id) {
                return Ok(json_error_response(ErrorCode::InvalidTenantId, e.to_string()));
            }
            let limit = event_limit(req.uri().query());
            match service.manager().database().get_site_events(tenant_id, limit) {
                Ok(events) => {
                    let body = serde_json::json!({
                        "events": events,
                        "count": events.len(),
                    });
                    json_response(StatusCode::OK, body.to_string())
                }
                Err(e) => json_error_response(ErrorCode::InternalError, format!("{:#}", e)),
            }
        }

        (&Method::POST, ["sites", tenant_id, action]) => {
            let tenant_id = tenant_id.to_string();
            let result = match *action {
                "materialize" => service.materialize(&tenant_id).await,
                "start" => service.start(&tenant_id).await,
                "stop" => service.stop(&tenant_id).await,
                "redeploy" => service.redeploy(&tenant_id).await,
                "touch" => service.touch(&tenant_id),
                _ => return Ok(json_error_response(ErrorCode::NotFound, "not found")),
            };
            info!(tenant = %tenant_id, action = *action, success = result.success, "Site command");
            command_response(result)
        }

        (&Method::POST, ["auto-shutdown"]) => {
            let request: AutoShutdownRequest = match read_json(req.into_body()).await {
                Ok(request) => request,
                Err(response) => return Ok(response),
            };
            service.manager().set_auto_shutdown(request.enabled);
            let body = serde_json::json!({ "enabled": request.enabled });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, ["reconcile"]) => match service.reconcile().await {
            Ok((reconciled, synced)) => {
                let body = serde_json::json!({
                    "reconcile": reconciled,
                    "proxy": synced,
                });
                json_response(StatusCode::OK, body.to_string())
            }
            Err(e) => json_error_response(ErrorCode::InternalError, format!("{:#}", e)),
        },

        (&Method::POST, ["proxy", "sync"]) => match service.proxy().sync_all().await {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => json_error_response(ErrorCode::InternalError, e.to_string()),
            },
            Err(e) => json_error_response(ErrorCode::ProxyError, format!("{:#}", e)),
        },

        // 404 for everything else
        _ => json_error_response(ErrorCode::NotFound, "not found"),
    };

    Ok(response)
}
