//! Host-label multiplexer for generated sites.
//!
//! `<project>.<base-domain>` is answered straight from the project's root on
//! disk; every other host falls through to the application routes. Request
//! paths go through the same sandbox the tool layer uses, so a tenant can
//! never be made to serve a sibling's files.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use regex::Regex;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use vibe_agent::store::{ENTRY_DOCUMENT, Lifecycle, ProjectFileStore};

use crate::project_id;

/// Seconds between placeholder reloads.
const PLACEHOLDER_REFRESH_SECS: u32 = 3;

pub struct TenantRouter {
    apps_dir: PathBuf,
    base_domain: String,
    pattern: Regex,
}

impl TenantRouter {
    pub fn new(apps_dir: impl Into<PathBuf>, base_domain: &str) -> Result<Self, regex::Error> {
        let base_domain = base_domain.trim_matches('.').to_ascii_lowercase();
        let pattern = Regex::new(&format!("^([a-z0-9]+)\\.{}$", regex::escape(&base_domain)))?;
        Ok(Self {
            apps_dir: apps_dir.into(),
            base_domain,
            pattern,
        })
    }

    /// The project label in `host`, if it addresses a tenant.
    ///
    /// The port is ignored and matching is case-insensitive. Platform labels
    /// such as `www` never address a tenant.
    pub fn label(&self, host: &str) -> Option<String> {
        let host = match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let label = self.pattern.captures(&host)?.get(1)?.as_str();
        project_id::is_valid(label).then(|| label.to_string())
    }

    pub fn store(&self, project_id: &str) -> ProjectFileStore {
        ProjectFileStore::for_project(&self.apps_dir, project_id)
    }

    pub fn preview_url(&self, project_id: &str) -> String {
        format!("http://{project_id}.{}/", self.base_domain)
    }

    /// Answer `req` from tenant `label`.
    ///
    /// The file itself is served by [`ServeFile`], so range and conditional
    /// requests behave as they would for any static file.
    pub async fn serve(&self, label: &str, req: Request) -> Response {
        let method = req.method().clone();
        if method != Method::GET && method != Method::HEAD {
            return (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, "GET, HEAD")],
            )
                .into_response();
        }
        let head = method == Method::HEAD;
        let store = self.store(label);

        let lifecycle = store.lifecycle().await;
        if lifecycle == Lifecycle::Absent {
            return placeholder(label, head);
        }

        let path = req.uri().path().to_string();
        let Ok(decoded) = percent_decode_str(&path).decode_utf8().map(|d| d.into_owned()) else {
            return not_found();
        };
        let relative = decoded.trim_start_matches('/');
        if relative.is_empty() && lifecycle == Lifecycle::Building {
            return placeholder(label, head);
        }

        let target = match store.resolve(relative) {
            Ok(target) => target,
            Err(violation) => {
                tracing::debug!(project = %label, path = %path, %violation, "Rejected tenant path");
                return not_found();
            }
        };
        let target = match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => {
                let index = format!("{}/{ENTRY_DOCUMENT}", relative.trim_end_matches('/'));
                match store.resolve(index.trim_start_matches('/')) {
                    Ok(index) => index,
                    Err(_) => return not_found(),
                }
            }
            Ok(_) => target,
            Err(_) => return not_found(),
        };

        let mut resp = match ServeFile::new(&target).oneshot(req).await {
            Ok(resp) => resp.map(Body::new),
            Err(never) => match never {},
        };
        let headers = resp.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        resp
    }
}

/// Middleware: serve tenant hosts, pass everything else on.
pub async fn route(State(router): State<Arc<TenantRouter>>, req: Request, next: Next) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host());
    let Some(label) = host.and_then(|h| router.label(h)) else {
        return next.run(req).await;
    };
    router.serve(&label, req).await
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CACHE_CONTROL, "no-store")],
        "Not found",
    )
        .into_response()
}

fn placeholder(label: &str, head: bool) -> Response {
    let body = if head {
        String::new()
    } else {
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="{PLACEHOLDER_REFRESH_SECS}">
<title>Building {label}</title>
<style>body{{font-family:system-ui,sans-serif;display:flex;align-items:center;justify-content:center;height:100vh;margin:0;color:#555}}</style>
</head>
<body>
<p>Your site <strong>{label}</strong> is being built. This page refreshes automatically.</p>
</body>
</html>
"#
        )
    };
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}
