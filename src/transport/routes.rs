//! Route paths for both HTTP surfaces and helpers to build endpoint urls.

use reqwest::Url;
use uuid::Uuid;

use crate::error::{ForemanError, Result};

/// Header a node uses to identify itself on status callbacks.
pub const NODE_URL_HEADER: &str = "x-node-url";

const JOB_ID_PARAM: &str = ":job_id";

pub mod manager {
    pub const JOB: &str = "/job";
    pub const JOB_BY_ID: &str = "/job/:job_id";
    pub const JOB_DETAIL: &str = "/jobdetail/:job_id";
    pub const NODE_INIT: &str = "/nodeinit";
    pub const HEARTBEAT: &str = "/heartbeat";
    pub const JOB_DONE: &str = "/status/done/:job_id";
    pub const JOB_FAILED: &str = "/status/fail";
    pub const JOB_PROGRESS: &str = "/status/progress";
    pub const JOB_CANCELED: &str = "/status/cancel/:job_id";
    pub const NODES: &str = "/node";
    pub const NODES_SLASH: &str = "/node/";
    pub const PING: &str = "/ping";
}

pub mod node {
    pub const JOB: &str = "/job";
    pub const JOB_BY_ID: &str = "/job/:job_id";
    pub const IS_ALIVE: &str = "/isalive";
    pub const STATUS: &str = "/status";
}

/// Canonical form of a node or manager base url: absolute http(s), no query
/// or fragment, path ending in `/`.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| ForemanError::Validation(format!("invalid url '{}': {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ForemanError::Validation(format!(
            "url '{}' must use http or https",
            raw
        )));
    }
    if url.host_str().is_none() {
        return Err(ForemanError::Validation(format!("url '{}' has no host", raw)));
    }

    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url.to_string())
}

/// Resolve `route` against `base`, substituting `job_id` for `:job_id`.
pub fn endpoint(base: &str, route: &str, job_id: Option<Uuid>) -> Result<Url> {
    let base = Url::parse(&normalize_base_url(base)?)
        .map_err(|e| ForemanError::Validation(e.to_string()))?;

    let mut path = route.trim_start_matches('/').to_string();
    if path.contains(JOB_ID_PARAM) {
        let id = job_id.ok_or_else(|| {
            ForemanError::Validation(format!("route '{}' needs a job id", route))
        })?;
        path = path.replace(JOB_ID_PARAM, &id.to_string());
    }

    base.join(&path)
        .map_err(|e| ForemanError::Validation(format!("cannot build endpoint: {}", e)))
}
