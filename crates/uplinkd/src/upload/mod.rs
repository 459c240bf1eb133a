//! File uploads requested by the cloud.
//!
//! Requests are validated and resolved against the log roots, turned into
//! [`UploadItem`]s and placed on the [`UploadQueue`]. A pool of
//! [`UploadWorker`]s drains the queue over HTTP.

pub mod queue;
pub mod transfer;
pub mod worker;

pub use queue::{UploadItem, UploadQueue, DEFAULT_UPLOAD_PRIORITY};
pub use transfer::{HttpUploader, TransferError, Uploader};
pub use worker::UploadWorker;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn default_priority() -> u32 {
    DEFAULT_UPLOAD_PRIORITY
}

/// One file the cloud wants uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    #[serde(rename = "fn")]
    pub file_name: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub allow_cellular: bool,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

/// Validated, path-resolved requests plus the names that were refused.
#[derive(Debug, Default)]
pub struct Prepared {
    pub items: Vec<UploadItem>,
    pub failed: Vec<String>,
}

/// Validate requests and resolve each file under the first root that has it.
pub fn prepare(requests: Vec<UploadRequest>, roots: &[PathBuf], now_ms: u64) -> Prepared {
    let mut out = Prepared::default();
    for req in requests {
        let name = req.file_name.as_str();
        if name.is_empty() || name.starts_with('/') || name.contains("..") || req.url.is_empty() {
            out.failed.push(req.file_name);
            continue;
        }
        let Some(path) = resolve(name, roots) else {
            out.failed.push(req.file_name);
            continue;
        };
        out.items.push(UploadItem::new(
            path.to_string_lossy().into_owned(),
            req.url,
            req.headers,
            now_ms,
            req.allow_cellular,
            req.priority,
        ));
    }
    out
}

fn resolve(name: &str, roots: &[PathBuf]) -> Option<PathBuf> {
    roots
        .iter()
        .map(|root| root.join(name))
        .find(|p| p.exists())
}
