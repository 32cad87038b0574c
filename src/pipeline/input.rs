//! Input resolution: turn user-supplied paths and URLs into page images.
//!
//! Each input is one of:
//! * a local image file (one page);
//! * a directory, whose image files become pages in natural filename order
//!   (`page2.png` before `page10.png`);
//! * an HTTP(S) URL to a single image.
//!
//! Bytes are loaded as-is; format checks and resizing happen in
//! [`crate::pipeline::encode`].

use crate::error::ExtractError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extensions picked up when an input is a directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

static RE_NATURAL_CHUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+|\D+").unwrap());

/// One page's encoded image bytes, plus where they came from.
#[derive(Clone)]
pub struct PageImage {
    pub source: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for PageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageImage")
            .field("source", &self.source)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl PageImage {
    pub fn new(source: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            bytes,
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve every input, in order, into a flat list of page images.
pub async fn load_pages<S: AsRef<str>>(inputs: &[S], timeout_secs: u64) -> Result<Vec<PageImage>, ExtractError> {
    let mut pages = Vec::new();
    for input in inputs {
        let input = input.as_ref();
        if is_url(input) {
            pages.push(download_url(input, timeout_secs).await?);
        } else {
            pages.extend(load_local(input).await?);
        }
    }
    info!("Loaded {} page image(s) from {} input(s)", pages.len(), inputs.len());
    if pages.is_empty() {
        return Err(ExtractError::NoPages);
    }
    Ok(pages)
}

async fn load_local(path_str: &str) -> Result<Vec<PageImage>, ExtractError> {
    let path = PathBuf::from(path_str);
    let meta = tokio::fs::metadata(&path).await.map_err(|e| io_error(&path, e))?;

    if meta.is_dir() {
        let files = list_image_files(&path).await?;
        debug!("Directory {} holds {} image(s)", path.display(), files.len());
        let mut pages = Vec::with_capacity(files.len());
        for file in files {
            pages.push(read_file(&file).await?);
        }
        Ok(pages)
    } else {
        Ok(vec![read_file(&path).await?])
    }
}

async fn read_file(path: &Path) -> Result<PageImage, ExtractError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| io_error(path, e))?;
    Ok(PageImage::new(path.display().to_string(), bytes))
}

fn io_error(path: &Path, e: std::io::Error) -> ExtractError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => ExtractError::PermissionDenied {
            path: path.to_path_buf(),
        },
        std::io::ErrorKind::NotFound => ExtractError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => ExtractError::InvalidInput {
            input: format!("{} ({})", path.display(), e),
        },
    }
}

/// Image files directly inside `dir`, in natural filename order.
pub async fn list_image_files(dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| io_error(dir, e))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        let path = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| {
        let an = a.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let bn = b.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        natural_cmp(&an, &bn)
    });
    Ok(files)
}

/// Compare two names so that embedded numbers sort by value.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = RE_NATURAL_CHUNK.find_iter(a);
    let mut bi = RE_NATURAL_CHUNK.find_iter(b);
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let (x, y) = (x.as_str(), y.as_str());
                let ord = match (x.parse::<u128>(), y.parse::<u128>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny).then_with(|| x.len().cmp(&y.len())),
                    _ => x.to_lowercase().cmp(&y.to_lowercase()),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Download one page image.
async fn download_url(url: &str, timeout_secs: u64) -> Result<PageImage, ExtractError> {
    info!("Downloading page image from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ExtractError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ExtractError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response.bytes().await.map_err(|e| ExtractError::DownloadFailed {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    debug!("Downloaded {} bytes from {}", bytes.len(), url);
    Ok(PageImage::new(url, bytes.to_vec()))
}
