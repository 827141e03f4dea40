//! Per-domain credential artifacts: serialized session cookies in the
//! Netscape cookies.txt format yt-dlp consumes, plus a versioned in-memory
//! index so concurrent requests can tell whether someone else already
//! refreshed a domain while they were failing.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, warn};

/// One session cookie, in the field order of the Netscape file format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// Epoch seconds; 0 for session cookies.
    pub expires: i64,
    pub name: String,
    pub value: String,
}

const NETSCAPE_HEADER: &str =
    "# Netscape HTTP Cookie File\n# This file was generated by onetap-backend. Do not edit.\n";

/// Serialize cookies into the exact byte layout yt-dlp's `--cookies` option
/// expects: two comment lines, then one tab-separated line per cookie.
pub fn to_netscape(cookies: &[Cookie]) -> String {
    let mut out = String::from(NETSCAPE_HEADER);
    for cookie in cookies {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            cookie.domain,
            if cookie.include_subdomains { "TRUE" } else { "FALSE" },
            cookie.path,
            if cookie.secure { "TRUE" } else { "FALSE" },
            cookie.expires,
            cookie.name,
            cookie.value,
        ));
    }
    out
}

pub fn parse_netscape(content: &str) -> Vec<Cookie> {
    content
        .lines()
        .map(str::trim)
        .map(|line| line.strip_prefix("#HttpOnly_").unwrap_or(line))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(Cookie {
                domain: fields[0].to_string(),
                include_subdomains: fields[1].eq_ignore_ascii_case("TRUE"),
                path: fields[2].to_string(),
                secure: fields[3].eq_ignore_ascii_case("TRUE"),
                expires: fields[4].parse().unwrap_or(0),
                name: fields[5].to_string(),
                value: fields[6].to_string(),
            })
        })
        .collect()
}

/// What a request saw when it picked up a domain's artifact: the file to
/// hand to the extractor (if any) and the store version at that moment.
#[derive(Debug, Clone)]
pub struct ArtifactView {
    pub path: Option<PathBuf>,
    pub version: u64,
}

#[derive(Debug)]
struct DomainSlot {
    /// Held across the whole refresh-then-retry sequence so only one
    /// browser login runs per domain at a time.
    refresh_lock: Arc<AsyncMutex<()>>,
    /// Bumped on every replace or invalidate.
    version: Mutex<u64>,
}

/// Versioned credential-artifact store, one slot per domain. A refresh fully
/// replaces the prior artifact; there is no merge.
#[derive(Debug)]
pub struct CookieStore {
    dir: PathBuf,
    slots: Mutex<HashMap<String, Arc<DomainSlot>>>,
}

impl CookieStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, domain: &str) -> Arc<DomainSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(slots.entry(domain.to_string()).or_insert_with(|| {
            Arc::new(DomainSlot {
                refresh_lock: Arc::new(AsyncMutex::new(())),
                version: Mutex::new(0),
            })
        }))
    }

    fn artifact_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{domain}.txt"))
    }

    pub fn observe(&self, domain: &str) -> ArtifactView {
        let slot = self.slot(domain);
        let version = *slot.version.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = self.artifact_path(domain);
        ArtifactView {
            path: path.is_file().then_some(path),
            version,
        }
    }

    pub fn version(&self, domain: &str) -> u64 {
        let slot = self.slot(domain);
        let version = slot.version.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *version
    }

    /// Acquire the per-domain refresh lock. The guard must be held for the
    /// whole refresh-then-retry sequence.
    pub async fn lock_domain(&self, domain: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.slot(domain).refresh_lock);
        lock.lock_owned().await
    }

    /// Write a freshly generated artifact for `domain`, replacing any prior
    /// one, and bump the version.
    pub fn replace(&self, domain: &str, cookies: &[Cookie]) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.artifact_path(domain);
        std::fs::write(&path, to_netscape(cookies))?;
        self.bump(domain);
        info!("Stored {} session cookie(s) for {domain}.", cookies.len());
        Ok(path)
    }

    /// Discard the artifact for `domain`. Called when a refresh fails, so a
    /// stale or partial session is never reused.
    pub fn invalidate(&self, domain: &str) {
        let path = self.artifact_path(domain);
        if let Err(error) = std::fs::remove_file(&path) {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not remove cookie file {path:?}: {error}");
            }
        }
        self.bump(domain);
    }

    fn bump(&self, domain: &str) {
        let slot = self.slot(domain);
        let mut version = slot.version.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *version += 1;
    }
}

/// Resolve the authenticated domain a URL belongs to, by substring match.
pub fn authenticated_domain(url: &str) -> Option<&'static str> {
    crate::config::AUTHENTICATED_DOMAINS
        .iter()
        .find(|domain| url.contains(*domain))
        .copied()
}
