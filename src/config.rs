use std::{collections::HashMap, path::PathBuf};

use tracing::warn;

/// Domains for which cookie-based authenticated extraction is supported.
/// Matched by substring containment against the request URL.
pub const AUTHENTICATED_DOMAINS: [&str; 2] = ["instagram.com", "facebook.com"];

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    pub cookies_dir: PathBuf,
    /// Login credentials keyed by domain. Domains without credentials can
    /// still be downloaded from, but never refreshed.
    pub credentials: HashMap<String, Credentials>,
}

impl Config {
    pub fn from_env() -> Self {
        let root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        let download_dir = read_path_env("DOWNLOAD_DIR").unwrap_or_else(|| root.join("downloads"));
        let cookies_dir = read_path_env("COOKIES_DIR").unwrap_or_else(|| root.join("cookies"));

        let mut credentials = HashMap::new();
        for (domain, user_var, pass_var) in [
            ("instagram.com", "IG_USERNAME", "IG_PASSWORD"),
            ("facebook.com", "FB_USERNAME", "FB_PASSWORD"),
        ] {
            match (read_env(user_var), read_env(pass_var)) {
                (Some(username), Some(password)) => {
                    credentials.insert(domain.to_string(), Credentials { username, password });
                }
                (None, None) => {}
                _ => warn!(
                    "Only one of {user_var}/{pass_var} is set; ignoring credentials for {domain}."
                ),
            }
        }

        if credentials.is_empty() {
            warn!(
                "No site credentials configured. Downloads from private Instagram/Facebook posts will likely fail."
            );
        }

        Self {
            bind_addr: resolve_bind_addr(),
            download_dir,
            cookies_dir,
            credentials,
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = read_env("PORT").and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    "127.0.0.1:8787".to_string()
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_path_env(name: &str) -> Option<PathBuf> {
    read_env(name).map(PathBuf::from)
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}
