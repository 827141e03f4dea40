//! Credential refresh: re-establish a domain's session by driving the
//! site's login form in headless Chromium and harvesting the resulting
//! session cookies.

use std::collections::HashMap;

use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig, Element, Page};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info};

use crate::config::Credentials;
use crate::cookies::Cookie;

const LOGIN_TIMEOUT_SECONDS: u64 = 45;
const ELEMENT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct RefreshError(pub String);

/// External capability that logs into a domain and emits fresh session
/// cookies. Blocking for seconds at a time; callers must serialize
/// invocations per domain.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, domain: &str) -> Result<Vec<Cookie>, RefreshError>;
}

/// Per-site login form description.
struct SiteLogin {
    login_url: &'static str,
    username_selector: &'static str,
    password_selector: &'static str,
    submit_selector: &'static str,
    /// Path fragment that identifies the login page. Navigation away from
    /// it is the success signal; staying on it means the login failed.
    login_path_marker: &'static str,
}

fn site_login(domain: &str) -> Option<SiteLogin> {
    match domain {
        "instagram.com" => Some(SiteLogin {
            login_url: "https://www.instagram.com/accounts/login/",
            username_selector: "input[name=\"username\"]",
            password_selector: "input[name=\"password\"]",
            submit_selector: "button[type=\"submit\"]",
            login_path_marker: "/accounts/login",
        }),
        "facebook.com" => Some(SiteLogin {
            login_url: "https://www.facebook.com/login/",
            username_selector: "input[name=\"email\"]",
            password_selector: "input[name=\"pass\"]",
            submit_selector: "button[name=\"login\"]",
            login_path_marker: "/login",
        }),
        _ => None,
    }
}

pub struct ChromiumRefresher {
    credentials: HashMap<String, Credentials>,
}

impl ChromiumRefresher {
    pub fn new(credentials: HashMap<String, Credentials>) -> Self {
        Self { credentials }
    }

    async fn login(&self, domain: &str) -> Result<Vec<Cookie>, RefreshError> {
        let site = site_login(domain)
            .ok_or_else(|| RefreshError(format!("no login flow known for {domain}")))?;
        let credentials = self
            .credentials
            .get(domain)
            .ok_or_else(|| RefreshError(format!("no credentials configured for {domain}")))?;

        let config = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1280, 800)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--lang=en-US,en")
            .build()
            .map_err(|error| RefreshError(format!("could not build browser config: {error}")))?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|error| RefreshError(format!("could not launch browser: {error}")))?;

        let handler_task = tokio::spawn(async move {
            while handler.next().await.is_some() {}
        });

        let outcome = drive_login(&browser, &site, credentials, domain).await;

        if let Err(error) = browser.close().await {
            debug!("Browser close reported: {error}");
        }
        handler_task.abort();

        outcome
    }
}

async fn drive_login(
    browser: &Browser,
    site: &SiteLogin,
    credentials: &Credentials,
    domain: &str,
) -> Result<Vec<Cookie>, RefreshError> {
    let page = browser
        .new_page(site.login_url)
        .await
        .map_err(|error| RefreshError(format!("could not open login page: {error}")))?;

    page.wait_for_navigation()
        .await
        .map_err(|error| RefreshError(format!("login page did not load: {error}")))?;

    let deadline = Instant::now() + Duration::from_secs(LOGIN_TIMEOUT_SECONDS);

    fill_field(&page, site.username_selector, &credentials.username, deadline).await?;
    fill_field(&page, site.password_selector, &credentials.password, deadline).await?;

    find_with_retry(&page, site.submit_selector, deadline)
        .await?
        .click()
        .await
        .map_err(|error| RefreshError(format!("could not submit login form: {error}")))?;

    // Success signal: the browser navigates away from the login page.
    // Persistence on the login page after submission means bad credentials
    // or a checkpoint, and the caller must treat the session as invalid.
    loop {
        sleep(Duration::from_millis(ELEMENT_POLL_INTERVAL_MS)).await;

        let current = page
            .url()
            .await
            .map_err(|error| RefreshError(format!("could not read page URL: {error}")))?
            .unwrap_or_default();

        if !current.is_empty() && !current.contains(site.login_path_marker) {
            break;
        }
        if Instant::now() >= deadline {
            return Err(RefreshError(
                "still on the login page after submission; check credentials".to_string(),
            ));
        }
    }

    let raw = page
        .get_cookies()
        .await
        .map_err(|error| RefreshError(format!("could not read session cookies: {error}")))?;

    let cookies: Vec<Cookie> = raw
        .into_iter()
        .filter(|cookie| cookie.domain.ends_with(domain))
        .map(|cookie| Cookie {
            include_subdomains: cookie.domain.starts_with('.'),
            domain: cookie.domain,
            path: cookie.path,
            secure: cookie.secure,
            expires: if cookie.session { 0 } else { cookie.expires as i64 },
            name: cookie.name,
            value: cookie.value,
        })
        .collect();

    if cookies.is_empty() {
        return Err(RefreshError(format!(
            "login navigated away but produced no cookies for {domain}"
        )));
    }

    info!(
        "Re-established session for {domain} ({} cookie(s)).",
        cookies.len()
    );
    Ok(cookies)
}

async fn fill_field(
    page: &Page,
    selector: &str,
    value: &str,
    deadline: Instant,
) -> Result<(), RefreshError> {
    let element = find_with_retry(page, selector, deadline).await?;
    element
        .click()
        .await
        .map_err(|error| RefreshError(format!("could not focus {selector}: {error}")))?;
    element
        .type_str(value)
        .await
        .map_err(|error| RefreshError(format!("could not type into {selector}: {error}")))?;
    Ok(())
}

/// Login forms render asynchronously; poll for the element until the
/// shared deadline passes.
async fn find_with_retry(
    page: &Page,
    selector: &str,
    deadline: Instant,
) -> Result<Element, RefreshError> {
    loop {
        match page.find_element(selector).await {
            Ok(element) => return Ok(element),
            Err(error) => {
                if Instant::now() >= deadline {
                    return Err(RefreshError(format!(
                        "element {selector} never appeared: {error}"
                    )));
                }
                sleep(Duration::from_millis(ELEMENT_POLL_INTERVAL_MS)).await;
            }
        }
    }
}

#[async_trait]
impl CredentialRefresher for ChromiumRefresher {
    async fn refresh(&self, domain: &str) -> Result<Vec<Cookie>, RefreshError> {
        info!("Refreshing session cookies for {domain} via headless login.");
        self.login(domain).await
    }
}
