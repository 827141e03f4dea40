//! Download orchestration: strategy selection, failure classification, and
//! the single self-healing refresh-and-retry cycle.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::classify::{Classifier, FailureKind, classify_extractor_error};
use crate::cookies::{CookieStore, authenticated_domain};
use crate::direct::DirectStrategy;
use crate::error::DownloadError;
use crate::extract::{ExtractError, Extractor};
use crate::refresh::CredentialRefresher;

/// Successful outcome: the produced media file, namespaced by the request
/// identifier.
#[derive(Debug, Clone)]
pub struct Download {
    pub request_id: Uuid,
    pub file_name: String,
    pub path: PathBuf,
}

/// The retry budget, made structural: a request is either on its first
/// attempt or has already spent its one refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    RetriedAfterRefresh,
}

pub struct Orchestrator {
    download_dir: PathBuf,
    cookies: Arc<CookieStore>,
    extractor: Arc<dyn Extractor>,
    refresher: Arc<dyn CredentialRefresher>,
    direct: Arc<dyn DirectStrategy>,
    classifier: Classifier,
}

impl Orchestrator {
    pub fn new(
        download_dir: impl Into<PathBuf>,
        cookies: Arc<CookieStore>,
        extractor: Arc<dyn Extractor>,
        refresher: Arc<dyn CredentialRefresher>,
        direct: Arc<dyn DirectStrategy>,
    ) -> Self {
        Self {
            download_dir: download_dir.into(),
            cookies,
            extractor,
            refresher,
            direct,
            classifier: classify_extractor_error,
        }
    }

    #[cfg(test)]
    fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Fetch the media behind `url` to the download directory. Never
    /// panics; every failure comes back as a classified `DownloadError`.
    pub async fn fetch(&self, url: &str) -> Result<Download, DownloadError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::Validation("No URL provided".to_string()));
        }
        if Url::parse(url).is_err() {
            return Err(DownloadError::Validation(format!("Not a valid URL: {url}")));
        }

        let request_id = Uuid::new_v4();

        if self.direct.supports(url) {
            match self.direct.download(url, &self.download_dir, request_id).await {
                Ok(path) => {
                    info!(%request_id, "Direct strategy produced {path:?}");
                    return finish(request_id, path);
                }
                // The direct strategy is best-effort; its error never
                // reaches the caller.
                Err(error) => {
                    warn!(%request_id, "Direct strategy failed ({error}); falling back to extractor");
                }
            }
        }

        self.generic(url, request_id).await
    }

    /// Generic strategy with the two-state retry machine. The same request
    /// identifier and output location are reused across the retry.
    async fn generic(&self, url: &str, request_id: Uuid) -> Result<Download, DownloadError> {
        let auth_domain = authenticated_domain(url);
        let observed = auth_domain.map(|domain| self.cookies.observe(domain));
        let observed_version = observed.as_ref().map_or(0, |view| view.version);
        let mut cookie_file = observed.and_then(|view| view.path);

        let mut attempt = Attempt::First;
        let mut first_error = String::new();
        // Holds the per-domain refresh lock across the retry so no second
        // refresh for the same domain can start mid-sequence.
        let mut _domain_guard: Option<OwnedMutexGuard<()>> = None;

        loop {
            let failure = match self
                .extractor
                .extract(url, &self.download_dir, request_id, cookie_file.as_deref())
                .await
            {
                Ok(path) => {
                    info!(%request_id, "Extraction produced {path:?}");
                    return finish(request_id, path);
                }
                Err(ExtractError::OutputMissing) => {
                    // The extractor claimed success but the filesystem says
                    // otherwise. Server-side integrity issue, never retried.
                    warn!(%request_id, "Extractor reported success but no output file exists");
                    return Err(DownloadError::OutputMissing(request_id));
                }
                Err(ExtractError::Failed(message)) => message,
            };

            match attempt {
                Attempt::First => {
                    if (self.classifier)(&failure) != FailureKind::Auth {
                        return Err(DownloadError::Transient(failure));
                    }

                    let Some(domain) = auth_domain else {
                        // Auth-looking failure on a domain we hold no
                        // credentials for; nothing to refresh.
                        return Err(DownloadError::Auth(failure));
                    };

                    warn!(%request_id, "Auth failure for {domain}: {failure}");
                    let guard = self.cookies.lock_domain(domain).await;

                    if self.cookies.version(domain) == observed_version {
                        cookie_file =
                            Some(self.refresh_artifact(domain, &failure).await?);
                    } else {
                        // Another request refreshed this domain while we
                        // were failing; reuse its artifact instead of
                        // launching a second browser session.
                        info!(%request_id, "Reusing artifact refreshed by a concurrent request");
                        cookie_file = self.cookies.observe(domain).path;
                    }

                    _domain_guard = Some(guard);
                    first_error = failure;
                    attempt = Attempt::RetriedAfterRefresh;
                }
                Attempt::RetriedAfterRefresh => {
                    return Err(DownloadError::Auth(format!(
                        "retry after credential refresh failed: {failure} (original error: {first_error})"
                    )));
                }
            }
        }
    }

    /// Run the refresher and persist its artifact. On failure the prior
    /// artifact is discarded rather than risk reusing stale session state.
    async fn refresh_artifact(
        &self,
        domain: &str,
        download_error: &str,
    ) -> Result<PathBuf, DownloadError> {
        match self.refresher.refresh(domain).await {
            Ok(cookies) => self.cookies.replace(domain, &cookies).map_err(|error| {
                DownloadError::Refresh {
                    refresh: format!("could not store refreshed cookies: {error}"),
                    download: download_error.to_string(),
                }
            }),
            Err(error) => {
                self.cookies.invalidate(domain);
                Err(DownloadError::Refresh {
                    refresh: error.to_string(),
                    download: download_error.to_string(),
                })
            }
        }
    }

    /// Warm refresh at startup so the first authenticated download does not
    /// pay the browser-login latency. Failures are logged, not fatal.
    pub async fn warm_refresh(&self, domains: impl IntoIterator<Item = String>) {
        for domain in domains {
            let _guard = self.cookies.lock_domain(&domain).await;
            match self.refresher.refresh(&domain).await {
                Ok(cookies) => {
                    if let Err(error) = self.cookies.replace(&domain, &cookies) {
                        warn!("Could not store startup cookies for {domain}: {error}");
                    }
                }
                Err(error) => warn!("Startup cookie refresh for {domain} failed: {error}"),
            }
        }
    }
}

fn finish(request_id: Uuid, path: PathBuf) -> Result<Download, DownloadError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .ok_or(DownloadError::OutputMissing(request_id))?;

    Ok(Download {
        request_id,
        file_name,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::Cookie;
    use crate::direct::DirectError;
    use crate::refresh::RefreshError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    fn test_cookie() -> Cookie {
        Cookie {
            domain: ".instagram.com".to_string(),
            include_subdomains: true,
            path: "/".to_string(),
            secure: true,
            expires: 0,
            name: "sessionid".to_string(),
            value: "fresh".to_string(),
        }
    }

    /// Extractor scripted per call: each entry is either a produced file
    /// extension (success) or an error.
    enum Step {
        Produce(&'static str),
        Fail(&'static str),
        MissingOutput,
    }

    struct ScriptedExtractor {
        steps: Vec<Step>,
        calls: AtomicUsize,
        /// When set, first-attempt calls rendezvous here before failing, so
        /// concurrent requests all observe the pre-refresh artifact version.
        barrier: Option<Arc<Barrier>>,
        barrier_calls: usize,
    }

    impl ScriptedExtractor {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps,
                calls: AtomicUsize::new(0),
                barrier: None,
                barrier_calls: 0,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(
            &self,
            _url: &str,
            output_dir: &Path,
            request_id: Uuid,
            _cookie_file: Option<&Path>,
        ) -> Result<PathBuf, ExtractError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(barrier) = &self.barrier {
                if call < self.barrier_calls {
                    barrier.wait().await;
                }
            }

            let step = self.steps.get(call.min(self.steps.len() - 1)).unwrap();
            match step {
                Step::Produce(ext) => {
                    let path = output_dir.join(format!("{request_id}.{ext}"));
                    std::fs::write(&path, b"media").unwrap();
                    Ok(path)
                }
                Step::Fail(message) => Err(ExtractError::Failed(message.to_string())),
                Step::MissingOutput => Err(ExtractError::OutputMissing),
            }
        }
    }

    struct ScriptedRefresher {
        calls: AtomicUsize,
        outcome: Result<Vec<Cookie>, &'static str>,
    }

    impl ScriptedRefresher {
        fn succeeding() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: Ok(vec![test_cookie()]),
            }
        }

        fn failing(message: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome: Err(message),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialRefresher for ScriptedRefresher {
        async fn refresh(&self, _domain: &str) -> Result<Vec<Cookie>, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Ok(cookies) => Ok(cookies.clone()),
                Err(message) => Err(RefreshError(message.to_string())),
            }
        }
    }

    struct ScriptedDirect {
        supported: bool,
        calls: AtomicUsize,
        fail_with: Option<&'static str>,
    }

    impl ScriptedDirect {
        fn unsupported() -> Self {
            Self {
                supported: false,
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn failing(message: &'static str) -> Self {
            Self {
                supported: true,
                calls: AtomicUsize::new(0),
                fail_with: Some(message),
            }
        }

        fn succeeding() -> Self {
            Self {
                supported: true,
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DirectStrategy for ScriptedDirect {
        fn supports(&self, _url: &str) -> bool {
            self.supported
        }

        async fn download(
            &self,
            _url: &str,
            output_dir: &Path,
            request_id: Uuid,
        ) -> Result<PathBuf, DirectError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(message) => Err(DirectError(message.to_string())),
                None => {
                    let path = output_dir.join(format!("{request_id}.mp4"));
                    std::fs::write(&path, b"direct media").unwrap();
                    Ok(path)
                }
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        orchestrator: Orchestrator,
        extractor: Arc<ScriptedExtractor>,
        refresher: Arc<ScriptedRefresher>,
        direct: Arc<ScriptedDirect>,
        cookies: Arc<CookieStore>,
    }

    fn fixture(
        extractor: ScriptedExtractor,
        refresher: ScriptedRefresher,
        direct: ScriptedDirect,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let cookies = Arc::new(CookieStore::new(dir.path().join("cookies")));
        let extractor = Arc::new(extractor);
        let refresher = Arc::new(refresher);
        let direct = Arc::new(direct);
        let orchestrator = Orchestrator::new(
            dir.path().to_path_buf(),
            Arc::clone(&cookies),
            Arc::clone(&extractor) as Arc<dyn Extractor>,
            Arc::clone(&refresher) as Arc<dyn CredentialRefresher>,
            Arc::clone(&direct) as Arc<dyn DirectStrategy>,
        );

        Fixture {
            _dir: dir,
            orchestrator,
            extractor,
            refresher,
            direct,
            cookies,
        }
    }

    const IG_URL: &str = "https://www.instagram.com/reel/abc123/";

    #[tokio::test]
    async fn success_returns_an_existing_file() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Produce("mp4")]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );

        let download = fx.orchestrator.fetch(IG_URL).await.unwrap();
        assert!(download.path.is_file());
        assert!(download.file_name.starts_with(&download.request_id.to_string()));
        assert_eq!(fx.refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_and_malformed_urls_are_validation_errors() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Produce("mp4")]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );

        assert!(matches!(
            fx.orchestrator.fetch("   ").await,
            Err(DownloadError::Validation(_))
        ));
        assert!(matches!(
            fx.orchestrator.fetch("not a url").await,
            Err(DownloadError::Validation(_))
        ));
        assert_eq!(fx.extractor.call_count(), 0);
    }

    #[tokio::test]
    async fn auth_failure_refreshes_once_and_retries_once() {
        let fx = fixture(
            ScriptedExtractor::new(vec![
                Step::Fail("ERROR: HTTP Error 403: Forbidden"),
                Step::Fail("ERROR: HTTP Error 403: Forbidden"),
            ]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );

        let error = fx.orchestrator.fetch(IG_URL).await.unwrap_err();
        let DownloadError::Auth(message) = error else {
            panic!("expected Auth, got {error:?}");
        };
        assert!(message.contains("retry after credential refresh failed"));
        assert!(message.contains("original error"));
        assert_eq!(fx.extractor.call_count(), 2);
        assert_eq!(fx.refresher.call_count(), 1);
        // The refreshed artifact was stored for later requests.
        assert!(fx.cookies.observe("instagram.com").path.is_some());
    }

    #[tokio::test]
    async fn retry_after_refresh_can_succeed() {
        let fx = fixture(
            ScriptedExtractor::new(vec![
                Step::Fail("ERROR: [Instagram] You need to log in"),
                Step::Produce("mp4"),
            ]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );

        let download = fx.orchestrator.fetch(IG_URL).await.unwrap();
        assert!(download.path.is_file());
        assert_eq!(fx.extractor.call_count(), 2);
        assert_eq!(fx.refresher.call_count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_never_triggers_refresh() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Fail("ERROR: Unsupported URL")]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );

        let error = fx.orchestrator.fetch(IG_URL).await.unwrap_err();
        assert!(matches!(error, DownloadError::Transient(_)));
        assert_eq!(fx.extractor.call_count(), 1);
        assert_eq!(fx.refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn auth_failure_without_refreshable_domain_is_terminal() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Fail("ERROR: HTTP Error 403: Forbidden")]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );

        let error = fx
            .orchestrator
            .fetch("https://example.com/watch?v=1")
            .await
            .unwrap_err();
        assert!(matches!(error, DownloadError::Auth(_)));
        assert_eq!(fx.refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn refresh_failure_surfaces_both_messages_and_invalidates() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Fail("ERROR: HTTP Error 403: Forbidden")]),
            ScriptedRefresher::failing("still on the login page after submission"),
            ScriptedDirect::unsupported(),
        );
        fx.cookies
            .replace("instagram.com", &[test_cookie()])
            .unwrap();

        let error = fx.orchestrator.fetch(IG_URL).await.unwrap_err();
        let DownloadError::Refresh { refresh, download } = error else {
            panic!("expected Refresh, got {error:?}");
        };
        assert!(refresh.contains("login page"));
        assert!(download.contains("403"));
        assert_eq!(fx.extractor.call_count(), 1);
        // The stale artifact must not survive a failed refresh.
        assert!(fx.cookies.observe("instagram.com").path.is_none());
    }

    #[tokio::test]
    async fn output_missing_is_terminal_and_never_retried() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::MissingOutput]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );

        let error = fx.orchestrator.fetch(IG_URL).await.unwrap_err();
        assert!(matches!(error, DownloadError::OutputMissing(_)));
        assert_eq!(fx.extractor.call_count(), 1);
        assert_eq!(fx.refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn direct_strategy_error_falls_through_silently() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Produce("mp4")]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::failing("metadata API rejected the URL"),
        );

        let download = fx
            .orchestrator
            .fetch("https://www.tiktok.com/@user/video/7301")
            .await
            .unwrap();
        assert!(download.path.is_file());
        assert_eq!(fx.direct.call_count(), 1);
        assert_eq!(fx.extractor.call_count(), 1);
    }

    #[tokio::test]
    async fn direct_strategy_success_skips_the_extractor() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Produce("mp4")]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::succeeding(),
        );

        let download = fx
            .orchestrator
            .fetch("https://vm.tiktok.com/ZMabc/")
            .await
            .unwrap();
        assert!(download.path.is_file());
        assert_eq!(fx.direct.call_count(), 1);
        assert_eq!(fx.extractor.call_count(), 0);
    }

    #[tokio::test]
    async fn repeated_fetches_use_distinct_identifiers() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Produce("mp4"), Step::Produce("mp4")]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );

        let first = fx.orchestrator.fetch(IG_URL).await.unwrap();
        let second = fx.orchestrator.fetch(IG_URL).await.unwrap();
        assert_ne!(first.request_id, second.request_id);
        assert_ne!(first.file_name, second.file_name);
        assert!(first.path.is_file());
        assert!(second.path.is_file());
    }

    #[tokio::test]
    async fn custom_classifier_is_honored() {
        let fx = fixture(
            ScriptedExtractor::new(vec![Step::Fail("ERROR: HTTP Error 403: Forbidden")]),
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );
        let orchestrator = fx.orchestrator.with_classifier(|_| FailureKind::Transient);

        let error = orchestrator.fetch(IG_URL).await.unwrap_err();
        assert!(matches!(error, DownloadError::Transient(_)));
        assert_eq!(fx.refresher.call_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_auth_failures_refresh_exactly_once() {
        let barrier = Arc::new(Barrier::new(2));
        let mut extractor = ScriptedExtractor::new(vec![
            Step::Fail("ERROR: HTTP Error 403: Forbidden"),
            Step::Fail("ERROR: HTTP Error 403: Forbidden"),
            Step::Fail("ERROR: HTTP Error 403: Forbidden"),
            Step::Fail("ERROR: HTTP Error 403: Forbidden"),
        ]);
        extractor.barrier = Some(Arc::clone(&barrier));
        extractor.barrier_calls = 2;

        let fx = fixture(
            extractor,
            ScriptedRefresher::succeeding(),
            ScriptedDirect::unsupported(),
        );
        let orchestrator = Arc::new(fx.orchestrator);

        let first = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.fetch(IG_URL).await }
        });
        let second = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.fetch(IG_URL).await }
        });

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(matches!(first, Err(DownloadError::Auth(_))));
        assert!(matches!(second, Err(DownloadError::Auth(_))));
        assert_eq!(fx.refresher.call_count(), 1);
        assert_eq!(fx.extractor.call_count(), 4);
    }
}
