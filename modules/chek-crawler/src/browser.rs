//! Browser session plumbing over a single shared headless Chromium (CDP).
//!
//! One Chromium process serves both platform pipelines; each pipeline gets its
//! own page seeded from its platform's persisted storage state. Everything
//! here returns `Result`s that the adapters catch per keyword or per item —
//! nothing in this layer is allowed to abort a run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, CookieSameSite, EventLoadingFinished, EventRequestWillBeSent,
    GetResponseBodyParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Hides the automation markers the more bot-sensitive platform checks for.
const MASK_AUTOMATION_SCRIPT: &str = r#"
try { Object.defineProperty(navigator, 'webdriver', { get: () => undefined }); } catch (e) {}
try { window.chrome = window.chrome || { runtime: {} }; } catch (e) {}
"#;

// --- Browser process ---

pub struct BrowserHandle {
    browser: Browser,
    event_task: JoinHandle<()>,
}

impl BrowserHandle {
    /// Launch one Chromium process shared by every session for the run.
    pub async fn launch(headless: bool) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage");
        if !headless {
            builder = builder.with_head();
        }
        let config = builder
            .build()
            .map_err(|e| anyhow!("Invalid browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch Chromium")?;

        // Drain CDP events for the lifetime of the browser.
        let event_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            browser,
            event_task,
        })
    }

    /// Open a page configured for one platform: storage-state cookies and
    /// localStorage, user-agent/locale override, timezone, viewport, and
    /// automation masking as requested.
    pub async fn open_session(&self, options: &SessionOptions) -> Result<Session> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")?;

        if let Some(ua) = &options.user_agent {
            let mut params = SetUserAgentOverrideParams::builder().user_agent(ua.clone());
            if let Some(lang) = &options.accept_language {
                params = params.accept_language(lang.clone());
            }
            page.execute(params.build().map_err(|e| anyhow!("user agent override: {e}"))?)
                .await
                .context("Failed to override user agent")?;
        }
        if let Some(tz) = &options.timezone {
            page.execute(SetTimezoneOverrideParams::new(tz.clone()))
                .await
                .context("Failed to override timezone")?;
        }
        if let Some((width, height)) = options.viewport {
            let params = SetDeviceMetricsOverrideParams::builder()
                .width(width)
                .height(height)
                .device_scale_factor(1.0)
                .mobile(false)
                .build()
                .map_err(|e| anyhow!("device metrics override: {e}"))?;
            page.execute(params)
                .await
                .context("Failed to set viewport")?;
        }
        if options.mask_automation {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
                MASK_AUTOMATION_SCRIPT.to_string(),
            ))
            .await
            .context("Failed to install automation mask")?;
        }
        if let Some(path) = &options.storage_state_path {
            let state = StorageState::load(path)?;
            let cookies = state.cookie_params()?;
            if !cookies.is_empty() {
                page.set_cookies(cookies)
                    .await
                    .context("Failed to apply storage-state cookies")?;
            }
            if let Some(script) = state.local_storage_script() {
                page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script))
                    .await
                    .context("Failed to seed localStorage")?;
            }
        }

        Ok(Session { page })
    }

    /// Close the browser. Always called at the end of a run, success or not.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "Failed to close browser cleanly");
        }
        self.event_task.abort();
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionOptions {
    pub storage_state_path: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub timezone: Option<String>,
    pub viewport: Option<(i64, i64)>,
    pub mask_automation: bool,
}

// --- Session ---

/// One platform's page. Reused serially across that platform's keywords to
/// keep the load on the external surface bounded.
pub struct Session {
    page: Page,
}

impl Session {
    /// Navigate and wait for the load to settle, bounded by `timeout`.
    /// Returns the final URL so callers can detect login-wall redirects.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<String> {
        tokio::time::timeout(timeout, async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await
        .map_err(|_| anyhow!("Navigation timed out after {timeout:?}: {url}"))?
        .with_context(|| format!("Navigation failed: {url}"))?;

        let current = self
            .page
            .url()
            .await
            .context("Failed to read page URL")?
            .unwrap_or_else(|| url.to_string());
        Ok(current)
    }

    /// Let client-side rendering settle for a fixed interval.
    pub async fn settle(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// The page's URL right now (client-side redirects included).
    pub async fn current_url(&self) -> Result<String> {
        Ok(self
            .page
            .url()
            .await
            .context("Failed to read page URL")?
            .unwrap_or_default())
    }

    /// Evaluate a JS expression and deserialize the result.
    pub async fn evaluate<T: DeserializeOwned>(&self, expression: &str) -> Result<T> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .context("Evaluation failed")?;
        Ok(result.into_value::<T>()?)
    }

    /// Evaluate a JS function (promises are awaited) and deserialize the
    /// result.
    pub async fn evaluate_fn<T: DeserializeOwned>(&self, function: &str) -> Result<T> {
        let result = self
            .page
            .evaluate_function(function)
            .await
            .context("Function evaluation failed")?;
        Ok(result.into_value::<T>()?)
    }

    /// Start capturing the first response whose request URL contains
    /// `url_fragment` with the given HTTP method. Register before navigating
    /// so the search request cannot be missed.
    pub async fn watch_response(&self, url_fragment: &str, method: &str) -> Result<ResponseWatcher> {
        let mut requests = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .context("Failed to listen for requests")?;
        let mut finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .context("Failed to listen for responses")?;

        let page = self.page.clone();
        let fragment = url_fragment.to_string();
        let method = method.to_string();
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut wanted = HashSet::new();
            let mut tx = Some(tx);
            loop {
                tokio::select! {
                    Some(request) = requests.next() => {
                        if request.request.url.contains(&fragment)
                            && request.request.method.eq_ignore_ascii_case(&method)
                        {
                            wanted.insert(request.request_id.clone());
                        }
                    }
                    Some(done) = finished.next() => {
                        if !wanted.contains(&done.request_id) {
                            continue;
                        }
                        match page.execute(GetResponseBodyParams::new(done.request_id.clone())).await {
                            Ok(resp) if !resp.result.base64_encoded => {
                                if let Some(sender) = tx.take() {
                                    let _ = sender.send(resp.result.body.clone());
                                }
                                break;
                            }
                            Ok(_) => {
                                debug!(fragment = %fragment, "Captured response body was base64, skipping");
                            }
                            Err(e) => {
                                debug!(fragment = %fragment, error = %e, "Failed to read captured response body");
                            }
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(ResponseWatcher { rx, task })
    }

    pub async fn close(self) {
        if let Err(e) = self.page.close().await {
            debug!(error = %e, "Failed to close page");
        }
    }
}

pub struct ResponseWatcher {
    rx: oneshot::Receiver<String>,
    task: JoinHandle<()>,
}

impl ResponseWatcher {
    /// Wait up to `timeout` for the captured body and parse it as JSON.
    /// Returns `None` on timeout, non-JSON bodies, or capture failure.
    pub async fn wait_json(self, timeout: Duration) -> Option<serde_json::Value> {
        let body = tokio::time::timeout(timeout, self.rx).await.ok()?.ok();
        self.task.abort();
        serde_json::from_str(&body?).ok()
    }
}

// --- Storage state ---

/// Persisted authenticated browser session snapshot (cookies + localStorage),
/// produced out-of-band by the interactive login capture tool and consumed
/// read-only here.
#[derive(Debug, Default, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<StorageCookie>,
    #[serde(default)]
    pub origins: Vec<StorageOrigin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StorageOrigin {
    pub origin: String,
    #[serde(default, rename = "localStorage")]
    pub local_storage: Vec<StorageEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

impl StorageState {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read storage state {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Malformed storage state {}", path.display()))
    }

    fn cookie_params(&self) -> Result<Vec<CookieParam>> {
        let mut out = Vec::with_capacity(self.cookies.len());
        for cookie in &self.cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .secure(cookie.secure)
                .http_only(cookie.http_only);
            if !cookie.domain.is_empty() {
                builder = builder.domain(cookie.domain.clone());
            }
            if !cookie.path.is_empty() {
                builder = builder.path(cookie.path.clone());
            }
            if let Some(expires) = cookie.expires {
                // Playwright writes -1 for session cookies.
                if expires > 0.0 {
                    builder = builder.expires(TimeSinceEpoch::new(expires));
                }
            }
            if let Some(same_site) = cookie.same_site.as_deref() {
                builder = match same_site {
                    "Strict" => builder.same_site(CookieSameSite::Strict),
                    "Lax" => builder.same_site(CookieSameSite::Lax),
                    "None" => builder.same_site(CookieSameSite::None),
                    _ => builder,
                };
            }
            let param = builder
                .build()
                .map_err(|e| anyhow!("Invalid cookie {}: {e}", cookie.name))?;
            out.push(param);
        }
        Ok(out)
    }

    /// Script seeding each origin's localStorage on every new document of
    /// that origin.
    fn local_storage_script(&self) -> Option<String> {
        let mut seeds = serde_json::Map::new();
        for origin in &self.origins {
            if origin.local_storage.is_empty() {
                continue;
            }
            let entries: serde_json::Map<String, serde_json::Value> = origin
                .local_storage
                .iter()
                .map(|e| (e.name.clone(), serde_json::Value::String(e.value.clone())))
                .collect();
            seeds.insert(origin.origin.clone(), serde_json::Value::Object(entries));
        }
        if seeds.is_empty() {
            return None;
        }
        let seeds_json = serde_json::Value::Object(seeds).to_string();
        Some(format!(
            r#"(() => {{
  try {{
    const seeds = {seeds_json};
    const entries = seeds[location.origin];
    if (!entries) return;
    for (const [key, value] of Object.entries(entries)) {{
      try {{ localStorage.setItem(key, value); }} catch (e) {{}}
    }}
  }} catch (e) {{}}
}})();"#
        ))
    }
}
