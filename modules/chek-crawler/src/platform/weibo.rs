//! Weibo search + detail extraction.
//!
//! Search results come from rendered DOM anchors on `s.weibo.com`; detail
//! text prefers the platform's own authenticated status endpoint (fetched
//! in-page so session cookies apply) and falls back to meta tags, likely
//! content containers, then the search snippet.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use chek_common::text::{safe_text, strip_html, uniq_by};
use chek_common::{CandidateItem, Platform};

use crate::browser::{BrowserHandle, Session, SessionOptions};
use crate::platform::{PlatformAdapter, SearchHit, NAV_TIMEOUT};

const SEARCH_LINKS_JS: &str = r#"() => {
  const out = [];
  for (const a of Array.from(document.querySelectorAll('a[href]'))) {
    const href = a.getAttribute('href') || '';
    if (!href) continue;
    if (href.includes('passport.weibo.com')) continue;
    if (href.includes('s.weibo.com')) continue;
    if (!href.includes('weibo.com')) continue;
    out.push({ href, text: (a.textContent || '').trim() });
  }
  return out;
}"#;

const DOM_FALLBACK_JS: &str = r#"() => {
  const attr = (sel, name) => {
    const el = document.querySelector(sel);
    return el ? (el.getAttribute(name) || '').trim() : '';
  };
  const textOf = (sel) => {
    const el = document.querySelector(sel);
    return el ? (el.textContent || '').trim() : '';
  };
  const title = attr('meta[property="og:title"]', 'content') || (document.title || '').trim();
  const desc = attr('meta[name="description"]', 'content')
    || attr('meta[property="og:description"]', 'content');
  const bodyText = textOf('article')
    || textOf('.detail_wbtext_4CRf9')
    || textOf('[node-type="feed_list_content"]');
  return { title, desc, bodyText };
}"#;

#[derive(Debug, Deserialize)]
struct AnchorHit {
    #[serde(default)]
    href: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct DomFallback {
    #[serde(default)]
    title: String,
    #[serde(default)]
    desc: String,
    #[serde(default, rename = "bodyText")]
    body_text: String,
}

#[derive(Debug, Deserialize)]
struct AjaxProbe {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    text: String,
}

pub struct WeiboAdapter {
    storage_state: Option<PathBuf>,
}

impl WeiboAdapter {
    pub fn new(storage_state: Option<PathBuf>) -> Self {
        Self { storage_state }
    }

    /// Session options for the authenticated context, or `None` (logged)
    /// when no storage state is configured. Checked before any browser call
    /// so an unconfigured platform costs nothing.
    fn session_options(&self) -> Option<SessionOptions> {
        let Some(path) = &self.storage_state else {
            warn!("weibo_skip_missing_storage_state");
            return None;
        };
        Some(SessionOptions {
            storage_state_path: Some(path.clone()),
            ..Default::default()
        })
    }

    async fn collect_search_hits(
        &self,
        session: &Session,
        keyword: &str,
        max_links: usize,
    ) -> Result<Vec<SearchHit>> {
        let url = search_url(keyword);
        session.navigate(&url, NAV_TIMEOUT).await?;
        session.settle(Duration::from_millis(1600)).await;

        let current = session.current_url().await.unwrap_or_default();
        if current.contains("passport.weibo.com/visitor") {
            warn!(keyword, url = %current, "weibo_redirect_visitor");
            return Ok(Vec::new());
        }

        let anchors: Vec<AnchorHit> = session.evaluate_fn(SEARCH_LINKS_JS).await?;
        let hits = normalize_anchor_hits(anchors, max_links);
        if hits.is_empty() {
            let page_title: String = session
                .evaluate("document.title || ''")
                .await
                .unwrap_or_default();
            warn!(keyword, url, page_title, "weibo_search_empty");
        }
        Ok(hits)
    }

    /// Detail text for one status. Primary path is the authenticated AJAX
    /// endpoint keyed by the mid; every failure degrades to the next
    /// fallback rather than failing the item.
    async fn extract_detail(
        &self,
        session: &Session,
        url: &str,
        hint: &str,
    ) -> Result<(String, String)> {
        session.navigate(url, NAV_TIMEOUT).await?;
        session.settle(Duration::from_millis(600)).await;

        let mid = extract_mid(url);
        let mut raw_text = String::new();

        if !mid.is_empty() {
            match session.evaluate_fn::<AjaxProbe>(&ajax_show_js(&mid)).await {
                Ok(probe) if probe.status == 200 => {
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&probe.text) {
                        let data = &json["data"];
                        raw_text = data["text_raw"].as_str().unwrap_or("").to_string();
                        if raw_text.is_empty() {
                            raw_text = strip_html(data["text"].as_str().unwrap_or(""));
                        }
                    }
                }
                Ok(probe) => {
                    debug!(mid, status = probe.status, "weibo_ajax_status");
                }
                Err(e) => {
                    debug!(mid, error = %e, "weibo_ajax_failed");
                }
            }
        }

        let mut raw_title = if raw_text.is_empty() {
            String::new()
        } else {
            safe_text(raw_text.lines().next().unwrap_or(""), 120)
        };

        if raw_title.is_empty() || raw_text.is_empty() {
            let fallback: DomFallback = session
                .evaluate_fn(DOM_FALLBACK_JS)
                .await
                .unwrap_or_default();
            if raw_title.is_empty() {
                raw_title = first_non_empty(&[&fallback.title, hint]);
            }
            if raw_text.is_empty() {
                raw_text = first_non_empty(&[&fallback.desc, &fallback.body_text, hint]);
            }
        }

        if !raw_text.is_empty() && is_boilerplate_title(&raw_title) {
            raw_title = safe_text(&raw_text, 120);
        }

        Ok((raw_title, raw_text))
    }
}

#[async_trait]
impl PlatformAdapter for WeiboAdapter {
    fn platform(&self) -> Platform {
        Platform::Weibo
    }

    async fn open_session(&self, browser: &BrowserHandle) -> Result<Option<Session>> {
        let Some(options) = self.session_options() else {
            return Ok(None);
        };
        Ok(Some(browser.open_session(&options).await?))
    }

    async fn crawl_keyword(
        &self,
        session: &Session,
        keyword: &str,
        max_items: usize,
    ) -> Result<Vec<CandidateItem>> {
        let hits = self
            .collect_search_hits(session, keyword, max_items.max(6))
            .await?;

        let mut out = Vec::new();
        for hit in hits {
            if out.len() >= max_items {
                break;
            }
            let source_id = extract_mid(&hit.url);
            if source_id.is_empty() {
                continue;
            }
            match self.extract_detail(session, &hit.url, &hit.hint).await {
                Ok((title, body)) => out.push(CandidateItem {
                    platform: Platform::Weibo,
                    source_id,
                    source_url: hit.url,
                    title,
                    body,
                    hint: hit.hint,
                }),
                Err(e) => {
                    warn!(keyword, url = %hit.url, error = %e, "weibo_detail_failed");
                }
            }
        }
        Ok(uniq_by(out, |c| c.dedup_key()))
    }
}

fn search_url(keyword: &str) -> String {
    url::Url::parse_with_params("https://s.weibo.com/weibo", &[("q", keyword.trim())])
        .expect("valid search URL")
        .to_string()
}

fn ajax_show_js(mid: &str) -> String {
    // mid is [A-Za-z0-9]+ by construction, safe to splice into the script.
    format!(
        r#"async () => {{
  try {{
    const r = await fetch('https://weibo.com/ajax/statuses/show?id={mid}', {{ credentials: 'include' }});
    const text = await r.text();
    return {{ status: r.status, text }};
  }} catch (e) {{
    return {{ status: 0, text: String(e || '') }};
  }}
}}"#
    )
}

/// Stable platform-native content ID from the two known URL shapes.
pub(crate) fn extract_mid(url: &str) -> String {
    let detail = regex::Regex::new(r"/detail/([A-Za-z0-9]+)").expect("valid regex");
    if let Some(caps) = detail.captures(url) {
        return caps[1].to_string();
    }
    let status = regex::Regex::new(r"weibo\.com/\d+/([A-Za-z0-9]+)").expect("valid regex");
    if let Some(caps) = status.captures(url) {
        return caps[1].to_string();
    }
    String::new()
}

pub(crate) fn to_absolute_weibo_url(href: &str) -> String {
    let href = href.trim();
    if href.is_empty() {
        return String::new();
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    if href.starts_with('/') {
        return format!("https://weibo.com{href}");
    }
    format!("https://weibo.com/{href}")
}

fn normalize_anchor_hits(anchors: Vec<AnchorHit>, max_links: usize) -> Vec<SearchHit> {
    let hits: Vec<SearchHit> = anchors
        .into_iter()
        .map(|a| SearchHit {
            url: to_absolute_weibo_url(&a.href),
            hint: safe_text(&a.text, 80),
        })
        .filter(|h| h.url.contains("weibo.com"))
        .collect();

    let mut unique = uniq_by(hits, |h| h.url.clone());
    unique.truncate(max_links);
    unique
}

/// Generic platform page titles that say nothing about the post itself.
fn is_boilerplate_title(title: &str) -> bool {
    let t = title.trim();
    t.is_empty() || t.contains("微博正文") || t.ends_with("- 微博")
}

fn first_non_empty(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or("")
        .to_string()
}
