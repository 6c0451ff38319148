//! Xiaohongshu (XHS) search + note extraction.
//!
//! Search results are not readable from the DOM; they are captured from the
//! first-party search API response the page itself issues. Note detail
//! prefers the client-side `__INITIAL_STATE__` blob, located by a
//! bounded-depth breadth-first walk so upstream schema drift degrades to the
//! DOM fallbacks instead of breaking extraction.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use chek_common::text::{safe_text, strip_html, uniq_by};
use chek_common::{CandidateItem, Platform};

use crate::browser::{BrowserHandle, Session, SessionOptions};
use crate::platform::{PlatformAdapter, SearchHit, NAV_TIMEOUT};

const SEARCH_NOTES_API: &str = "/api/sns/web/v1/search/notes";
const SEARCH_RESPONSE_TIMEOUT: Duration = Duration::from_secs(20);

/// XHS blocks obvious automation hard; present a plain desktop Chrome.
const DESKTOP_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// Depth bound for the note-card search; the state blob nests deep but not
/// this deep unless something is wrong.
const MAX_WALK_DEPTH: usize = 12;

const FLATTEN_MAX_DEPTH: usize = 6;

const DOM_FALLBACK_JS: &str = r#"() => {
  const attr = (sel, name) => {
    const el = document.querySelector(sel);
    return el ? (el.getAttribute(name) || '').trim() : '';
  };
  const textOf = (sel) => {
    const el = document.querySelector(sel);
    return el ? (el.textContent || '').trim() : '';
  };
  const title = textOf('h1') || attr('meta[property="og:title"]', 'content');
  const desc = attr('meta[name="description"]', 'content')
    || attr('meta[property="og:description"]', 'content');
  const bodyText = textOf('article') || textOf('[data-note-detail]');
  return { title, desc, bodyText };
}"#;

#[derive(Debug, Default, Deserialize)]
struct DomFallback {
    #[serde(default)]
    title: String,
    #[serde(default)]
    desc: String,
    #[serde(default, rename = "bodyText")]
    body_text: String,
}

pub struct XhsAdapter {
    storage_state: Option<PathBuf>,
}

impl XhsAdapter {
    pub fn new(storage_state: Option<PathBuf>) -> Self {
        Self { storage_state }
    }

    /// Session options with the full anti-detection kit, or `None` (logged)
    /// when no storage state is configured.
    fn session_options(&self) -> Option<SessionOptions> {
        let Some(path) = &self.storage_state else {
            warn!("xhs_skip_missing_storage_state");
            return None;
        };
        Some(SessionOptions {
            storage_state_path: Some(path.clone()),
            user_agent: Some(DESKTOP_UA.to_string()),
            accept_language: Some("zh-CN".to_string()),
            timezone: Some("Asia/Shanghai".to_string()),
            viewport: Some((1365, 900)),
            mask_automation: true,
        })
    }

    async fn collect_search_hits(
        &self,
        session: &Session,
        keyword: &str,
        max_links: usize,
    ) -> Result<Vec<SearchHit>> {
        let url = search_url(keyword);
        let watcher = session.watch_response(SEARCH_NOTES_API, "POST").await?;

        session.navigate(&url, NAV_TIMEOUT).await?;
        session.settle(Duration::from_millis(1200)).await;

        let current = session.current_url().await.unwrap_or_default();
        if current.contains("/login") {
            warn!(keyword, url = %current, "xhs_redirect_login");
            return Ok(Vec::new());
        }

        let response = watcher.wait_json(SEARCH_RESPONSE_TIMEOUT).await;
        let hits = response
            .as_ref()
            .map(|json| parse_search_hits(json, max_links))
            .unwrap_or_default();

        if hits.is_empty() {
            let page_title: String = session
                .evaluate("document.title || ''")
                .await
                .unwrap_or_default();
            warn!(keyword, url, page_title, "xhs_search_empty");
        }
        Ok(hits)
    }

    async fn extract_note_detail(
        &self,
        session: &Session,
        url: &str,
        hint: &str,
    ) -> Result<(String, String)> {
        let note_id = extract_note_id(url);

        session.navigate(url, NAV_TIMEOUT).await?;
        session.settle(Duration::from_millis(1000)).await;

        let mut raw_title = String::new();
        let mut raw_text = String::new();

        match session
            .evaluate::<Value>("window.__INITIAL_STATE__ || null")
            .await
        {
            Ok(state) if !state.is_null() => {
                let (title, text) = extract_from_state(&state, &note_id);
                raw_title = title;
                raw_text = text;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(note_id, error = %e, "xhs_initial_state_failed");
            }
        }

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

        if raw_title.is_empty() && !raw_text.is_empty() {
            raw_title = safe_text(raw_text.lines().next().unwrap_or(""), 120);
        }

        Ok((raw_title, raw_text))
    }
}

#[async_trait]
impl PlatformAdapter for XhsAdapter {
    fn platform(&self) -> Platform {
        Platform::Xhs
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
            let source_id = extract_note_id(&hit.url);
            if source_id.is_empty() {
                continue;
            }
            match self.extract_note_detail(session, &hit.url, &hit.hint).await {
                Ok((title, body)) => out.push(CandidateItem {
                    platform: Platform::Xhs,
                    source_id,
                    source_url: hit.url,
                    title,
                    body,
                    hint: hit.hint,
                }),
                Err(e) => {
                    warn!(keyword, url = %hit.url, error = %e, "xhs_detail_failed");
                }
            }
        }
        Ok(uniq_by(out, |c| c.dedup_key()))
    }
}

fn search_url(keyword: &str) -> String {
    url::Url::parse_with_params(
        "https://www.xiaohongshu.com/search_result",
        &[("keyword", keyword.trim()), ("type", "51")],
    )
    .expect("valid search URL")
    .to_string()
}

pub(crate) fn extract_note_id(url: &str) -> String {
    let re = regex::Regex::new(r"(?i)/explore/([a-f0-9]{16,32})").expect("valid regex");
    re.captures(url)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default()
}

/// Build explore links from the captured search API payload. Results without
/// both a note id and an `xsec_token` cannot be opened and are dropped.
fn parse_search_hits(json: &Value, max_links: usize) -> Vec<SearchHit> {
    let items = match json.pointer("/data/items").and_then(Value::as_array) {
        Some(items) => items,
        None => return Vec::new(),
    };

    let hits: Vec<SearchHit> = items
        .iter()
        .filter_map(|item| {
            let id = item["id"].as_str().unwrap_or("").trim();
            let token = item["xsec_token"].as_str().unwrap_or("").trim();
            if id.is_empty() || token.is_empty() {
                return None;
            }
            let title = item
                .pointer("/note_card/display_title")
                .or_else(|| item.pointer("/note_card/title"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim();
            let url = url::Url::parse_with_params(
                &format!("https://www.xiaohongshu.com/explore/{id}"),
                &[("xsec_token", token), ("xsec_source", "pc_search")],
            )
            .ok()?;
            Some(SearchHit {
                url: url.to_string(),
                hint: safe_text(title, 80),
            })
        })
        .collect();

    let mut unique = uniq_by(hits, |h| h.url.clone());
    unique.truncate(max_links);
    unique
}

/// Breadth-first search for the object carrying this note's id, bounded in
/// depth so a pathological blob cannot stall the run. Key spelling varies by
/// app version.
fn find_note_card<'a>(root: &'a Value, note_id: &str) -> Option<&'a Value> {
    if note_id.is_empty() {
        return None;
    }
    let mut queue = VecDeque::from([(root, 0usize)]);
    while let Some((value, depth)) = queue.pop_front() {
        if depth > MAX_WALK_DEPTH {
            continue;
        }
        match value {
            Value::Object(map) => {
                for key in ["note_id", "noteId", "id", "noteID"] {
                    let matched = match map.get(key) {
                        Some(Value::String(s)) => s == note_id,
                        Some(Value::Number(n)) => n.to_string() == note_id,
                        _ => false,
                    };
                    if matched {
                        return Some(value);
                    }
                }
                for child in map.values() {
                    queue.push_back((child, depth + 1));
                }
            }
            Value::Array(items) => {
                for child in items {
                    queue.push_back((child, depth + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Collapse a nested rich-text value into plain text, bounded in depth.
/// Objects are read through their known text-carrying keys in priority order.
fn flatten_to_text(value: &Value, depth: usize) -> String {
    if depth > FLATTEN_MAX_DEPTH {
        return String::new();
    }
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|v| flatten_to_text(v, depth + 1))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => ["text", "content", "desc", "description", "note"]
            .iter()
            .filter_map(|key| map.get(*key))
            .map(|v| flatten_to_text(v, depth + 1))
            .find(|s| !s.is_empty())
            .unwrap_or_default(),
        Value::Null => String::new(),
    }
}

/// Pull (title, text) for a note out of the client state blob. The walker
/// result wins; fixed well-known paths cover older payload shapes.
fn extract_from_state(state: &Value, note_id: &str) -> (String, String) {
    let card = find_note_card(state, note_id)
        .or_else(|| state.pointer("/data/note"))
        .or_else(|| state.pointer("/data/note_card"))
        .or_else(|| state.pointer("/data/items/0/note_card"))
        .or_else(|| state.pointer("/data/items/0/note"))
        .or_else(|| state.pointer("/data/item/note_card"))
        .or_else(|| state.pointer("/data/item/note"));

    let card = match card {
        Some(card) => card,
        None => return (String::new(), String::new()),
    };

    let title_paths = [
        "/title",
        "/display_title",
        "/note_title",
        "/share_info/title",
        "/note_card/display_title",
    ];
    let title = title_paths
        .iter()
        .filter_map(|p| card.pointer(p))
        .filter_map(Value::as_str)
        .map(|s| safe_text(s, 120))
        .find(|s| !s.is_empty())
        .unwrap_or_default();

    let text_paths = [
        "/desc",
        "/description",
        "/content",
        "/share_info/content",
        "/note_card/desc",
        "/note_card/content",
    ];
    let raw = text_paths
        .iter()
        .filter_map(|p| card.pointer(p))
        .map(|v| flatten_to_text(v, 0))
        .find(|s| !s.is_empty())
        .unwrap_or_default();

    (title, strip_html(&raw))
}

fn first_non_empty(values: &[&str]) -> String {
    values
        .iter()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn note_id_requires_the_explore_shape() {
        assert_eq!(
            extract_note_id("https://www.xiaohongshu.com/explore/65f1a2b3c4d5e6f7a8b9c0d1?x=1"),
            "65f1a2b3c4d5e6f7a8b9c0d1"
        );
        assert_eq!(extract_note_id("https://www.xiaohongshu.com/user/abc"), "");
        assert_eq!(extract_note_id("https://www.xiaohongshu.com/explore/short"), "");
    }

    #[test]
    fn search_hits_need_id_and_token() {
        let payload = json!({
            "data": { "items": [
                { "id": "65f1a2b3c4d5e6f7", "xsec_token": "tok=1",
                  "note_card": { "display_title": "汕头 避雷" } },
                { "id": "65f1a2b3c4d5e6f8" },
                { "xsec_token": "orphan" }
            ]}
        });
        let hits = parse_search_hits(&payload, 10);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].url.contains("/explore/65f1a2b3c4d5e6f7"));
        assert!(hits[0].url.contains("xsec_token=tok%3D1"));
        assert!(hits[0].url.contains("xsec_source=pc_search"));
        assert_eq!(hits[0].hint, "汕头 避雷");
    }

    #[test]
    fn search_hits_tolerate_shape_drift() {
        assert!(parse_search_hits(&json!({"data": {}}), 10).is_empty());
        assert!(parse_search_hits(&json!({"weird": []}), 10).is_empty());
    }

    #[test]
    fn walker_finds_nested_note_card_by_any_id_key() {
        let state = json!({
            "notes": { "byId": { "wrapper": [
                { "noteId": "65f1a2b3c4d5e6f7", "desc": "深层嵌套的内容" }
            ]}}
        });
        let card = find_note_card(&state, "65f1a2b3c4d5e6f7").unwrap();
        assert_eq!(card["desc"], "深层嵌套的内容");

        let numeric = json!({ "entries": [{ "id": 12345, "desc": "数字ID" }] });
        assert!(find_note_card(&numeric, "12345").is_some());
    }

    #[test]
    fn walker_respects_the_depth_bound() {
        let mut state = json!({ "note_id": "deep" });
        for _ in 0..(MAX_WALK_DEPTH + 2) {
            state = json!({ "wrap": state });
        }
        assert!(find_note_card(&state, "deep").is_none());
    }

    #[test]
    fn flatten_reads_text_keys_in_priority_order() {
        let value = json!({
            "content": "次选内容",
            "text": [{ "text": "首选" }, { "text": "内容" }]
        });
        assert_eq!(flatten_to_text(&value, 0), "首选\n内容");

        let value = json!({ "note": { "desc": "兜底描述" } });
        assert_eq!(flatten_to_text(&value, 0), "兜底描述");
    }

    #[test]
    fn missing_storage_state_yields_no_session_options() {
        assert!(XhsAdapter::new(None).session_options().is_none());

        let adapter = XhsAdapter::new(Some(PathBuf::from("/var/state/xhs.json")));
        let options = adapter.session_options().unwrap();
        assert!(options.mask_automation);
        assert_eq!(options.timezone.as_deref(), Some("Asia/Shanghai"));
        assert_eq!(options.viewport, Some((1365, 900)));
        assert!(options.user_agent.unwrap().contains("Chrome"));
    }

    #[test]
    fn state_extraction_walks_then_falls_back_to_known_paths() {
        let state = json!({
            "noteData": {
                "note_id": "65f1a2b3c4d5e6f7",
                "title": "汕头海鲜店避雷",
                "desc": "点单前<br/>一定问清楚价格"
            }
        });
        let (title, text) = extract_from_state(&state, "65f1a2b3c4d5e6f7");
        assert_eq!(title, "汕头海鲜店避雷");
        assert_eq!(text, "点单前\n一定问清楚价格");

        let state = json!({
            "data": { "note": { "title": "旧版结构", "desc": "内容" } }
        });
        let (title, text) = extract_from_state(&state, "nope");
        assert_eq!(title, "旧版结构");
        assert_eq!(text, "内容");
    }
}
