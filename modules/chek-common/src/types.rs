use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChekError;
use crate::text;

/// Hard cap on an ingestion schema body. The assembled body stays below this
/// so the service-side 4000-char bound never rejects an item.
pub const BODY_MAX_CHARS: usize = 3990;

/// Cap on the extracted main text before the attribution footer is appended.
pub const MAIN_TEXT_MAX_CHARS: usize = 3600;

pub const TITLE_MAX_CHARS: usize = 120;

/// Sentinel author identity for all crawler-sourced posts.
pub const CRAWLER_AUTHOR: &str = "投诉雷达";

/// Title of last resort when every extraction path came back empty.
pub const DEFAULT_TITLE: &str = "外部投诉帖";

// --- Platform ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Weibo,
    Xhs,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Weibo => "WEIBO",
            Platform::Xhs => "XHS",
        }
    }

    /// Human-readable source label used in the body footer.
    pub fn source_label(&self) -> &'static str {
        match self {
            Platform::Weibo => "微博",
            Platform::Xhs => "小红书",
        }
    }

    /// Tags every item from this platform carries before scoring tags.
    pub fn base_tags(&self) -> [&'static str; 4] {
        match self {
            Platform::Weibo => ["投诉", "避坑", "外部来源", "微博"],
            Platform::Xhs => ["投诉", "避坑", "外部来源", "小红书"],
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Items ---

/// Raw scrape result from a platform adapter, before scoring and
/// normalization. Lives only inside a single run.
#[derive(Debug, Clone)]
pub struct CandidateItem {
    pub platform: Platform,
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub body: String,
    /// Search-result snippet kept as the weakest extraction fallback.
    pub hint: String,
}

impl CandidateItem {
    /// Idempotency key shared with the content service's upsert.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.platform, self.source_id)
    }
}

/// Item in the ingestion schema shape (camelCase on the wire).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedItem {
    pub source_platform: Platform,
    pub source_id: String,
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_user_one_id: Option<String>,
}

impl NormalizedItem {
    /// Assemble the ingestion shape from a raw candidate: attribution footer,
    /// platform base tags plus the given scoring tags, sentinel author.
    ///
    /// The main text is clipped so the footer always fits whole under
    /// [`BODY_MAX_CHARS`]; the footer itself is never truncated.
    pub fn from_candidate(
        candidate: &CandidateItem,
        score_tags: &[String],
        crawled_at: DateTime<Utc>,
    ) -> Self {
        let footer = format!(
            "\n\n- 来源：{}\n- 原文链接：{}\n- 抓取时间：{}\n",
            candidate.platform.source_label(),
            text::normalize_url(&candidate.source_url),
            crawled_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        let footer_chars = footer.chars().count();
        let main_budget = MAIN_TEXT_MAX_CHARS.min(BODY_MAX_CHARS.saturating_sub(footer_chars));
        let main = text::clip_preserve_newlines(&candidate.body, main_budget);
        let body = format!("{main}{footer}");

        let raw_title = if !candidate.title.trim().is_empty() {
            candidate.title.as_str()
        } else if !candidate.hint.trim().is_empty() {
            candidate.hint.as_str()
        } else {
            DEFAULT_TITLE
        };
        let title = text::safe_text(raw_title, TITLE_MAX_CHARS);

        let mut tags: Vec<String> = candidate
            .platform
            .base_tags()
            .iter()
            .map(|t| t.to_string())
            .collect();
        tags.extend(score_tags.iter().cloned());
        let tags = text::uniq_by(tags, |t| t.clone());

        Self {
            source_platform: candidate.platform,
            source_id: candidate.source_id.clone(),
            source_url: candidate.source_url.clone(),
            title: Some(title),
            body,
            tags: Some(tags),
            location_name: None,
            lng: None,
            lat: None,
            occurred_at: None,
            author_user_one_id: Some(CRAWLER_AUTHOR.to_string()),
        }
    }

    /// Check the item against the ingestion schema bounds before it goes on
    /// the wire. Char counts mirror the service-side limits.
    pub fn validate(&self) -> Result<(), ChekError> {
        fn char_len(s: &str) -> usize {
            s.chars().count()
        }
        let invalid = |msg: String| Err(ChekError::Validation(msg));

        if self.source_id.is_empty() || char_len(&self.source_id) > 128 {
            return invalid(format!("sourceId: length must be 1..=128, got {}", char_len(&self.source_id)));
        }
        if char_len(&self.source_url) > 500 {
            return invalid(format!("sourceUrl: length must be <= 500, got {}", char_len(&self.source_url)));
        }
        if url::Url::parse(&self.source_url).is_err() {
            return invalid(format!("sourceUrl: not a valid URL: {}", self.source_url));
        }
        if let Some(title) = &self.title {
            if char_len(title) > TITLE_MAX_CHARS {
                return invalid(format!("title: length must be <= {TITLE_MAX_CHARS}, got {}", char_len(title)));
            }
        }
        if self.body.is_empty() || char_len(&self.body) > 4000 {
            return invalid(format!("body: length must be 1..=4000, got {}", char_len(&self.body)));
        }
        if let Some(tags) = &self.tags {
            for tag in tags {
                if tag.is_empty() || char_len(tag) > 64 {
                    return invalid(format!("tags: entry length must be 1..=64, got {:?}", tag));
                }
            }
        }
        if let Some(name) = &self.location_name {
            if char_len(name) > 120 {
                return invalid(format!("locationName: length must be <= 120, got {}", char_len(name)));
            }
        }
        if let Some(ts) = &self.occurred_at {
            if DateTime::parse_from_rfc3339(ts).is_err() {
                return invalid(format!("occurredAt: not an ISO datetime: {ts}"));
            }
        }
        if let Some(author) = &self.author_user_one_id {
            if char_len(author) > 64 {
                return invalid(format!("authorUserOneId: length must be <= 64, got {}", char_len(author)));
            }
        }
        Ok(())
    }
}

/// Per-(platform, query) feedback sent to the query bank after a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryReward {
    pub query: String,
    pub reward: f64,
    pub trials: u32,
}
