//! Scenario-driven scorer + normalization tests.
//!
//! Pure functions only, no browser and no network: validates the acceptance
//! pipeline a candidate goes through between extraction and ingestion.
//!
//! Run with: cargo test -p chek-crawler --test scoring_scenarios_test

use chrono::{TimeZone, Utc};

use chek_common::{CandidateItem, NormalizedItem, Platform, BODY_MAX_CHARS};
use chek_crawler::score::{score, Label};

const ACCEPT_THRESHOLD: f64 = 0.55;

fn weibo_candidate(title: &str, body: &str) -> CandidateItem {
    CandidateItem {
        platform: Platform::Weibo,
        source_id: "NmAbC123".into(),
        source_url: "https://weibo.com/7654321/NmAbC123".into(),
        title: title.into(),
        body: body.into(),
        hint: "搜索摘要".into(),
    }
}

// ---------------------------------------------------------------------------
// Scenario: substantive regional complaint post → accepted and tagged
// ---------------------------------------------------------------------------

#[test]
fn regional_complaint_with_evidence_is_accepted() {
    let body = format!(
        "五一假期在汕头一家海鲜大排档被宰，订单写着120元一斤的螃蟹结账变成三百八。\
         当场报警，也已经向市场监管部门投诉，截图和录音都留了。{}",
        "希望平台多曝光这类黑店，大家出行注意避坑。".repeat(4)
    );
    let candidate = weibo_candidate("汕头宰客曝光", &body);

    let result = score(&candidate.title, &candidate.body);
    assert!(result.score > ACCEPT_THRESHOLD, "score {}", result.score);
    assert!(result.labels.contains(&Label::Complaint));
    assert!(result.labels.contains(&Label::GeoRelated));
    assert!(result.labels.contains(&Label::HasEvidence));
    // High enough for at least the mid confidence tier.
    assert!(result.score >= 0.65, "score {}", result.score);

    let item = NormalizedItem::from_candidate(
        &candidate,
        &["AI较可信".to_string()],
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap(),
    );
    item.validate().expect("accepted item passes the ingestion schema");
    assert!(item.tags.as_deref().unwrap().contains(&"AI较可信".to_string()));
    assert!(item.body.contains("- 来源：微博"));
}

// ---------------------------------------------------------------------------
// Scenario: short promotional snippet → dropped before ingestion
// ---------------------------------------------------------------------------

#[test]
fn short_promotional_snippet_is_dropped() {
    let result = score("", "种草 优惠 加V 私信 买一送一，最低价直接拿");
    assert!(result.score < ACCEPT_THRESHOLD, "score {}", result.score);
    assert!(result.labels.contains(&Label::LikelySpam));
}

// ---------------------------------------------------------------------------
// Scenario: over-long extraction → capped body, footer intact
// ---------------------------------------------------------------------------

#[test]
fn oversized_extraction_is_capped_with_footer_intact() {
    let candidate = weibo_candidate("汕头投诉", &"投诉细节。".repeat(2000));
    let item = NormalizedItem::from_candidate(
        &candidate,
        &[],
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap(),
    );

    assert!(item.body.chars().count() <= BODY_MAX_CHARS);
    assert!(item.body.ends_with("- 抓取时间：2024-05-01T08:30:00.000Z\n"));
    item.validate().expect("capped item passes the ingestion schema");
}
