//! Run orchestration: query selection, the two concurrent platform
//! pipelines, scoring/dedup, ingestion, and bandit reward reporting.
//!
//! Delivery is at-most-best-effort by design: an item lost this run is not
//! retried here, the next scheduled tick simply crawls again.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use chek_common::{CandidateItem, CrawlerConfig, NormalizedItem, Platform, QueryReward};
use content_client::{ContentClient, IngestStatus};

use crate::browser::BrowserHandle;
use crate::platform::{PlatformAdapter, WeiboAdapter, XhsAdapter};
use crate::score;

// --- Content service seam ---

/// The content-service surface the runner depends on. A trait so tests can
/// assert the best-effort calls were made and their failures discarded.
#[async_trait]
pub trait ContentApi: Send + Sync {
    async fn ingest_external_post(
        &self,
        item: &NormalizedItem,
    ) -> content_client::Result<IngestStatus>;
    async fn upsert_queries(
        &self,
        platform: Platform,
        queries: &[String],
    ) -> content_client::Result<bool>;
    async fn sample_queries(
        &self,
        platform: Platform,
        limit: u32,
    ) -> content_client::Result<Vec<String>>;
    async fn report_queries(
        &self,
        platform: Platform,
        items: &[QueryReward],
    ) -> content_client::Result<bool>;
}

#[async_trait]
impl ContentApi for ContentClient {
    async fn ingest_external_post(
        &self,
        item: &NormalizedItem,
    ) -> content_client::Result<IngestStatus> {
        ContentClient::ingest_external_post(self, item).await
    }

    async fn upsert_queries(
        &self,
        platform: Platform,
        queries: &[String],
    ) -> content_client::Result<bool> {
        ContentClient::upsert_queries(self, platform, queries).await
    }

    async fn sample_queries(
        &self,
        platform: Platform,
        limit: u32,
    ) -> content_client::Result<Vec<String>> {
        ContentClient::sample_queries(self, platform, limit).await
    }

    async fn report_queries(
        &self,
        platform: Platform,
        items: &[QueryReward],
    ) -> content_client::Result<bool> {
        ContentClient::report_queries(self, platform, items).await
    }
}

// --- Run accounting ---

/// Run-wide accepted-item budget shared by both platform pipelines. The only
/// cross-task state in a run.
pub struct RunBudget {
    max_items: usize,
    used: AtomicUsize,
}

impl RunBudget {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items,
            used: AtomicUsize::new(0),
        }
    }

    /// Try to reserve one accepted-item slot.
    pub fn try_consume(&self) -> bool {
        let current = self.used.fetch_add(1, Ordering::Relaxed);
        if current >= self.max_items {
            self.used.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn exhausted(&self) -> bool {
        self.used.load(Ordering::Relaxed) >= self.max_items
    }
}

/// Stats from one crawler run.
#[derive(Debug, Default)]
pub struct RunStats {
    pub accepted: usize,
    pub ingested_ok: usize,
    pub ingested_skipped: usize,
    pub ingested_failed: usize,
    pub elapsed_ms: u64,
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Crawler Run Complete ===")?;
        writeln!(f, "Items accepted:    {}", self.accepted)?;
        writeln!(f, "Ingested ok:       {}", self.ingested_ok)?;
        writeln!(f, "Ingested skipped:  {}", self.ingested_skipped)?;
        writeln!(f, "Ingested failed:   {}", self.ingested_failed)?;
        write!(f, "Elapsed:           {}ms", self.elapsed_ms)
    }
}

#[derive(Debug, Default)]
struct PlatformOutcome {
    items: Vec<NormalizedItem>,
    rewards: Vec<QueryReward>,
}

#[derive(Debug, Default)]
struct QueryTally {
    trials: u32,
    accepted: u32,
    total_score: f64,
}

// --- Run entry point ---

/// Execute one full crawl-score-ingest run. The browser is closed whatever
/// the outcome.
pub async fn run(config: &CrawlerConfig, content: &dyn ContentApi) -> Result<RunStats> {
    let started = Instant::now();
    info!(
        cron = %config.cron,
        max_items_per_run = config.max_items_per_run,
        "crawler_run_start"
    );

    let browser = BrowserHandle::launch(config.headless)
        .await
        .context("Failed to launch browser")?;

    let result = run_inner(config, content, &browser, started).await;

    browser.close().await;
    result
}

async fn run_inner(
    config: &CrawlerConfig,
    content: &dyn ContentApi,
    browser: &BrowserHandle,
    started: Instant,
) -> Result<RunStats> {
    // Best-effort idempotent seeding so the bank always has the static list.
    if config.use_query_bandit {
        futures::join!(
            seed_queries(content, config, Platform::Weibo),
            seed_queries(content, config, Platform::Xhs),
        );
    }

    let (weibo_queries, xhs_queries) = futures::join!(
        select_queries(content, config, Platform::Weibo),
        select_queries(content, config, Platform::Xhs),
    );

    let budget = RunBudget::new(config.max_items_per_run);
    let weibo = WeiboAdapter::new(config.weibo_storage_state.clone());
    let xhs = XhsAdapter::new(config.xhs_storage_state.clone());

    // All-settled join: a whole-platform failure is contained and the other
    // pipeline and already-collected items proceed.
    let (weibo_outcome, xhs_outcome) = futures::join!(
        run_platform_contained(browser, &weibo, &weibo_queries, config, &budget),
        run_platform_contained(browser, &xhs, &xhs_queries, config, &budget),
    );

    let mut items = weibo_outcome.items;
    items.extend(xhs_outcome.items);
    items.truncate(config.max_items_per_run);

    let mut stats = RunStats {
        accepted: items.len(),
        ..RunStats::default()
    };
    ingest_items(content, &items, &mut stats).await;

    if config.use_query_bandit {
        futures::join!(
            report_rewards(content, Platform::Weibo, &weibo_outcome.rewards),
            report_rewards(content, Platform::Xhs, &xhs_outcome.rewards),
        );
    }

    stats.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        accepted = stats.accepted,
        ingested_ok = stats.ingested_ok,
        ingested_skipped = stats.ingested_skipped,
        ingested_failed = stats.ingested_failed,
        elapsed_ms = stats.elapsed_ms,
        "crawler_run_done"
    );
    Ok(stats)
}

// --- Query selection / feedback ---

async fn seed_queries(content: &dyn ContentApi, config: &CrawlerConfig, platform: Platform) {
    if let Err(e) = content.upsert_queries(platform, &config.keywords).await {
        warn!(platform = %platform, error = %e, "query_seed_failed");
    }
}

/// Sampled bank queries when the bandit is on, static keywords otherwise.
/// Any sampling failure falls back silently to the static list for this
/// platform only.
async fn select_queries(
    content: &dyn ContentApi,
    config: &CrawlerConfig,
    platform: Platform,
) -> Vec<String> {
    if !config.use_query_bandit {
        return config.keywords.clone();
    }
    match content
        .sample_queries(platform, config.query_limit_per_platform)
        .await
    {
        Ok(queries) if !queries.is_empty() => queries,
        Ok(_) => config.keywords.clone(),
        Err(e) => {
            warn!(platform = %platform, error = %e, "query_sample_failed");
            config.keywords.clone()
        }
    }
}

/// Submit-and-discard: the bank is an optimization, never run-critical.
async fn report_rewards(content: &dyn ContentApi, platform: Platform, rewards: &[QueryReward]) {
    if rewards.is_empty() {
        return;
    }
    if let Err(e) = content.report_queries(platform, rewards).await {
        warn!(platform = %platform, error = %e, "query_report_failed");
    }
}

fn blended_reward(tally: &QueryTally) -> f64 {
    let acceptance_rate = if tally.trials > 0 {
        (tally.accepted as f64 / tally.trials as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mean_accepted = if tally.accepted > 0 {
        tally.total_score / tally.accepted as f64
    } else {
        0.0
    };
    acceptance_rate * 0.8 + mean_accepted * 0.2
}

// --- Platform pipelines ---

async fn run_platform_contained(
    browser: &BrowserHandle,
    adapter: &dyn PlatformAdapter,
    queries: &[String],
    config: &CrawlerConfig,
    budget: &RunBudget,
) -> PlatformOutcome {
    match run_platform(browser, adapter, queries, config, budget).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(platform = %adapter.platform(), error = %e, "platform_run_failed");
            PlatformOutcome::default()
        }
    }
}

async fn run_platform(
    browser: &BrowserHandle,
    adapter: &dyn PlatformAdapter,
    queries: &[String],
    config: &CrawlerConfig,
    budget: &RunBudget,
) -> Result<PlatformOutcome> {
    let platform = adapter.platform();
    let Some(session) = adapter.open_session(browser).await? else {
        return Ok(PlatformOutcome::default());
    };

    let per_platform_max = config.per_platform_max();
    let mut outcome = PlatformOutcome::default();
    let mut seen = HashSet::new();

    for query in queries {
        if budget.exhausted() {
            break;
        }
        let keyword = query.trim();
        if keyword.is_empty() {
            continue;
        }

        // Per-keyword containment: a timeout or crash on one keyword only
        // costs that keyword's yield.
        let fetched = match adapter
            .crawl_keyword(&session, keyword, per_platform_max)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(platform = %platform, keyword, error = %e, "keyword_crawl_failed");
                Vec::new()
            }
        };

        let (items, tally) =
            screen_candidates(&fetched, &mut seen, config.score_threshold, budget);
        let accepted_count = items.len();
        let reward = blended_reward(&tally);
        outcome.items.extend(items);
        outcome.rewards.push(QueryReward {
            query: keyword.to_string(),
            reward,
            trials: tally.trials.max(1),
        });
        info!(
            platform = %platform,
            query = keyword,
            fetched = fetched.len(),
            trials = tally.trials,
            accepted = accepted_count,
            reward,
            "query_done"
        );
    }

    session.close().await;
    Ok(outcome)
}

/// Score, threshold, tag, and dedup one keyword's candidates. `seen` spans
/// the whole platform run, so a post surfacing under several keywords counts
/// as a trial only where it was first seen.
fn screen_candidates(
    fetched: &[CandidateItem],
    seen: &mut HashSet<String>,
    threshold: f64,
    budget: &RunBudget,
) -> (Vec<NormalizedItem>, QueryTally) {
    let mut tally = QueryTally::default();
    let mut items = Vec::new();

    for candidate in fetched {
        if !seen.insert(candidate.dedup_key()) {
            continue;
        }
        tally.trials += 1;

        let result = score::score(&candidate.title, &candidate.body);
        if result.score < threshold {
            continue;
        }
        if !budget.try_consume() {
            break;
        }

        tally.accepted += 1;
        tally.total_score += result.score;
        let tags = vec![confidence_tag(result.score).to_string()];
        items.push(NormalizedItem::from_candidate(candidate, &tags, Utc::now()));
    }

    (items, tally)
}

fn confidence_tag(score: f64) -> &'static str {
    if score >= 0.8 {
        "AI高置信"
    } else if score >= 0.65 {
        "AI较可信"
    } else {
        "AI筛选"
    }
}

// --- Ingestion ---

/// Sequential ingestion with per-item failure isolation.
async fn ingest_items(content: &dyn ContentApi, items: &[NormalizedItem], stats: &mut RunStats) {
    for item in items {
        match content.ingest_external_post(item).await {
            Ok(IngestStatus::Ok) => stats.ingested_ok += 1,
            Ok(IngestStatus::Skipped) => stats.ingested_skipped += 1,
            Ok(IngestStatus::Failed) => stats.ingested_failed += 1,
            Err(e) => {
                stats.ingested_failed += 1;
                error!(
                    source_platform = %item.source_platform,
                    source_id = %item.source_id,
                    error = %e,
                    "ingest_failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use content_client::ContentError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeContent {
        sample_error_for: Option<Platform>,
        sampled: Vec<String>,
        ingest_fails_for: Option<&'static str>,
        report_error: bool,
        reported: Mutex<Vec<(Platform, usize)>>,
        upserted: Mutex<Vec<Platform>>,
    }

    fn api_error() -> ContentError {
        ContentError::Api {
            status: 500,
            message: "boom".into(),
        }
    }

    #[async_trait]
    impl ContentApi for FakeContent {
        async fn ingest_external_post(
            &self,
            item: &NormalizedItem,
        ) -> content_client::Result<IngestStatus> {
            if self.ingest_fails_for == Some(item.source_id.as_str()) {
                return Err(api_error());
            }
            Ok(IngestStatus::Ok)
        }

        async fn upsert_queries(
            &self,
            platform: Platform,
            _queries: &[String],
        ) -> content_client::Result<bool> {
            self.upserted.lock().unwrap().push(platform);
            Ok(true)
        }

        async fn sample_queries(
            &self,
            platform: Platform,
            _limit: u32,
        ) -> content_client::Result<Vec<String>> {
            if self.sample_error_for == Some(platform) {
                return Err(api_error());
            }
            Ok(self.sampled.clone())
        }

        async fn report_queries(
            &self,
            platform: Platform,
            items: &[QueryReward],
        ) -> content_client::Result<bool> {
            self.reported.lock().unwrap().push((platform, items.len()));
            if self.report_error {
                return Err(api_error());
            }
            Ok(true)
        }
    }

    fn test_config() -> CrawlerConfig {
        CrawlerConfig::from_source(|key| match key {
            "CHEK_CONTENT_BASE_URL" => Some("http://content:8080".into()),
            "CHEK_INGEST_TOKEN" => Some("secret".into()),
            _ => None,
        })
        .unwrap()
    }

    fn candidate(id: &str, body: &str) -> CandidateItem {
        CandidateItem {
            platform: Platform::Weibo,
            source_id: id.into(),
            source_url: format!("https://weibo.com/1234/{id}"),
            title: "汕头宰客曝光".into(),
            body: body.into(),
            hint: String::new(),
        }
    }

    fn strong_body() -> String {
        format!(
            "在汕头被宰，订单金额120元变三百，已投诉并报警。{}",
            "完整经过和细节记录如下，提醒大家避坑。".repeat(10)
        )
    }

    #[tokio::test]
    async fn sample_failure_falls_back_to_static_list_for_that_platform_only() {
        let config = test_config();
        let fake = FakeContent {
            sample_error_for: Some(Platform::Weibo),
            sampled: vec!["采样 关键词".into()],
            ..FakeContent::default()
        };

        let weibo = select_queries(&fake, &config, Platform::Weibo).await;
        let xhs = select_queries(&fake, &config, Platform::Xhs).await;

        assert_eq!(weibo, config.keywords);
        assert_eq!(xhs, vec!["采样 关键词".to_string()]);
    }

    #[tokio::test]
    async fn empty_sample_also_falls_back() {
        let config = test_config();
        let fake = FakeContent::default();
        let queries = select_queries(&fake, &config, Platform::Xhs).await;
        assert_eq!(queries, config.keywords);
    }

    #[tokio::test]
    async fn bandit_off_skips_the_bank_entirely() {
        let mut config = test_config();
        config.use_query_bandit = false;
        let fake = FakeContent {
            sampled: vec!["不应该被使用".into()],
            ..FakeContent::default()
        };
        let queries = select_queries(&fake, &config, Platform::Weibo).await;
        assert_eq!(queries, config.keywords);
    }

    #[tokio::test]
    async fn seeding_reaches_both_platforms() {
        let config = test_config();
        let fake = FakeContent::default();
        futures::join!(
            seed_queries(&fake, &config, Platform::Weibo),
            seed_queries(&fake, &config, Platform::Xhs),
        );
        let upserted = fake.upserted.lock().unwrap();
        assert!(upserted.contains(&Platform::Weibo));
        assert!(upserted.contains(&Platform::Xhs));
    }

    #[tokio::test]
    async fn report_errors_are_invoked_then_discarded() {
        let fake = FakeContent {
            report_error: true,
            ..FakeContent::default()
        };
        let rewards = vec![QueryReward {
            query: "汕头 宰客".into(),
            reward: 0.5,
            trials: 3,
        }];

        // Must not propagate the error.
        report_rewards(&fake, Platform::Weibo, &rewards).await;

        let reported = fake.reported.lock().unwrap();
        assert_eq!(*reported, vec![(Platform::Weibo, 1)]);
    }

    #[tokio::test]
    async fn empty_rewards_are_not_reported() {
        let fake = FakeContent::default();
        report_rewards(&fake, Platform::Xhs, &[]).await;
        assert!(fake.reported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ingest_failure_counts_and_does_not_block_later_items() {
        let fake = FakeContent {
            ingest_fails_for: Some("AAA111"),
            ..FakeContent::default()
        };
        let budget = RunBudget::new(10);
        let mut seen = HashSet::new();
        let (items, _) = screen_candidates(
            &[candidate("AAA111", &strong_body()), candidate("BBB222", &strong_body())],
            &mut seen,
            0.55,
            &budget,
        );
        assert_eq!(items.len(), 2);

        let mut stats = RunStats::default();
        ingest_items(&fake, &items, &mut stats).await;
        assert_eq!(stats.ingested_failed, 1);
        assert_eq!(stats.ingested_ok, 1);
    }

    #[test]
    fn duplicate_source_ids_survive_only_once() {
        let budget = RunBudget::new(10);
        let mut seen = HashSet::new();
        let first = candidate("AAA111", &strong_body());
        let mut second = candidate("AAA111", &strong_body());
        second.body.push_str("不同的正文结尾");

        let (items, tally) = screen_candidates(
            &[first, second],
            &mut seen,
            0.55,
            &budget,
        );
        assert_eq!(items.len(), 1);
        assert_eq!(tally.trials, 1);
    }

    #[test]
    fn low_scoring_candidates_are_dropped_but_count_as_trials() {
        let budget = RunBudget::new(10);
        let mut seen = HashSet::new();
        let (items, tally) = screen_candidates(
            &[candidate("AAA111", "种草 优惠 私信")],
            &mut seen,
            0.55,
            &budget,
        );
        assert!(items.is_empty());
        assert_eq!(tally.trials, 1);
        assert_eq!(tally.accepted, 0);
    }

    #[test]
    fn budget_caps_acceptance_across_calls() {
        let budget = RunBudget::new(1);
        let mut seen = HashSet::new();
        let (items, _) = screen_candidates(
            &[candidate("AAA111", &strong_body()), candidate("BBB222", &strong_body())],
            &mut seen,
            0.55,
            &budget,
        );
        assert_eq!(items.len(), 1);
        assert!(budget.exhausted());
        assert!(!budget.try_consume());
    }

    #[test]
    fn reward_stays_in_bounds_for_every_tally() {
        for trials in 1u32..=8 {
            for accepted in 0..=trials {
                let tally = QueryTally {
                    trials,
                    accepted,
                    // Accepted scores are each in [0, 1].
                    total_score: accepted as f64 * 1.0,
                };
                let reward = blended_reward(&tally);
                assert!((0.0..=1.0).contains(&reward), "reward {reward} out of bounds");
            }
        }
        assert_eq!(blended_reward(&QueryTally::default()), 0.0);
    }

    #[test]
    fn confidence_tag_tiers_match_thresholds() {
        assert_eq!(confidence_tag(0.85), "AI高置信");
        assert_eq!(confidence_tag(0.8), "AI高置信");
        assert_eq!(confidence_tag(0.7), "AI较可信");
        assert_eq!(confidence_tag(0.6), "AI筛选");
    }

    #[test]
    fn accepted_items_carry_a_confidence_tag() {
        let budget = RunBudget::new(10);
        let mut seen = HashSet::new();
        let (items, _) = screen_candidates(
            &[candidate("AAA111", &strong_body())],
            &mut seen,
            0.55,
            &budget,
        );
        let tags = items[0].tags.as_deref().unwrap();
        assert!(tags
            .iter()
            .any(|t| t == "AI高置信" || t == "AI较可信" || t == "AI筛选"));
    }
}
