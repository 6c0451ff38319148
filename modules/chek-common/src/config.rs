use std::env;
use std::path::PathBuf;

use crate::error::ChekError;

const DEFAULT_CRON: &str = "0 */6 * * *";
const DEFAULT_KEYWORDS: &str = "潮汕 投诉,汕头 宰客,潮州 避雷,揭阳 被坑,潮汕 旅游 被宰,汕头 旅游 投诉";

/// Crawler configuration, loaded from the environment once at boot and passed
/// by reference from there on.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub content_base_url: String,
    pub ingest_token: String,
    /// Six-field (seconds-first) crontab expression.
    pub cron: String,
    pub max_items_per_run: usize,
    pub query_limit_per_platform: u32,
    pub use_query_bandit: bool,
    pub score_threshold: f64,
    pub run_once: bool,
    pub headless: bool,
    pub weibo_storage_state: Option<PathBuf>,
    pub xhs_storage_state: Option<PathBuf>,
    pub keywords: Vec<String>,
}

impl CrawlerConfig {
    pub fn from_env() -> Result<Self, ChekError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Tests inject a map here instead of
    /// mutating process-wide environment state.
    pub fn from_source<F>(get: F) -> Result<Self, ChekError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ChekError> {
            match get(key) {
                Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
                _ => Err(ChekError::Config(format!("{key} is required"))),
            }
        };

        let content_base_url = required("CHEK_CONTENT_BASE_URL")?;
        let ingest_token = required("CHEK_INGEST_TOKEN")?;

        let cron = normalize_cron(
            get("CRON")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CRON.to_string())
                .trim(),
        )?;

        let max_items_per_run =
            parse_ranged(&get, "MAX_ITEMS_PER_RUN", 40, 1, 200)? as usize;
        let query_limit_per_platform =
            parse_ranged(&get, "QUERY_LIMIT_PER_PLATFORM", 4, 1, 30)? as u32;

        let score_threshold = match get("AI_SCORE_THRESHOLD").filter(|v| !v.trim().is_empty()) {
            None => 0.55,
            Some(raw) => {
                let v: f64 = raw.trim().parse().map_err(|_| {
                    ChekError::Config(format!("AI_SCORE_THRESHOLD: expected a number, got {raw:?}"))
                })?;
                if !(0.0..=1.0).contains(&v) {
                    return Err(ChekError::Config(format!(
                        "AI_SCORE_THRESHOLD: must be within 0..=1, got {v}"
                    )));
                }
                v
            }
        };

        // Flag semantics match the original service: the bandit and headless
        // mode are on unless explicitly "false"; run-once is off unless
        // explicitly "true".
        let flag = |key: &str| get(key).map(|v| v.trim().to_lowercase());
        let use_query_bandit = flag("USE_QUERY_BANDIT").as_deref() != Some("false");
        let run_once = flag("RUN_ONCE").as_deref() == Some("true");
        let headless = match get("HEADLESS") {
            Some(v) if !v.trim().is_empty() => v.trim().to_lowercase() != "false",
            _ => true,
        };

        let path_of = |key: &str| -> Option<PathBuf> {
            get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        let weibo_storage_state = path_of("WEIBO_STORAGE_STATE_PATH");
        let xhs_storage_state = path_of("XHS_STORAGE_STATE_PATH");

        let keywords: Vec<String> = get("KEYWORDS")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_KEYWORDS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(ChekError::Config("KEYWORDS: no usable keywords".into()));
        }

        Ok(Self {
            content_base_url,
            ingest_token,
            cron,
            max_items_per_run,
            query_limit_per_platform,
            use_query_bandit,
            score_threshold,
            run_once,
            headless,
            weibo_storage_state,
            xhs_storage_state,
            keywords,
        })
    }

    /// Per-platform fetch cap for one run.
    pub fn per_platform_max(&self) -> usize {
        (self.max_items_per_run / 2).max(1)
    }
}

fn parse_ranged<F>(get: &F, key: &str, default: i64, min: i64, max: i64) -> Result<i64, ChekError>
where
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => {
            let v: i64 = raw.trim().parse().map_err(|_| {
                ChekError::Config(format!("{key}: expected an integer, got {raw:?}"))
            })?;
            if v < min || v > max {
                return Err(ChekError::Config(format!(
                    "{key}: must be within {min}..={max}, got {v}"
                )));
            }
            Ok(v)
        }
    }
}

/// Accept both classic five-field crontabs and the six-field (seconds-first)
/// form the scheduler parses; five-field input gets a `0` seconds column.
fn normalize_cron(expr: &str) -> Result<String, ChekError> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {expr}")),
        6 | 7 => Ok(expr.to_string()),
        _ => Err(ChekError::Config(format!(
            "CRON: expected 5 or 6 fields, got {fields} in {expr:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("CHEK_CONTENT_BASE_URL", "http://content:8080"),
            ("CHEK_INGEST_TOKEN", "secret"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<CrawlerConfig, ChekError> {
        CrawlerConfig::from_source(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.cron, "0 0 */6 * * *");
        assert_eq!(config.max_items_per_run, 40);
        assert_eq!(config.query_limit_per_platform, 4);
        assert!(config.use_query_bandit);
        assert_eq!(config.score_threshold, 0.55);
        assert!(!config.run_once);
        assert!(config.headless);
        assert!(config.weibo_storage_state.is_none());
        assert_eq!(config.keywords.len(), 6);
        assert_eq!(config.keywords[0], "潮汕 投诉");
    }

    #[test]
    fn missing_required_var_is_a_config_error() {
        let mut env = base_env();
        env.remove("CHEK_INGEST_TOKEN");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, ChekError::Config(ref m) if m.contains("CHEK_INGEST_TOKEN")));
    }

    #[test]
    fn flag_semantics_match_the_service() {
        let mut env = base_env();
        env.insert("USE_QUERY_BANDIT", "False");
        env.insert("RUN_ONCE", "TRUE");
        env.insert("HEADLESS", "false");
        let config = load(&env).unwrap();
        assert!(!config.use_query_bandit);
        assert!(config.run_once);
        assert!(!config.headless);

        let mut env = base_env();
        env.insert("HEADLESS", "   ");
        env.insert("RUN_ONCE", "yes");
        let config = load(&env).unwrap();
        assert!(config.headless);
        assert!(!config.run_once);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut env = base_env();
        env.insert("MAX_ITEMS_PER_RUN", "500");
        assert!(load(&env).is_err());

        let mut env = base_env();
        env.insert("AI_SCORE_THRESHOLD", "1.5");
        assert!(load(&env).is_err());
    }

    #[test]
    fn keywords_are_split_and_trimmed() {
        let mut env = base_env();
        env.insert("KEYWORDS", " 汕头 宰客 , ,潮州 避雷 ");
        let config = load(&env).unwrap();
        assert_eq!(config.keywords, vec!["汕头 宰客", "潮州 避雷"]);
    }

    #[test]
    fn six_field_cron_passes_through_and_junk_is_rejected() {
        let mut env = base_env();
        env.insert("CRON", "0 30 2 * * *");
        assert_eq!(load(&env).unwrap().cron, "0 30 2 * * *");

        let mut env = base_env();
        env.insert("CRON", "every six hours");
        assert!(load(&env).is_err());
    }

    #[test]
    fn per_platform_max_splits_the_run_budget() {
        let mut env = base_env();
        env.insert("MAX_ITEMS_PER_RUN", "1");
        assert_eq!(load(&env).unwrap().per_platform_max(), 1);

        let mut env = base_env();
        env.insert("MAX_ITEMS_PER_RUN", "40");
        assert_eq!(load(&env).unwrap().per_platform_max(), 20);
    }
}
