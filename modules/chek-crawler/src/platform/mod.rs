pub mod weibo;
pub mod xhs;

pub use weibo::WeiboAdapter;
pub use xhs::XhsAdapter;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use chek_common::{CandidateItem, Platform};

use crate::browser::{BrowserHandle, Session};

pub(crate) const NAV_TIMEOUT: Duration = Duration::from_secs(60);

/// A search-result link paired with its snippet text. The snippet is the
/// weakest extraction fallback when the detail page yields nothing.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub url: String,
    pub hint: String,
}

/// Browser-driven search + detail extraction for one platform.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Open this platform's authenticated session. Returns `None` (after a
    /// warning) when no storage state is configured — an anonymous crawl is
    /// never attempted.
    async fn open_session(&self, browser: &BrowserHandle) -> Result<Option<Session>>;

    /// Collect up to `max_items` candidates for one keyword. "No results"
    /// and login walls yield an empty list, not an error; errors here are
    /// contained per keyword by the caller.
    async fn crawl_keyword(
        &self,
        session: &Session,
        keyword: &str,
        max_items: usize,
    ) -> Result<Vec<CandidateItem>>;
}
