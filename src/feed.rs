use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::error::{IngestError, Result};
use crate::neo::{self, NeoObject};

const USER_AGENT: &str = concat!("neo-ingest/", env!("CARGO_PKG_VERSION"));

/// One page of the NEO feed. Date buckets iterate in ascending date order.
#[derive(Debug, Deserialize)]
struct FeedPage {
    #[serde(default)]
    links: FeedLinks,
    #[serde(default)]
    near_earth_objects: BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct FeedLinks {
    next: Option<String>,
}

/// Why a [`FeedPager`] stopped yielding records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TargetReached,
    Exhausted,
    Failed,
}

/// Everything a finished pager produced, including records gathered before a failure.
#[derive(Debug)]
pub struct FetchOutcome {
    pub records: Vec<NeoObject>,
    pub pages: usize,
    pub skipped: usize,
    pub stop: StopReason,
    pub error: Option<IngestError>,
}

pub struct FeedClient {
    http: Client,
    config: FeedConfig,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    /// Start a fresh walk of the feed from the configured window.
    pub fn pager(&self) -> FeedPager<'_> {
        FeedPager {
            client: self,
            next_url: Some(self.config.first_page_url().to_string()),
            buffer: VecDeque::new(),
            target: self.config.target,
            yielded: 0,
            pages: 0,
            skipped: 0,
            stop: None,
            error: None,
        }
    }

    pub async fn fetch_all(&self) -> FetchOutcome {
        self.pager().collect().await
    }

    async fn fetch_page(&self, url: &str) -> Result<FeedPage> {
        let body = self.get_text(url).await.map_err(|e| match Url::parse(&redact(url)) {
            Ok(safe) => e.with_url(safe),
            Err(_) => e.without_url(),
        })?;

        let value: Value = serde_json::from_str(&body)?;
        if let Some(err) = value.get("error") {
            return Err(IngestError::Api(err.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn get_text(&self, url: &str) -> reqwest::Result<String> {
        self.http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

/// Lazy walk over the feed's `links.next` chain.
///
/// Pages are requested one at a time, only once the records of the previous page are
/// used up, with `request_delay` between requests. The walk ends at the target count,
/// at a page without a next link, or at the first transport or structure error; the
/// error is kept on the pager instead of being returned.
pub struct FeedPager<'a> {
    client: &'a FeedClient,
    next_url: Option<String>,
    buffer: VecDeque<NeoObject>,
    target: usize,
    yielded: usize,
    pages: usize,
    skipped: usize,
    stop: Option<StopReason>,
    error: Option<IngestError>,
}

impl FeedPager<'_> {
    pub async fn next(&mut self) -> Option<NeoObject> {
        loop {
            if self.yielded >= self.target {
                self.finish(StopReason::TargetReached);
                return None;
            }
            if let Some(record) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(record);
            }
            if self.stop.is_some() {
                return None;
            }
            let Some(url) = self.next_url.take() else {
                self.finish(StopReason::Exhausted);
                return None;
            };

            if self.pages > 0 {
                self.rate_limit().await;
            }

            info!(page = self.pages + 1, url = %redact(&url), "Fetching feed page");
            match self.client.fetch_page(&url).await {
                Ok(page) => {
                    self.pages += 1;
                    self.next_url = page.links.next;
                    let accepted = self.accept(page.near_earth_objects);
                    info!(
                        page = self.pages,
                        accepted,
                        total = self.yielded + self.buffer.len(),
                        "Processed feed page"
                    );
                }
                Err(e) => {
                    error!(page = self.pages + 1, "Feed request failed: {}", e);
                    self.error = Some(e);
                    self.finish(StopReason::Failed);
                }
            }
        }
    }

    pub async fn collect(mut self) -> FetchOutcome {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record);
        }
        FetchOutcome {
            records,
            pages: self.pages,
            skipped: self.skipped,
            stop: self.stop.unwrap_or(StopReason::Exhausted),
            error: self.error,
        }
    }

    /// Normalize a page's entries into the buffer, stopping once the target is covered.
    fn accept(&mut self, buckets: BTreeMap<String, Vec<Value>>) -> usize {
        let mut accepted = 0;
        for (date, entries) in buckets {
            for raw in entries {
                if self.yielded + self.buffer.len() >= self.target {
                    return accepted;
                }
                match neo::normalize(&raw) {
                    Ok(record) => {
                        self.buffer.push_back(record);
                        accepted += 1;
                    }
                    Err(e) => {
                        let e = IngestError::from(e);
                        warn!(date = %date, "Skipping record: {}", e);
                        self.skipped += 1;
                    }
                }
            }
        }
        accepted
    }

    async fn rate_limit(&self) {
        let delay = self.client.config.request_delay;
        if delay > Duration::ZERO {
            debug!("Waiting {:.1}s before next page", delay.as_secs_f64());
            tokio::time::sleep(delay).await;
        }
    }

    fn finish(&mut self, reason: StopReason) {
        if self.stop.is_none() {
            match reason {
                StopReason::TargetReached => info!("Target of {} records reached", self.target),
                StopReason::Exhausted => warn!("No more data available from feed"),
                StopReason::Failed => {}
            }
            self.stop = Some(reason);
        }
    }
}

/// Hide the `api_key` query value of a feed URL.
fn redact(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "api_key" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    if pairs.is_empty() {
        return parsed.to_string();
    }
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.to_string()
}
