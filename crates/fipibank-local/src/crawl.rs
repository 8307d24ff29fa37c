//! Crawl loop: filter by task number, walk listing pages, persist raw cards.
//!
//! Per task: open the filter panel, set the task number, apply, then for each page extract
//! cards and advance (numbered link first, `page` query parameter second). Only the initial
//! navigation is fatal; everything else degrades to skipping a page or a task.

use crate::assets::AssetStore;
use crate::extract::{self, Card};
use crate::store::{self, CorpusLayout};
use crate::throttle::{with_retry, RetryPolicy, Throttle};
use fipibank_core::{BrowserDriver, Error, ExamId, FrameRef, Level, Locator, Result, Sanitizer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://ege.fipi.ru/bank/";
pub const QUESTIONS_FRAME: &str = "questions_container";
const QUESTIONS_PAGE: &str = "questions.php";

const FILTER_OPEN: &str = r"Подбор\s+задани";
const TASK_NUMBER_LABEL: &str = r"Номер\s+задан";
const FILTER_APPLY: &str = r"Применит|Показат";

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub exam: ExamId,
    pub level: Level,
    pub base_url: String,
    pub start_task: u32,
    pub end_task: u32,
    pub start_page: u32,
    pub end_page: u32,
    /// Cards saved per task before moving on; 0 means dry run.
    pub limit: usize,
    pub debug_html: Option<PathBuf>,
    pub nav_timeout: Duration,
    pub wait_timeout: Duration,
    pub click_timeout: Duration,
    pub load_timeout: Duration,
    /// Pause after applying the filter.
    pub settle: Duration,
    pub retry: RetryPolicy,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            exam: ExamId::Ege,
            level: Level::Basic,
            base_url: DEFAULT_BASE_URL.to_string(),
            start_task: 1,
            end_task: 11,
            start_page: 1,
            end_page: 50,
            limit: 600,
            debug_html: None,
            nav_timeout: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(20),
            click_timeout: Duration::from_secs(5),
            load_timeout: Duration::from_secs(30),
            settle: Duration::from_millis(800),
            retry: RetryPolicy::default(),
        }
    }
}

impl CrawlOptions {
    pub fn is_dry_run(&self) -> bool {
        self.limit == 0
    }

    fn tasks(&self) -> std::ops::RangeInclusive<u32> {
        let start = self.start_task.max(1);
        start..=self.end_task.max(start)
    }

    fn pages(&self) -> std::ops::RangeInclusive<u32> {
        let start = self.start_page.max(1);
        start..=self.end_page.max(start)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub pages: u32,
    pub saved: usize,
    pub real: usize,
    pub synthetic: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlSummary {
    pub dry_run: bool,
    pub tasks: BTreeMap<u32, TaskSummary>,
    /// Tasks abandoned after retries ran out.
    pub failed_tasks: Vec<u32>,
}

impl CrawlSummary {
    pub fn lines(&self) -> Vec<String> {
        self.tasks
            .iter()
            .map(|(t, s)| {
                format!(
                    "Task {t}: pages visited {}, cards saved {} (real {} / synthetic {})",
                    s.pages, s.saved, s.real, s.synthetic
                )
            })
            .collect()
    }
}

/// `url` with its `page` query parameter set to `page`.
pub fn with_page_param(url: &str, page: u32) -> Result<String> {
    let mut u = url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    let kept: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    u.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("page", &page.to_string());
    Ok(u.into())
}

fn save_debug_html(dir: &Path, name: &str, html: &str) {
    let path = dir.join(name);
    let res = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, html));
    match res {
        Ok(()) => debug!(path = %path.display(), "saved debug html"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not save debug html"),
    }
}

pub struct Crawler<'a> {
    driver: &'a dyn BrowserDriver,
    layout: &'a CorpusLayout,
    sanitizer: &'a dyn Sanitizer,
    assets: Option<&'a AssetStore>,
    throttle: &'a Throttle,
    opts: &'a CrawlOptions,
}

impl<'a> Crawler<'a> {
    pub fn new(
        driver: &'a dyn BrowserDriver,
        layout: &'a CorpusLayout,
        sanitizer: &'a dyn Sanitizer,
        throttle: &'a Throttle,
        opts: &'a CrawlOptions,
    ) -> Self {
        Self {
            driver,
            layout,
            sanitizer,
            assets: None,
            throttle,
            opts,
        }
    }

    pub fn with_assets(mut self, assets: &'a AssetStore) -> Self {
        self.assets = Some(assets);
        self
    }

    pub async fn run(&self) -> Result<CrawlSummary> {
        if self.opts.is_dry_run() {
            info!("limit is 0; dry run");
            return Ok(CrawlSummary {
                dry_run: true,
                ..CrawlSummary::default()
            });
        }

        let o = self.opts;
        let main = FrameRef::Main;
        with_retry(o.retry, "open bank", || {
            self.driver.navigate(&main, &o.base_url, o.nav_timeout)
        })
        .await?;
        let frame_sel = format!("iframe#{QUESTIONS_FRAME}");
        if let Err(e) = self
            .driver
            .wait_for_selector(&main, &frame_sel, o.wait_timeout)
            .await
        {
            warn!(error = %e, "questions frame did not show up; using the main document");
        }
        let frame = self.detect_frame().await?;
        info!(frame = ?frame, "crawl frame");

        let mut summary = CrawlSummary::default();
        for task_no in o.tasks() {
            match self.crawl_task(&frame, task_no).await {
                Ok(s) => {
                    summary.tasks.insert(task_no, s);
                }
                Err(e) => {
                    warn!(task_no, error = %e, "task abandoned");
                    summary.failed_tasks.push(task_no);
                }
            }
        }
        Ok(summary)
    }

    async fn detect_frame(&self) -> Result<FrameRef> {
        let frames = with_retry(self.opts.retry, "list frames", || self.driver.frames()).await?;
        let found = frames
            .into_iter()
            .find(|f| f.name.contains(QUESTIONS_FRAME) || f.url.contains(QUESTIONS_PAGE));
        Ok(match found {
            Some(f) if !f.name.is_empty() => FrameRef::Named(f.name),
            Some(_) => FrameRef::Named(QUESTIONS_PAGE.to_string()),
            None => FrameRef::Main,
        })
    }

    async fn apply_filter(&self, frame: &FrameRef, task_no: u32) -> Result<()> {
        let o = self.opts;
        let open = Locator::Text(FILTER_OPEN.to_string());
        if !self.driver.click(frame, &open, o.click_timeout).await.unwrap_or(false) {
            debug!(task_no, "no filter panel toggle");
        }

        let label = Locator::Text(TASK_NUMBER_LABEL.to_string());
        let value = task_no.to_string();
        let filled = with_retry(o.retry, "set task number", || {
            self.driver.fill_near_label(frame, &label, &value, o.click_timeout)
        })
        .await?;
        if !filled {
            warn!(task_no, "task number field not found; listing may be unfiltered");
        }

        let apply = Locator::Text(FILTER_APPLY.to_string());
        with_retry(o.retry, "apply filter", || {
            self.driver.click(frame, &apply, o.click_timeout)
        })
        .await?;
        if let Err(e) = self.driver.wait_for_load(frame, o.load_timeout).await {
            debug!(task_no, error = %e, "load wait after filter");
        }
        if !o.settle.is_zero() {
            tokio::time::sleep(o.settle).await;
        }
        Ok(())
    }

    async fn crawl_task(&self, frame: &FrameRef, task_no: u32) -> Result<TaskSummary> {
        let o = self.opts;
        let mut summary = TaskSummary::default();
        self.apply_filter(frame, task_no).await?;

        let end_page = *o.pages().end();
        // Card checksums of the previous page; a repeat means pagination did not advance.
        let mut previous: Option<Vec<String>> = None;
        for page in o.pages() {
            if summary.saved >= o.limit {
                break;
            }
            let html = with_retry(o.retry, "page content", || self.driver.content(frame)).await?;
            let page_url = self.driver.url(frame).await.unwrap_or_default();
            if let (Some(dir), true) = (&o.debug_html, page == 1) {
                save_debug_html(dir, &format!("task{task_no}-page1.html"), &html);
            }

            let set = extract::extract_cards(&html, &page_url, self.sanitizer);
            if set.fallback && page > 1 {
                debug!(task_no, page, "no cards; end of listing");
                break;
            }
            let fingerprint: Vec<String> = set.cards.iter().map(Card::checksum).collect();
            if previous.as_ref() == Some(&fingerprint) {
                debug!(task_no, page, "same cards as the previous page; end of listing");
                break;
            }

            let mut saved_here = 0;
            for (i, card) in set.cards.iter().enumerate() {
                if summary.saved >= o.limit {
                    break;
                }
                if card.identity.is_synthetic() && i < 2 {
                    if let Some(dir) = &o.debug_html {
                        let name = format!("task{task_no}-p{page}-synthetic-{i}.html");
                        save_debug_html(dir, &name, &card.outer_html);
                    }
                }
                match self.save_card(card, task_no, page, &page_url).await {
                    Ok(true) => {
                        saved_here += 1;
                        summary.saved += 1;
                        if card.identity.is_synthetic() {
                            summary.synthetic += 1;
                        } else {
                            summary.real += 1;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(task_no, page, error = %e, "could not save card"),
                }
            }

            summary.pages += 1;
            previous = Some(fingerprint);
            info!(
                task_no,
                page,
                saved = saved_here,
                real = summary.real,
                synthetic = summary.synthetic,
                "page done"
            );
            if summary.saved >= o.limit || page >= end_page {
                break;
            }
            if !self.paginate(frame, page).await {
                debug!(task_no, page, "no way to the next page");
                break;
            }
        }
        Ok(summary)
    }

    /// `Ok(false)` when the raw file already exists.
    async fn save_card(&self, card: &Card, task_no: u32, page: u32, page_url: &str) -> Result<bool> {
        let o = self.opts;
        let path = self
            .layout
            .raw_file(o.exam, o.level, task_no, page, card.identity.id());
        if path.exists() {
            return Ok(false);
        }
        let assets = match self.assets {
            Some(store) => store.localize(&card.asset_urls, self.throttle).await,
            None => Vec::new(),
        };
        let accessed_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let raw = card.to_raw(o.exam, o.level, task_no, assets, page_url, &accessed_at);
        store::write_json_pretty(&path, &raw)?;
        Ok(true)
    }

    /// Move to `page + 1`: numbered link first, then the `page` query parameter.
    async fn paginate(&self, frame: &FrameRef, page: u32) -> bool {
        let o = self.opts;
        let next = page + 1;
        self.throttle.wait().await;

        let link = Locator::Text(format!("^{next}$"));
        match self.driver.click(frame, &link, o.click_timeout).await {
            Ok(true) => {
                if let Err(e) = self.driver.wait_for_load(frame, o.load_timeout).await {
                    debug!(page = next, error = %e, "load wait after page click");
                }
                return true;
            }
            Ok(false) => {}
            Err(e) => debug!(page = next, error = %e, "page link click failed"),
        }

        let current = match self.driver.url(frame).await {
            Ok(u) => u,
            Err(e) => {
                debug!(error = %e, "no frame url for pagination");
                return false;
            }
        };
        let target = match with_page_param(&current, next) {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "frame url not usable for pagination");
                return false;
            }
        };
        match with_retry(o.retry, "next page", || {
            self.driver.navigate(frame, &target, o.nav_timeout)
        })
        .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(page = next, error = %e, "pagination failed");
                false
            }
        }
    }
}
