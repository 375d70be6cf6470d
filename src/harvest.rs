use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::domain::{AnnotationRecord, RegionClass};
use crate::error::KiraError;
use crate::page::{Page, PageSource, SessionProvider};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub enum HarvestItem {
    Record(AnnotationRecord),
    PageFailed {
        page: usize,
        attempts: usize,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Harvester<P> {
    provider: P,
    retry: RetryPolicy,
    max_pages: Option<usize>,
}

impl<P: SessionProvider> Harvester<P> {
    pub fn new(provider: P, retry: RetryPolicy) -> Self {
        Self {
            provider,
            retry,
            max_pages: None,
        }
    }

    pub fn with_max_pages(mut self, max_pages: Option<usize>) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn harvest(&self, region: &RegionClass) -> Result<Harvest<P::Session>, KiraError> {
        self.resume_from(region, 0)
    }

    /// Opens a session and fetches `start_page` eagerly; a listing whose
    /// first page cannot be read is unreachable.
    pub fn resume_from(
        &self,
        region: &RegionClass,
        start_page: usize,
    ) -> Result<Harvest<P::Session>, KiraError> {
        let session = self.provider.open(region)?;
        let mut harvest = Harvest {
            session: Some(session),
            region: region.clone(),
            retry: self.retry,
            next_page: start_page,
            last_page: self.max_pages.map(|max| start_page + max),
            known_total: None,
            buffer: VecDeque::new(),
            done: false,
            pages_read: 0,
            pages_failed: 0,
        };
        match harvest.fetch_with_retry(start_page) {
            Ok(page) => {
                harvest.accept(start_page, page);
                Ok(harvest)
            }
            Err((attempts, err)) => {
                warn!(region = %region, attempts, error = %err, "listing unreachable");
                Err(KiraError::HarvestUnreachable {
                    region: region.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }
}

/// Lazy, single-threaded walk over the listing pages of one region. Owns the
/// page session; dropping the iterator releases it.
pub struct Harvest<S: PageSource> {
    session: Option<S>,
    region: RegionClass,
    retry: RetryPolicy,
    next_page: usize,
    last_page: Option<usize>,
    known_total: Option<usize>,
    buffer: VecDeque<HarvestItem>,
    done: bool,
    pages_read: usize,
    pages_failed: usize,
}

impl<S: PageSource> std::fmt::Debug for Harvest<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Harvest")
            .field("session_open", &self.session.is_some())
            .field("region", &self.region)
            .field("retry", &self.retry)
            .field("next_page", &self.next_page)
            .field("last_page", &self.last_page)
            .field("known_total", &self.known_total)
            .field("buffer", &self.buffer)
            .field("done", &self.done)
            .field("pages_read", &self.pages_read)
            .field("pages_failed", &self.pages_failed)
            .finish()
    }
}

impl<S: PageSource> Harvest<S> {
    pub fn region(&self) -> &RegionClass {
        &self.region
    }

    pub fn pages_read(&self) -> usize {
        self.pages_read
    }

    pub fn pages_failed(&self) -> usize {
        self.pages_failed
    }

    /// Index of the next page that has not been requested yet.
    pub fn next_page(&self) -> usize {
        self.next_page
    }

    fn fetch_with_retry(&mut self, page_index: usize) -> Result<Page, (usize, KiraError)> {
        let Some(session) = self.session.as_mut() else {
            return Err((
                0,
                KiraError::PageError {
                    region: self.region.to_string(),
                    page: page_index,
                    message: "session already released".to_string(),
                },
            ));
        };
        let region = &self.region;
        self.retry
            .run(|attempt| {
                debug!(region = %region, page = page_index, attempt, "fetching listing page");
                session.fetch_page(region, page_index)
            })
            .map_err(|exhausted| (exhausted.attempts, exhausted.last_error))
    }

    fn accept(&mut self, page_index: usize, page: Page) {
        self.pages_read += 1;
        if page.total_pages.is_some() {
            self.known_total = page.total_pages;
        }
        info!(
            region = %self.region,
            page = page_index,
            records = page.records.len(),
            "listing page read"
        );
        let more = page.has_next && !page.records.is_empty();
        self.buffer
            .extend(page.records.into_iter().map(HarvestItem::Record));
        self.next_page = page_index + 1;
        if !more {
            self.finish();
        }
    }

    fn within_bounds(&self, page_index: usize) -> bool {
        let below_cap = self.last_page.map(|last| page_index < last).unwrap_or(true);
        let below_total = self
            .known_total
            .map(|total| page_index < total)
            .unwrap_or(true);
        below_cap && below_total
    }

    fn finish(&mut self) {
        self.done = true;
        self.session = None;
    }

    fn advance(&mut self) {
        let page_index = self.next_page;
        if !self.within_bounds(page_index) {
            self.finish();
            return;
        }
        match self.fetch_with_retry(page_index) {
            Ok(page) => self.accept(page_index, page),
            Err((attempts, err)) => {
                self.pages_failed += 1;
                warn!(
                    region = %self.region,
                    page = page_index,
                    attempts,
                    error = %err,
                    "listing page failed"
                );
                self.buffer.push_back(HarvestItem::PageFailed {
                    page: page_index,
                    attempts,
                    reason: err.to_string(),
                });
                self.next_page = page_index + 1;
                // Without a page count there is no way to tell whether more
                // pages exist past a failed one.
                if self.known_total.is_none() {
                    self.finish();
                }
            }
        }
    }
}

impl<S: PageSource> Iterator for Harvest<S> {
    type Item = HarvestItem;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.done {
                return None;
            }
            self.advance();
        }
    }
}
