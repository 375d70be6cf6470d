use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use kira_repeatsdb::domain::{AnnotationRecord, RegionClass, SourceKind};
use kira_repeatsdb::error::KiraError;
use kira_repeatsdb::harvest::{HarvestItem, Harvester};
use kira_repeatsdb::page::{Page, PageSource, SessionProvider, SnapshotProvider};
use kira_repeatsdb::retry::RetryPolicy;

#[derive(Clone)]
enum Script {
    Rows(Vec<AnnotationRecord>),
    Flaky {
        failures: usize,
        rows: Vec<AnnotationRecord>,
    },
    Broken,
}

struct MockProvider {
    pages: Vec<Script>,
    report_total: bool,
    calls: Arc<Mutex<Vec<usize>>>,
    released: Arc<Mutex<usize>>,
}

impl MockProvider {
    fn new(pages: Vec<Script>, report_total: bool) -> Self {
        Self {
            pages,
            report_total,
            calls: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(Mutex::new(0)),
        }
    }

    fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    fn released(&self) -> usize {
        *self.released.lock().unwrap()
    }
}

struct MockSession {
    pages: Vec<Script>,
    report_total: bool,
    attempts: HashMap<usize, usize>,
    calls: Arc<Mutex<Vec<usize>>>,
    released: Arc<Mutex<usize>>,
}

impl SessionProvider for MockProvider {
    type Session = MockSession;

    fn open(&self, _region: &RegionClass) -> Result<Self::Session, KiraError> {
        Ok(MockSession {
            pages: self.pages.clone(),
            report_total: self.report_total,
            attempts: HashMap::new(),
            calls: Arc::clone(&self.calls),
            released: Arc::clone(&self.released),
        })
    }
}

impl PageSource for MockSession {
    fn fetch_page(&mut self, region: &RegionClass, page_index: usize) -> Result<Page, KiraError> {
        self.calls.lock().unwrap().push(page_index);
        let attempt = {
            let counter = self.attempts.entry(page_index).or_insert(0);
            *counter += 1;
            *counter
        };
        let failed = || KiraError::PageError {
            region: region.to_string(),
            page: page_index,
            message: "listing did not render".to_string(),
        };
        let rows = match self.pages.get(page_index) {
            Some(Script::Rows(rows)) => rows.clone(),
            Some(Script::Flaky { failures, rows }) if attempt > *failures => rows.clone(),
            _ => return Err(failed()),
        };
        Ok(Page {
            records: rows,
            total_pages: self.report_total.then_some(self.pages.len()),
            has_next: page_index + 1 < self.pages.len(),
        })
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        *self.released.lock().unwrap() += 1;
    }
}

fn record(structure_id: &str) -> AnnotationRecord {
    AnnotationRecord {
        index: "1".to_string(),
        structure_id: structure_id.to_string(),
        chain_id: "A".to_string(),
        source_kind: Some(SourceKind::Structure),
        source_label: "RCSB".to_string(),
        region_values: Vec::new(),
        region_units: Vec::new(),
        uniprot: None,
        pfam: Vec::new(),
        status: String::new(),
    }
}

fn rows(ids: &[&str]) -> Script {
    Script::Rows(ids.iter().map(|id| record(id)).collect())
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::ZERO)
}

fn region() -> RegionClass {
    "3.1".parse().unwrap()
}

fn ids(items: &[HarvestItem]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            HarvestItem::Record(record) => Some(record.structure_id.clone()),
            HarvestItem::PageFailed { .. } => None,
        })
        .collect()
}

#[test]
fn records_arrive_in_page_order() {
    let provider = MockProvider::new(
        vec![rows(&["1AAA", "1AAB"]), rows(&["1AAC", "1AAA"]), rows(&["1AAD"])],
        true,
    );
    let harvester = Harvester::new(&provider, fast_retry());
    let mut harvest = harvester.harvest(&region()).unwrap();
    let items: Vec<HarvestItem> = harvest.by_ref().collect();

    // Duplicates across pages are passed through untouched.
    assert_eq!(ids(&items), vec!["1AAA", "1AAB", "1AAC", "1AAA", "1AAD"]);
    assert_eq!(harvest.pages_read(), 3);
    assert_eq!(harvest.pages_failed(), 0);
    assert_eq!(provider.released(), 1);
    drop(harvest);
    assert_eq!(provider.released(), 1);
}

#[test]
fn flaky_page_is_retried() {
    let provider = MockProvider::new(
        vec![
            rows(&["1AAA"]),
            Script::Flaky {
                failures: 2,
                rows: vec![record("1AAB")],
            },
        ],
        false,
    );
    let harvester = Harvester::new(&provider, fast_retry());
    let items: Vec<HarvestItem> = harvester.harvest(&region()).unwrap().collect();

    assert_eq!(ids(&items), vec!["1AAA", "1AAB"]);
    assert_eq!(provider.calls(), vec![0, 1, 1, 1]);
}

#[test]
fn failed_page_is_reported_and_later_pages_read() {
    let provider = MockProvider::new(
        vec![rows(&["1AAA"]), Script::Broken, rows(&["1AAC"])],
        true,
    );
    let harvester = Harvester::new(&provider, fast_retry());
    let items: Vec<HarvestItem> = harvester.harvest(&region()).unwrap().collect();

    assert_eq!(items.len(), 3);
    assert_matches!(
        &items[1],
        HarvestItem::PageFailed { page: 1, attempts: 3, .. }
    );
    assert_eq!(ids(&items), vec!["1AAA", "1AAC"]);
}

#[test]
fn failed_page_ends_listing_without_page_count() {
    let provider = MockProvider::new(
        vec![rows(&["1AAA"]), Script::Broken, rows(&["1AAC"])],
        false,
    );
    let harvester = Harvester::new(&provider, fast_retry());
    let items: Vec<HarvestItem> = harvester.harvest(&region()).unwrap().collect();

    assert_eq!(ids(&items), vec!["1AAA"]);
    assert!(!provider.calls().contains(&2));
    assert_eq!(provider.released(), 1);
}

#[test]
fn unreadable_first_page_is_unreachable() {
    let provider = MockProvider::new(vec![Script::Broken, rows(&["1AAB"])], true);
    let harvester = Harvester::new(&provider, fast_retry());

    assert_matches!(
        harvester.harvest(&region()),
        Err(KiraError::HarvestUnreachable { region: name, .. }) if name == "3.1"
    );
    assert_eq!(provider.calls(), vec![0, 0, 0]);
    assert_eq!(provider.released(), 1);
}

#[test]
fn max_pages_caps_pagination() {
    let provider = MockProvider::new(
        vec![rows(&["1AAA"]), rows(&["1AAB"]), rows(&["1AAC"])],
        true,
    );
    let harvester = Harvester::new(&provider, fast_retry()).with_max_pages(Some(2));
    let items: Vec<HarvestItem> = harvester.harvest(&region()).unwrap().collect();

    assert_eq!(ids(&items), vec!["1AAA", "1AAB"]);
    assert_eq!(provider.calls(), vec![0, 1]);
}

#[test]
fn resume_starts_at_later_page() {
    let provider = MockProvider::new(
        vec![rows(&["1AAA"]), rows(&["1AAB"]), rows(&["1AAC"])],
        true,
    );
    let harvester = Harvester::new(&provider, fast_retry());
    let items: Vec<HarvestItem> = harvester.resume_from(&region(), 1).unwrap().collect();

    assert_eq!(ids(&items), vec!["1AAB", "1AAC"]);
}

#[test]
fn early_drop_releases_session() {
    let provider = MockProvider::new(vec![rows(&["1AAA", "1AAB"]), rows(&["1AAC"])], true);
    let harvester = Harvester::new(&provider, fast_retry());
    let mut harvest = harvester.harvest(&region()).unwrap();
    assert_matches!(harvest.next(), Some(HarvestItem::Record(_)));
    assert_eq!(provider.released(), 0);
    drop(harvest);
    assert_eq!(provider.released(), 1);
    assert_eq!(provider.calls(), vec![0]);
}

fn listing(rows: &[(&str, &str, &str, &str)]) -> String {
    let body = rows
        .iter()
        .enumerate()
        .map(|(index, (pdb, chain, source, refs))| {
            format!(
                "<tr><td>{index}</td><td><img src=\"/img/preview/{pdb}.png\"></td>\
                 <td>{pdb}</td><td>{chain}</td><td>{source}</td>\
                 <td><span class=\"badge text-bg-region\">3.1.1 6 units</span></td>\
                 <td>{refs}</td><td>Reviewed</td></tr>"
            )
        })
        .collect::<String>();
    format!(
        "<html><body><table><thead><tr><th>#</th><th>Preview</th></tr></thead>\
         <tbody>{body}</tbody></table></body></html>"
    )
}

#[test]
fn snapshot_pages_are_harvested() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let dir = root.join("3_1");
    fs::create_dir_all(dir.as_std_path()).unwrap();
    fs::write(
        dir.join("page_0.html").as_std_path(),
        listing(&[
            ("1A17", "A", "RCSB", "<span class=\"badge\">P53041 UniProt</span>"),
            ("AF-Q9XYZ1-F1", "A", "AlphaFoldDB", ""),
        ]),
    )
    .unwrap();
    fs::write(
        dir.join("page_1.html").as_std_path(),
        listing(&[("2XQH", "B", "RCSB", "<span class=\"badge\">PF00400 Pfam</span>")]),
    )
    .unwrap();

    let harvester = Harvester::new(SnapshotProvider::new(root), fast_retry());
    let mut harvest = harvester.harvest(&region()).unwrap();
    let records: Vec<AnnotationRecord> = harvest
        .by_ref()
        .filter_map(|item| match item {
            HarvestItem::Record(record) => Some(record),
            HarvestItem::PageFailed { .. } => None,
        })
        .collect();

    assert_eq!(harvest.pages_read(), 2);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].structure_id, "1A17");
    assert_eq!(records[0].uniprot.as_deref(), Some("P53041"));
    assert_eq!(records[0].region_values, vec!["3.1.1".to_string()]);
    assert_eq!(records[0].region_units, vec!["6 units".to_string()]);
    assert_eq!(records[1].source_kind, Some(SourceKind::Model));
    assert_eq!(records[2].chain_id, "B");
    assert_eq!(records[2].pfam, vec!["PF00400".to_string()]);
}

#[test]
fn missing_snapshot_directory_is_unreachable() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let harvester = Harvester::new(SnapshotProvider::new(root), fast_retry());

    assert_matches!(
        harvester.harvest(&region()),
        Err(KiraError::HarvestUnreachable { .. })
    );
}
