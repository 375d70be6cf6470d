use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{AnnotationRecord, RegionClass};
use crate::error::KiraError;
use crate::html;

/// One page of the RepeatsDB annotation listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<AnnotationRecord>,
    pub total_pages: Option<usize>,
    pub has_next: bool,
}

/// A live listing session (for instance a browser tab). Not shareable across
/// threads; released when dropped.
pub trait PageSource {
    fn fetch_page(&mut self, region: &RegionClass, page_index: usize) -> Result<Page, KiraError>;
}

pub trait SessionProvider {
    type Session: PageSource;

    fn open(&self, region: &RegionClass) -> Result<Self::Session, KiraError>;
}

impl<T: SessionProvider + ?Sized> SessionProvider for &T {
    type Session = T::Session;

    fn open(&self, region: &RegionClass) -> Result<Self::Session, KiraError> {
        (**self).open(region)
    }
}

/// Reads listing pages rendered by an external browser driver and saved as
/// `{root}/{region_stem}/page_{n}.html`.
#[derive(Debug, Clone)]
pub struct SnapshotProvider {
    root: Utf8PathBuf,
}

impl SnapshotProvider {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl SessionProvider for SnapshotProvider {
    type Session = SnapshotPageSource;

    fn open(&self, region: &RegionClass) -> Result<Self::Session, KiraError> {
        let dir = self.root.join(region.file_stem());
        if !dir.as_std_path().is_dir() {
            return Err(KiraError::HarvestUnreachable {
                region: region.to_string(),
                message: format!("no page snapshots under {dir}"),
            });
        }
        Ok(SnapshotPageSource { dir })
    }
}

#[derive(Debug)]
pub struct SnapshotPageSource {
    dir: Utf8PathBuf,
}

impl SnapshotPageSource {
    pub fn page_path(&self, page_index: usize) -> Utf8PathBuf {
        self.dir.join(format!("page_{page_index}.html"))
    }

    /// One past the highest `page_{n}.html` index on disk.
    fn page_count(&self) -> Option<usize> {
        let entries = fs::read_dir(self.dir.as_std_path()).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix("page_")?
                    .strip_suffix(".html")?
                    .parse::<usize>()
                    .ok()
            })
            .max()
            .map(|last| last + 1)
    }
}

impl PageSource for SnapshotPageSource {
    fn fetch_page(&mut self, region: &RegionClass, page_index: usize) -> Result<Page, KiraError> {
        let path = self.page_path(page_index);
        let content =
            fs::read_to_string(path.as_std_path()).map_err(|err| KiraError::PageError {
                region: region.to_string(),
                page: page_index,
                message: format!("{path}: {err}"),
            })?;
        let records = html::parse_table(&content);
        Ok(Page {
            records,
            total_pages: self.page_count(),
            has_next: self.page_path(page_index + 1).as_std_path().exists(),
        })
    }
}
