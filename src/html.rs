//! Normalizes a rendered RepeatsDB annotation table into records.
//!
//! Expected cell layout per row: index, preview image, PDB id, chain, source,
//! region badges, external reference badges, status. Rows without a preview
//! image are layout rows (expanded details, spacers) and are ignored.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::domain::{AnnotationRecord, SourceKind};

static ROW_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tbody tr").expect("static selector"));
static ANY_ROW_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("static selector"));
static PREVIEW_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td img[src*='preview']").expect("static selector"));
static REGION_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".text-bg-region").expect("static selector"));
static BADGE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".badge").expect("static selector"));

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)*").expect("static regex"));
static UNITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b\d+\s*units\b").expect("static regex"));

const MIN_CELLS: usize = 8;

pub fn parse_table(html: &str) -> Vec<AnnotationRecord> {
    let document = Html::parse_document(html);
    let mut rows = document.select(&ROW_SELECTOR).peekable();
    let rows: Vec<ElementRef<'_>> = if rows.peek().is_some() {
        rows.collect()
    } else {
        document.select(&ANY_ROW_SELECTOR).collect()
    };

    rows.into_iter()
        .filter(|row| row.select(&PREVIEW_SELECTOR).next().is_some())
        .filter_map(parse_row)
        .collect()
}

fn parse_row(row: ElementRef<'_>) -> Option<AnnotationRecord> {
    let cells = row
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|cell| cell.value().name() == "td")
        .collect::<Vec<_>>();
    if cells.len() < MIN_CELLS {
        return None;
    }

    let structure_id = compact_text(cells[2]);
    let chain_id = compact_text(cells[3]);
    if structure_id.is_empty() || chain_id.is_empty() {
        return None;
    }
    let source_label = spaced_text(cells[4]);

    let mut region_values = Vec::new();
    let mut region_units = Vec::new();
    for span in cells[5].select(&REGION_SELECTOR) {
        let text = spaced_text(span);
        let (values, units) = split_region_text(&text);
        region_values.extend(values);
        region_units.extend(units);
    }

    let mut uniprot = None;
    let mut pfam = Vec::new();
    for badge in cells[6].select(&BADGE_SELECTOR) {
        let text = spaced_text(badge);
        let Some(first) = text.split_whitespace().next() else {
            continue;
        };
        if text.contains("UniProt") {
            uniprot = Some(first.to_string());
        } else if text.contains("Pfam") {
            pfam.push(first.to_string());
        }
    }

    Some(AnnotationRecord {
        index: compact_text(cells[0]),
        source_kind: SourceKind::from_label(&source_label),
        structure_id,
        chain_id,
        source_label,
        region_values,
        region_units,
        uniprot,
        pfam,
        status: spaced_text(cells[7]),
    })
}

/// Splits a region badge such as `3.3.1 6 units` into region values and unit
/// counts. Numbers followed by `units` are counts, not classes.
pub fn split_region_text(text: &str) -> (Vec<String>, Vec<String>) {
    let values = NUMBER_RE
        .find_iter(text)
        .filter(|m| {
            !text[m.end()..]
                .trim_start()
                .to_lowercase()
                .starts_with("units")
        })
        .map(|m| m.as_str().to_string())
        .collect();
    let units = UNITS_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect();
    (values, units)
}

/// Cell text with every whitespace character removed, for identifiers.
fn compact_text(element: ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect()
}

/// Cell text on one line, with whitespace runs collapsed to single spaces.
fn spaced_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
