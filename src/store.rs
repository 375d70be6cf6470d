use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{
    AlignmentPayload, AnnotationRecord, FailureReason, IdentityKey, RegionClass, SequenceRecord,
    SourceKind,
};
use crate::error::KiraError;

pub const REGION_PLACEHOLDER: &str = "{region}";
const FASTA_LINE_WIDTH: usize = 80;
const LIST_SEPARATOR: &str = ";";

/// Path templates per artifact kind; `{region}` expands to the region's file
/// stem (`3_1`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTemplates {
    pub annotations: String,
    pub alignments: String,
    pub sequences: String,
}

impl Default for PathTemplates {
    fn default() -> Self {
        Self {
            annotations: "result-annotations/repeatsDB_annotations_{region}.csv".to_string(),
            alignments: "result-alignments/repeatsDB_alignments_{region}".to_string(),
            sequences: "sequences/repeatsDB_seqs_{region}.fasta".to_string(),
        }
    }
}

impl PathTemplates {
    pub fn with_dirs(annotations_dir: &str, alignments_dir: &str, sequences_dir: &str) -> Self {
        let join = |dir: &str, name: &str| Utf8Path::new(dir).join(name).to_string();
        Self {
            annotations: join(annotations_dir, "repeatsDB_annotations_{region}.csv"),
            alignments: join(alignments_dir, "repeatsDB_alignments_{region}"),
            sequences: join(sequences_dir, "repeatsDB_seqs_{region}.fasta"),
        }
    }

    pub fn validate(&self) -> Result<(), KiraError> {
        for (kind, template) in [
            ("annotations", &self.annotations),
            ("alignments", &self.alignments),
            ("sequences", &self.sequences),
        ] {
            if !template.contains(REGION_PLACEHOLDER) {
                return Err(KiraError::InvalidConfig(format!(
                    "{kind} path template must contain {REGION_PLACEHOLDER}: {template}"
                )));
            }
        }
        Ok(())
    }

    pub fn resolve(&self, region: &RegionClass) -> RegionArtifacts {
        let stem = region.file_stem();
        let expand = |template: &str| Utf8PathBuf::from(template.replace(REGION_PLACEHOLDER, &stem));
        let annotations = expand(&self.annotations);
        let alignments_dir = expand(&self.alignments);
        let sequences = expand(&self.sequences);
        RegionArtifacts {
            harvest_log: annotations.with_extension("log"),
            alignment_log: alignments_dir.join("alignment_errors.log"),
            sequence_log: Utf8PathBuf::from(format!("{sequences}.err")),
            annotations,
            alignments_dir,
            sequences,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionArtifacts {
    pub annotations: Utf8PathBuf,
    pub harvest_log: Utf8PathBuf,
    pub alignments_dir: Utf8PathBuf,
    pub alignment_log: Utf8PathBuf,
    pub sequences: Utf8PathBuf,
    pub sequence_log: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    Appended,
    AlreadyPresent,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnnotationRow {
    index: String,
    pdb_id: String,
    chain: String,
    source: String,
    region_values: String,
    region_units: String,
    uniprot: String,
    pfam: String,
    status: String,
}

impl From<&AnnotationRecord> for AnnotationRow {
    fn from(record: &AnnotationRecord) -> Self {
        let list = |values: &[String]| {
            values
                .iter()
                .map(|value| single_line(value))
                .collect::<Vec<_>>()
                .join(LIST_SEPARATOR)
        };
        Self {
            index: single_line(&record.index),
            pdb_id: single_line(&record.structure_id),
            chain: single_line(&record.chain_id),
            source: single_line(&record.source_label),
            region_values: list(&record.region_values),
            region_units: list(&record.region_units),
            uniprot: record.uniprot.as_deref().map(single_line).unwrap_or_default(),
            pfam: list(&record.pfam),
            status: single_line(&record.status),
        }
    }
}

impl From<AnnotationRow> for AnnotationRecord {
    fn from(row: AnnotationRow) -> Self {
        let split = |value: &str| {
            value
                .split(LIST_SEPARATOR)
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        let uniprot = row.uniprot.trim();
        Self {
            index: row.index.trim().to_string(),
            structure_id: row.pdb_id.trim().to_string(),
            chain_id: row.chain.trim().to_string(),
            source_kind: SourceKind::from_label(&row.source),
            region_values: split(&row.region_values),
            region_units: split(&row.region_units),
            uniprot: (!uniprot.is_empty()).then(|| uniprot.to_string()),
            pfam: split(&row.pfam),
            status: row.status.trim().to_string(),
            source_label: row.source.trim().to_string(),
        }
    }
}

/// Tabular annotation artifact. One row per identity key, flushed per row.
pub struct AnnotationTable {
    path: Utf8PathBuf,
    file: File,
    keys: HashSet<IdentityKey>,
}

impl AnnotationTable {
    pub fn open(path: &Utf8Path) -> Result<Self, KiraError> {
        ensure_parent(path)?;
        let existing_len = truncate_partial_line(path)?;
        let mut keys = HashSet::new();
        if existing_len > 0 {
            for record in read_rows(path)? {
                keys.insert(record.key());
            }
        }
        let mut file = open_append(path)?;
        if existing_len == 0 {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer
                .write_record([
                    "index",
                    "pdb_id",
                    "chain",
                    "source",
                    "region_values",
                    "region_units",
                    "uniprot",
                    "pfam",
                    "status",
                ])
                .map_err(|err| KiraError::write(path, err))?;
            let header = writer
                .into_inner()
                .map_err(|err| KiraError::write(path, err))?;
            write_flushed(&mut file, path, &header)?;
        }
        debug!(path = %path, existing = keys.len(), "annotation table opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            keys,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn append(&mut self, record: &AnnotationRecord) -> Result<AppendResult, KiraError> {
        let key = record.key();
        if self.keys.contains(&key) {
            return Ok(AppendResult::AlreadyPresent);
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer
            .serialize(AnnotationRow::from(record))
            .map_err(|err| KiraError::write(&self.path, err))?;
        let row = writer
            .into_inner()
            .map_err(|err| KiraError::write(&self.path, err))?;
        write_flushed(&mut self.file, &self.path, &row)?;
        self.keys.insert(key);
        Ok(AppendResult::Appended)
    }
}

/// Loads an annotation table in file order. Unparseable rows are skipped.
pub fn read_records(path: &Utf8Path) -> Result<Vec<AnnotationRecord>, KiraError> {
    if !path.as_std_path().is_file() {
        return Err(KiraError::AnnotationsNotFound(path.to_string()));
    }
    read_rows(path)
}

fn read_rows(path: &Utf8Path) -> Result<Vec<AnnotationRecord>, KiraError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("{path}: {err}")))?;
    let mut records = Vec::new();
    for (line, row) in reader.deserialize::<AnnotationRow>().enumerate() {
        match row {
            Ok(row) => {
                let record = AnnotationRecord::from(row);
                if record.structure_id.is_empty() || record.chain_id.is_empty() {
                    warn!(path = %path, line = line + 2, "annotation row without pdb_id/chain");
                    continue;
                }
                records.push(record);
            }
            Err(err) => warn!(path = %path, line = line + 2, error = %err, "skipping annotation row"),
        }
    }
    Ok(records)
}

/// Multi-entry FASTA artifact keyed by `>{structure_id}_{chain_id}` headers.
pub struct FastaWriter {
    path: Utf8PathBuf,
    file: File,
    keys: HashSet<IdentityKey>,
}

impl FastaWriter {
    pub fn open(path: &Utf8Path) -> Result<Self, KiraError> {
        ensure_parent(path)?;
        truncate_partial_line(path)?;
        let keys = repair_fasta_tail(path)?;
        let file = open_append(path)?;
        debug!(path = %path, existing = keys.len(), "sequence file opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            keys,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn append(&mut self, record: &SequenceRecord) -> Result<AppendResult, KiraError> {
        if self.keys.contains(&record.key) {
            return Ok(AppendResult::AlreadyPresent);
        }
        let entry = format_fasta_entry(record);
        write_flushed(&mut self.file, &self.path, entry.as_bytes())?;
        self.keys.insert(record.key.clone());
        Ok(AppendResult::Appended)
    }
}

pub fn format_fasta_entry(record: &SequenceRecord) -> String {
    let mut entry = String::with_capacity(record.sequence.len() + record.description.len() + 64);
    entry.push('>');
    entry.push_str(&record.key.to_string());
    let description = single_line(&record.description);
    if !description.is_empty() {
        entry.push(' ');
        entry.push_str(&description);
    }
    entry.push('\n');
    let bytes = record.sequence.as_bytes();
    for chunk in bytes.chunks(FASTA_LINE_WIDTH) {
        entry.push_str(&String::from_utf8_lossy(chunk));
        entry.push('\n');
    }
    entry
}

struct FastaEntrySpan {
    offset: u64,
    key: Option<IdentityKey>,
    declared_len: Option<usize>,
    actual_len: usize,
}

impl FastaEntrySpan {
    fn is_complete(&self) -> bool {
        match self.declared_len {
            Some(declared) => declared == self.actual_len,
            None => self.actual_len > 0,
        }
    }
}

/// Indexes existing headers and cuts off a trailing entry whose sequence is
/// shorter than its header's `length=`, i.e. an interrupted append.
fn repair_fasta_tail(path: &Utf8Path) -> Result<HashSet<IdentityKey>, KiraError> {
    let mut keys = HashSet::new();
    if !path.as_std_path().exists() {
        return Ok(keys);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("{path}: {err}")))?;

    let mut spans: Vec<FastaEntrySpan> = Vec::new();
    let mut offset = 0u64;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if let Some(header) = trimmed.strip_prefix('>') {
            let mut tokens = header.split_whitespace();
            let key = tokens.next().and_then(|token| token.parse::<IdentityKey>().ok());
            let declared_len = tokens
                .filter_map(|token| token.strip_prefix("length="))
                .find_map(|value| value.parse::<usize>().ok());
            spans.push(FastaEntrySpan {
                offset,
                key,
                declared_len,
                actual_len: 0,
            });
        } else if let Some(span) = spans.last_mut() {
            span.actual_len += trimmed.len();
        }
        offset += line.len() as u64;
    }

    if let Some(last) = spans.last() {
        if !last.is_complete() {
            warn!(path = %path, offset = last.offset, "dropping incomplete trailing sequence entry");
            let file = OpenOptions::new()
                .write(true)
                .open(path.as_std_path())
                .map_err(|err| KiraError::write(path, err))?;
            file.set_len(last.offset)
                .map_err(|err| KiraError::write(path, err))?;
            spans.pop();
        }
    }

    keys.extend(spans.into_iter().filter_map(|span| span.key));
    Ok(keys)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    pub timestamp: String,
    pub key: String,
    pub reason: String,
    pub detail: String,
}

/// Append-only failure log, one tab-separated line per failure.
pub struct ErrorLog {
    path: Utf8PathBuf,
    file: File,
    written: usize,
}

impl ErrorLog {
    pub fn open(path: &Utf8Path, banner: &str) -> Result<Self, KiraError> {
        ensure_parent(path)?;
        truncate_partial_line(path)?;
        let mut file = open_append(path)?;
        let line = format!("# {} {}\n", timestamp(), sanitize(banner));
        write_flushed(&mut file, path, line.as_bytes())?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Failures recorded through this handle.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn record(
        &mut self,
        key: &IdentityKey,
        reason: FailureReason,
        detail: &str,
    ) -> Result<(), KiraError> {
        self.record_raw(&key.to_string(), reason.as_str(), detail)
    }

    pub fn record_raw(&mut self, key: &str, reason: &str, detail: &str) -> Result<(), KiraError> {
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            timestamp(),
            sanitize(key),
            sanitize(reason),
            sanitize(detail)
        );
        write_flushed(&mut self.file, &self.path, line.as_bytes())?;
        self.written += 1;
        Ok(())
    }

    pub fn read_entries(path: &Utf8Path) -> Result<Vec<ErrorEntry>, KiraError> {
        if !path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("{path}: {err}")))?;
        Ok(content
            .lines()
            .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
            .filter_map(|line| {
                let mut parts = line.splitn(4, '\t');
                Some(ErrorEntry {
                    timestamp: parts.next()?.to_string(),
                    key: parts.next()?.to_string(),
                    reason: parts.next()?.to_string(),
                    detail: parts.next().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }
}

/// One alignment file per identity key.
#[derive(Debug, Clone)]
pub struct AlignmentStore {
    dir: Utf8PathBuf,
}

impl AlignmentStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.dir.as_std_path()).map_err(|err| KiraError::write(&self.dir, err))
    }

    pub fn path_for(&self, key: &IdentityKey) -> Utf8PathBuf {
        self.dir.join(format!("{key}.fasta"))
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.path_for(key).as_std_path().is_file()
    }

    /// Temp file + rename, so a present file is always a complete payload.
    pub fn write(&self, payload: &AlignmentPayload) -> Result<Utf8PathBuf, KiraError> {
        let dest = self.path_for(&payload.key);
        self.ensure_dir()?;
        let mut temp = tempfile::Builder::new()
            .prefix("kira-rdb-aln")
            .tempfile_in(self.dir.as_std_path())
            .map_err(|err| KiraError::write(&dest, err))?;
        temp.write_all(&payload.bytes)
            .map_err(|err| KiraError::write(&dest, err))?;
        temp.flush().map_err(|err| KiraError::write(&dest, err))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| KiraError::write(&dest, err))?;
        Ok(dest)
    }
}

fn ensure_parent(path: &Utf8Path) -> Result<(), KiraError> {
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            fs::create_dir_all(parent.as_std_path()).map_err(|err| KiraError::write(path, err))?;
        }
    }
    Ok(())
}

fn open_append(path: &Utf8Path) -> Result<File, KiraError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_std_path())
        .map_err(|err| KiraError::write(path, err))
}

fn write_flushed(file: &mut File, path: &Utf8Path, bytes: &[u8]) -> Result<(), KiraError> {
    file.write_all(bytes)
        .map_err(|err| KiraError::write(path, err))?;
    file.flush().map_err(|err| KiraError::write(path, err))
}

/// Cuts a file back to its last newline. Returns the resulting length.
fn truncate_partial_line(path: &Utf8Path) -> Result<u64, KiraError> {
    let mut file = match OpenOptions::new()
        .read(true)
        .write(true)
        .open(path.as_std_path())
    {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(KiraError::write(path, err)),
    };
    let len = file
        .metadata()
        .map_err(|err| KiraError::write(path, err))?
        .len();
    if len == 0 {
        return Ok(0);
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|err| KiraError::write(path, err))?;
    let mut content = Vec::with_capacity(len as usize);
    file.read_to_end(&mut content)
        .map_err(|err| KiraError::write(path, err))?;
    if content.last() == Some(&b'\n') {
        return Ok(len);
    }
    let keep = content
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map(|pos| pos as u64 + 1)
        .unwrap_or(0);
    warn!(path = %path, dropped = len - keep, "truncating partial trailing line");
    file.set_len(keep)
        .map_err(|err| KiraError::write(path, err))?;
    Ok(keep)
}

/// Collapses whitespace runs so a row never spans more than one line.
fn single_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sanitize(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
