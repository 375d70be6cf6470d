use std::fs::{self, OpenOptions};
use std::io::Write;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use kira_repeatsdb::domain::{
    AlignmentPayload, AnnotationRecord, FailureReason, IdentityKey, SequenceRecord, SourceKind,
};
use kira_repeatsdb::error::KiraError;
use kira_repeatsdb::fasta::parse_fasta;
use kira_repeatsdb::html::parse_table;
use kira_repeatsdb::store::{
    AlignmentStore, AnnotationTable, AppendResult, ErrorLog, FastaWriter, read_records,
};

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

fn record(structure_id: &str, chain_id: &str) -> AnnotationRecord {
    AnnotationRecord {
        index: "7".to_string(),
        structure_id: structure_id.to_string(),
        chain_id: chain_id.to_string(),
        source_kind: SourceKind::from_label("RCSB"),
        source_label: "RCSB".to_string(),
        region_values: vec!["3.1.1".to_string(), "3.1.2".to_string()],
        region_units: vec!["6 units".to_string()],
        uniprot: Some("P53041".to_string()),
        pfam: vec!["PF00515".to_string(), "PF13181".to_string()],
        status: "Reviewed".to_string(),
    }
}

fn sequence(structure_id: &str, residues: &str) -> SequenceRecord {
    SequenceRecord::from_annotation(&record(structure_id, "A"), residues.to_string())
}

fn append_raw(path: &Utf8Path, bytes: &str) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path.as_std_path())
        .unwrap();
    file.write_all(bytes.as_bytes()).unwrap();
}

#[test]
fn annotation_table_dedups_by_key() {
    let (_temp, root) = temp_root();
    let path = root.join("ann/repeatsDB_annotations_3_1.csv");

    let mut table = AnnotationTable::open(&path).unwrap();
    assert!(table.is_empty());
    assert_eq!(table.append(&record("1A17", "A")).unwrap(), AppendResult::Appended);
    assert_eq!(table.append(&record("1A17", "B")).unwrap(), AppendResult::Appended);
    assert_eq!(
        table.append(&record("1A17", "A")).unwrap(),
        AppendResult::AlreadyPresent
    );
    drop(table);

    let mut reopened = AnnotationTable::open(&path).unwrap();
    assert_eq!(reopened.len(), 2);
    assert!(reopened.contains(&IdentityKey::new("1A17", "B")));
    assert_eq!(
        reopened.append(&record("1A17", "B")).unwrap(),
        AppendResult::AlreadyPresent
    );

    let content = fs::read_to_string(path.as_std_path()).unwrap();
    assert!(content.starts_with("index,pdb_id,chain,source,region_values,region_units,uniprot,pfam,status\n"));
    assert_eq!(content.lines().count(), 3);
}

#[test]
fn annotation_rows_read_back() {
    let (_temp, root) = temp_root();
    let path = root.join("ann.csv");
    let original = record("2XQH", "A");
    let mut table = AnnotationTable::open(&path).unwrap();
    table.append(&original).unwrap();
    drop(table);

    let records = read_records(&path).unwrap();
    assert_eq!(records, vec![original]);
}

#[test]
fn missing_annotation_table() {
    let (_temp, root) = temp_root();
    assert_matches!(
        read_records(&root.join("absent.csv")),
        Err(KiraError::AnnotationsNotFound(_))
    );
}

#[test]
fn partial_annotation_row_is_dropped_on_open() {
    let (_temp, root) = temp_root();
    let path = root.join("ann.csv");
    let mut table = AnnotationTable::open(&path).unwrap();
    table.append(&record("1A17", "A")).unwrap();
    drop(table);
    append_raw(&path, "8,1B2C,A,RC");

    let mut table = AnnotationTable::open(&path).unwrap();
    assert_eq!(table.len(), 1);
    assert!(!table.contains(&IdentityKey::new("1B2C", "A")));
    table.append(&record("1B2C", "A")).unwrap();
    drop(table);

    let records = read_records(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].structure_id, "1B2C");
}

#[test]
fn fasta_writer_appends_once_per_key() {
    let (_temp, root) = temp_root();
    let path = root.join("seqs/repeatsDB_seqs_3_1.fasta");

    let mut writer = FastaWriter::open(&path).unwrap();
    assert_eq!(writer.append(&sequence("1A17", "MKV")).unwrap(), AppendResult::Appended);
    assert_eq!(
        writer.append(&sequence("1A17", "MKV")).unwrap(),
        AppendResult::AlreadyPresent
    );
    assert_eq!(writer.append(&sequence("2XQH", "GGS")).unwrap(), AppendResult::Appended);
    drop(writer);

    let writer = FastaWriter::open(&path).unwrap();
    assert_eq!(writer.len(), 2);
    assert!(writer.contains(&IdentityKey::new("2XQH", "A")));

    let entries = parse_fasta(&fs::read_to_string(path.as_std_path()).unwrap());
    assert_eq!(entries.len(), 2);
    assert!(entries[0].header.starts_with("1A17_A "));
    assert!(entries[0].header.ends_with("length=3"));
    assert_eq!(entries[1].sequence, "GGS");
}

#[test]
fn interrupted_fasta_entry_is_dropped() {
    let (_temp, root) = temp_root();
    let path = root.join("seqs.fasta");
    let mut writer = FastaWriter::open(&path).unwrap();
    writer.append(&sequence("1A17", "MKV")).unwrap();
    drop(writer);
    let intact = fs::read_to_string(path.as_std_path()).unwrap();

    append_raw(&path, ">2XQH_A length=10\nMKVL");
    let writer = FastaWriter::open(&path).unwrap();
    assert_eq!(writer.len(), 1);
    assert!(!writer.contains(&IdentityKey::new("2XQH", "A")));
    drop(writer);
    assert_eq!(fs::read_to_string(path.as_std_path()).unwrap(), intact);

    // A short body that did end in a newline is still incomplete.
    append_raw(&path, ">2XQH_A length=10\nMKVL\n");
    let mut writer = FastaWriter::open(&path).unwrap();
    assert_eq!(writer.len(), 1);
    assert_eq!(
        writer.append(&sequence("2XQH", "MKVLAAGGSS")).unwrap(),
        AppendResult::Appended
    );
    drop(writer);

    let entries = parse_fasta(&fs::read_to_string(path.as_std_path()).unwrap());
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].sequence, "MKVLAAGGSS");
}

fn listing_row(index: &str, structure_id: &str) -> String {
    format!(
        "<tr><td>{index}</td><td><img src=\"/preview/{structure_id}.png\"></td>\
         <td>{structure_id}</td><td>A</td><td>RCSB\n   PDB</td>\
         <td><span class=\"text-bg-region\">3.1.1 5 units</span></td>\
         <td><span class=\"badge\">P12345\n UniProt</span></td>\
         <td>Reviewed\n   by curator</td></tr>"
    )
}

fn multiline_listing() -> Vec<AnnotationRecord> {
    let html = format!(
        "<table><tbody>{}{}{}</tbody></table>",
        listing_row("1", "1ABC"),
        listing_row("2", "2DEF"),
        listing_row("3", "2XYZ")
    );
    let records = parse_table(&html);
    assert_eq!(records.len(), 3);
    records
}

#[test]
fn multiline_cells_stay_on_one_fasta_header() {
    let (_temp, root) = temp_root();
    let path = root.join("seqs.fasta");
    let records = multiline_listing();

    let mut writer = FastaWriter::open(&path).unwrap();
    writer
        .append(&SequenceRecord::from_annotation(&records[0], "MKVL".to_string()))
        .unwrap();
    drop(writer);

    let content = fs::read_to_string(path.as_std_path()).unwrap();
    assert_eq!(
        content,
        ">1ABC_A region_values=3.1.1 region_units=5units source=RCSB_PDB uniprot=P12345 length=4\nMKVL\n"
    );

    // Cut inside the sequence of a second entry.
    let mut writer = FastaWriter::open(&path).unwrap();
    writer
        .append(&SequenceRecord::from_annotation(&records[1], "MKVLAAGG".to_string()))
        .unwrap();
    drop(writer);
    let full = fs::read_to_string(path.as_std_path()).unwrap();
    fs::write(path.as_std_path(), &full[..full.len() - 4]).unwrap();

    let writer = FastaWriter::open(&path).unwrap();
    assert_eq!(writer.len(), 1);
    assert!(!writer.contains(&records[1].key()));
    drop(writer);
    assert_eq!(fs::read_to_string(path.as_std_path()).unwrap(), content);
}

#[test]
fn multiline_cells_survive_an_interrupted_row() {
    let (_temp, root) = temp_root();
    let path = root.join("ann.csv");
    let records = multiline_listing();

    let mut table = AnnotationTable::open(&path).unwrap();
    table.append(&records[0]).unwrap();
    table.append(&records[1]).unwrap();
    drop(table);

    let content = fs::read_to_string(path.as_std_path()).unwrap();
    assert_eq!(content.lines().count(), 3);
    let cut = content.rfind("by curator").unwrap();
    fs::write(path.as_std_path(), &content[..cut]).unwrap();

    let mut table = AnnotationTable::open(&path).unwrap();
    assert_eq!(table.len(), 1);
    table.append(&records[2]).unwrap();
    drop(table);

    let read = read_records(&path).unwrap();
    let ids = read
        .iter()
        .map(|record| record.structure_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["1ABC", "2XYZ"]);
    assert_eq!(read[1].source_label, "RCSB PDB");
    assert_eq!(read[1].status, "Reviewed by curator");
}

#[test]
fn error_log_lines_are_tab_separated() {
    let (_temp, root) = temp_root();
    let path = root.join("seqs.fasta.err");

    let mut log = ErrorLog::open(&path, "sequences region=3.1").unwrap();
    log.record(
        &IdentityKey::new("1A17", "A"),
        FailureReason::NotFound,
        "chain A\tmissing\nfrom entry",
    )
    .unwrap();
    log.record_raw("page:4", "page_error", "timeout").unwrap();
    assert_eq!(log.written(), 2);
    drop(log);

    let mut log = ErrorLog::open(&path, "second run").unwrap();
    log.record(&IdentityKey::new("2XQH", "B"), FailureReason::Timeout, "")
        .unwrap();
    drop(log);

    let entries = ErrorLog::read_entries(&path).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].key, "1A17_A");
    assert_eq!(entries[0].reason, "not_found");
    assert_eq!(entries[0].detail, "chain A missing from entry");
    assert_eq!(entries[1].key, "page:4");
    assert_eq!(entries[2].reason, "timeout");

    let content = fs::read_to_string(path.as_std_path()).unwrap();
    assert_eq!(content.lines().filter(|line| line.starts_with('#')).count(), 2);
}

#[test]
fn alignment_store_writes_complete_files() {
    let (_temp, root) = temp_root();
    let store = AlignmentStore::new(root.join("aln/repeatsDB_alignments_3_1"));
    let key = IdentityKey::new("1A17", "A");
    assert!(!store.contains(&key));

    let path = store
        .write(&AlignmentPayload {
            key: key.clone(),
            bytes: b">unit.1.fasta\nAC-G\n".to_vec(),
        })
        .unwrap();

    assert!(path.ends_with("1A17_A.fasta"));
    assert!(store.contains(&key));
    assert_eq!(
        fs::read_to_string(path.as_std_path()).unwrap(),
        ">unit.1.fasta\nAC-G\n"
    );
    let leftovers = fs::read_dir(store.dir().as_std_path()).unwrap().count();
    assert_eq!(leftovers, 1);
}
