#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaEntry {
    pub header: String,
    pub sequence: String,
}

/// Splits multi-FASTA text into entries. Text before the first header is
/// ignored; sequence lines are concatenated without whitespace.
pub fn parse_fasta(text: &str) -> Vec<FastaEntry> {
    let mut entries: Vec<FastaEntry> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(header) = line.strip_prefix('>') {
            entries.push(FastaEntry {
                header: header.trim().to_string(),
                sequence: String::new(),
            });
        } else if let Some(entry) = entries.last_mut() {
            entry.sequence.push_str(line);
        }
    }
    entries
}
