//! Sheet extraction: bytes → normalized [`SourceRecord`]s.
//!
//! # Sheet layout
//!
//! ```text
//! facility, year, month, 09:00, 10:00, ...
//! north,    2024, 3,     4,     ,      ...
//! ```
//!
//! `facility` is optional; when absent (or blank on a row) the partition
//! name encoded in the file name is used. Every other non-blank header cell
//! is a slot label. Blank slot cells are omitted from the record.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use slotsync_core::{
    ClassifiedError, ErrorCode, PartitionMap, Period, RecordKey, SlotCounts, SourceRecord,
};

use crate::reader::SourceHandle;

// ---------------------------------------------------------------------------
// Parsing boundary
// ---------------------------------------------------------------------------

/// One parsed row and the physical line it starts on (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetRow {
    pub line: usize,
    pub cells: Vec<String>,
}

/// Turns raw file bytes into rows of cells.
pub trait SheetParser: Send + Sync {
    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Vec<SheetRow>, ClassifiedError>;
}

/// Comma/tab separated sheet exports with RFC 4180 quoting.
///
/// With no fixed delimiter the extension decides: `.tsv` is tab separated,
/// anything else comma separated.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelimitedSheetParser {
    delimiter: Option<char>,
}

impl DelimitedSheetParser {
    pub fn with_delimiter(delimiter: char) -> Self {
        Self {
            delimiter: Some(delimiter),
        }
    }

    fn delimiter_for(&self, path: &Path) -> char {
        self.delimiter.unwrap_or_else(|| {
            match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if ext.eq_ignore_ascii_case("tsv") => '\t',
                _ => ',',
            }
        })
    }
}

impl SheetParser for DelimitedSheetParser {
    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Vec<SheetRow>, ClassifiedError> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            ClassifiedError::source_read(
                ErrorCode::Malformed,
                format!("{}: not valid UTF-8: {e}", path.display()),
            )
        })?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        split_rows(text, self.delimiter_for(path)).map_err(|line| {
            ClassifiedError::source_read(
                ErrorCode::Malformed,
                format!("{}: unterminated quote starting on line {line}", path.display()),
            )
        })
    }
}

/// Split delimited text into rows. `Err(line)` on an unterminated quote.
fn split_rows(text: &str, delimiter: char) -> Result<Vec<SheetRow>, usize> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut quote_line = 0;
    let mut line = 1;
    let mut row_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    cell.push(c);
                }
                _ => cell.push(c),
            }
            continue;
        }
        match c {
            '"' if cell.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            c if c == delimiter => row.push(std::mem::take(&mut cell)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                row.push(std::mem::take(&mut cell));
                rows.push(SheetRow {
                    line: row_line,
                    cells: std::mem::take(&mut row),
                });
                line += 1;
                row_line = line;
            }
            _ => cell.push(c),
        }
    }
    if in_quotes {
        return Err(quote_line);
    }
    if !cell.is_empty() || !row.is_empty() {
        row.push(cell);
        rows.push(SheetRow {
            line: row_line,
            cells: row,
        });
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Result of extracting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Resolved records, ascending by key. Never contains partition 0.
    pub records: Vec<SourceRecord>,
    /// Data rows dropped because their partition name did not resolve.
    pub excluded: usize,
    /// SHA-256 hex digest of the file content.
    pub digest: String,
}

impl Extraction {
    /// Nothing resolved: the file has nothing to sync.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parses sheets and resolves each row's partition key.
#[derive(Clone)]
pub struct Extractor {
    partitions: PartitionMap,
    parser: Arc<dyn SheetParser>,
}

impl std::fmt::Debug for Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extractor")
            .field("partitions", &self.partitions)
            .finish_non_exhaustive()
    }
}

impl Extractor {
    pub fn new(partitions: PartitionMap) -> Self {
        Self::with_parser(partitions, Arc::new(DelimitedSheetParser::default()))
    }

    pub fn with_parser(partitions: PartitionMap, parser: Arc<dyn SheetParser>) -> Self {
        Self { partitions, parser }
    }

    /// Read and extract the file behind `handle`. Blocking.
    ///
    /// The handle (and its lock) is released once the content is read,
    /// before parsing starts.
    pub fn extract(
        &self,
        handle: SourceHandle,
        file_partition: Option<&str>,
    ) -> Result<Extraction, ClassifiedError> {
        let path = handle.path().to_path_buf();
        let bytes = handle.read_all()?;
        self.extract_bytes(&path, &bytes, file_partition)
    }

    /// Extract already-read content.
    pub fn extract_bytes(
        &self,
        path: &Path,
        bytes: &[u8],
        file_partition: Option<&str>,
    ) -> Result<Extraction, ClassifiedError> {
        let digest = hex::encode(Sha256::digest(bytes));
        let rows = self.parser.parse(path, bytes)?;
        let mut rows = rows
            .into_iter()
            .filter(|row| row.cells.iter().any(|c| !c.trim().is_empty()));

        let Some(header) = rows.next() else {
            return Err(malformed(path, 1, "missing header row"));
        };
        let layout = Layout::from_header(path, header.line, &header.cells)?;
        if layout.facility.is_none() && file_partition.is_none() {
            return Err(malformed(
                path,
                header.line,
                "no `facility` column and no file partition",
            ));
        }

        let mut by_key: BTreeMap<RecordKey, SourceRecord> = BTreeMap::new();
        let mut excluded = 0;
        for SheetRow { line, cells } in rows {
            let name = layout
                .facility
                .and_then(|col| cell(&cells, col))
                .or(file_partition)
                .unwrap_or_default();
            let partition = self.partitions.resolve(name);
            if !partition.is_resolved() {
                tracing::info!(
                    file = %path.display(),
                    line,
                    facility = %name,
                    "excluding row with unresolved partition"
                );
                excluded += 1;
                continue;
            }

            let period = layout.period(path, line, &cells)?;
            let mut slots = SlotCounts::new();
            for (col, label) in &layout.slots {
                let Some(raw) = cell(&cells, *col) else {
                    continue;
                };
                let count = raw.parse::<u32>().map_err(|_| {
                    malformed(path, line, &format!("slot `{label}`: `{raw}` is not a count"))
                })?;
                slots.insert(label.clone(), count);
            }

            let record = SourceRecord {
                partition,
                period,
                slots,
            };
            if by_key.insert(record.key(), record).is_some() {
                tracing::warn!(
                    file = %path.display(),
                    line,
                    partition = %partition,
                    period = %period,
                    "duplicate row, later row wins"
                );
            }
        }

        Ok(Extraction {
            records: by_key.into_values().collect(),
            excluded,
            digest,
        })
    }
}

/// Column positions derived from the header row.
struct Layout {
    facility: Option<usize>,
    year: usize,
    month: usize,
    slots: Vec<(usize, String)>,
}

impl Layout {
    fn from_header(path: &Path, line: usize, header: &[String]) -> Result<Self, ClassifiedError> {
        let mut facility = None;
        let mut year = None;
        let mut month = None;
        let mut slots = Vec::new();
        for (col, raw) in header.iter().enumerate() {
            let label = raw.trim();
            match label.to_lowercase().as_str() {
                "" => {}
                "facility" => facility = Some(col),
                "year" => year = Some(col),
                "month" => month = Some(col),
                _ => slots.push((col, label.to_string())),
            }
        }
        let year = year.ok_or_else(|| malformed(path, line, "header has no `year` column"))?;
        let month = month.ok_or_else(|| malformed(path, line, "header has no `month` column"))?;
        Ok(Self {
            facility,
            year,
            month,
            slots,
        })
    }

    fn period(&self, path: &Path, line: usize, cells: &[String]) -> Result<Period, ClassifiedError> {
        let year = cell(cells, self.year)
            .and_then(|v| v.parse::<i32>().ok())
            .ok_or_else(|| malformed(path, line, "invalid year"))?;
        let month = cell(cells, self.month)
            .and_then(|v| v.parse::<u32>().ok())
            .and_then(|m| Period::new(year, m))
            .ok_or_else(|| malformed(path, line, "invalid month"))?;
        Ok(month)
    }
}

/// Trimmed, non-blank cell at `col`.
fn cell(cells: &[String], col: usize) -> Option<&str> {
    cells
        .get(col)
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
}

fn malformed(path: &Path, line: usize, reason: &str) -> ClassifiedError {
    ClassifiedError::source_read(
        ErrorCode::Malformed,
        format!("{}:{line}: {reason}", path.display()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotsync_core::PartitionKey;
    use std::path::PathBuf;

    fn extractor() -> Extractor {
        Extractor::new(PartitionMap::new([("north", 1), ("south", 3)]).unwrap())
    }

    fn csv() -> PathBuf {
        PathBuf::from("reservations_north.csv")
    }

    #[test]
    fn splits_quoted_cells() {
        let rows = split_rows("a,\"b,c\",\"say \"\"hi\"\"\"\r\n1,2,3\n", ',').unwrap();
        assert_eq!(rows[0].cells, vec!["a", "b,c", "say \"hi\""]);
        assert_eq!(rows[1].cells, vec!["1", "2", "3"]);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn rows_keep_their_physical_line() {
        let rows = split_rows("a,b\n\"two\nlines\",x\n\n3,4\n", ',').unwrap();
        let lines: Vec<usize> = rows.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![1, 2, 4, 5]);
        assert_eq!(rows[1].cells, vec!["two\nlines", "x"]);
    }

    #[test]
    fn errors_point_at_the_line_after_a_multiline_cell() {
        let sheet = "facility,year,month,09:00\n\"north\",2024,1,\"3\"\n\"no\nrth\",2024,2,1\nnorth,2024,13,3\n";
        let err = extractor()
            .extract_bytes(&csv(), sheet.as_bytes(), Some("north"))
            .unwrap_err();
        assert!(err.message.contains("reservations_north.csv:5:"), "{}", err.message);
    }

    #[test]
    fn unterminated_quote_is_malformed() {
        let err = DelimitedSheetParser::default()
            .parse(&csv(), b"a,\"b\n1,2\n")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Malformed);
        assert!(err.message.contains("line 1"));
    }

    #[test]
    fn tsv_extension_selects_tab() {
        let rows = DelimitedSheetParser::default()
            .parse(Path::new("x.tsv"), b"year\tmonth\n2024\t1\n")
            .unwrap();
        assert_eq!(rows[0].cells, vec!["year", "month"]);
    }

    #[test]
    fn extracts_records_and_excludes_unresolved_rows() {
        let sheet = "\u{feff}facility,year,month,09:00,10:00\n\
                     north,2024,1,3,\n\
                     west,2024,1,9,9\n\
                     South,2024,2,0,5\n\
                     \n";
        let out = extractor().extract_bytes(&csv(), sheet.as_bytes(), None).unwrap();
        assert_eq!(out.excluded, 1);
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].partition, PartitionKey(1));
        assert_eq!(out.records[0].slots.get("09:00"), Some(&3));
        assert!(!out.records[0].slots.contains_key("10:00"));
        assert_eq!(out.records[1].partition, PartitionKey(3));
        assert_eq!(out.digest.len(), 64);
    }

    #[test]
    fn all_rows_excluded_is_empty_not_error() {
        let sheet = "facility,year,month,09:00\nwest,2024,1,3\neast,2024,1,3\n";
        let out = extractor().extract_bytes(&csv(), sheet.as_bytes(), None).unwrap();
        assert!(out.is_empty());
        assert_eq!(out.excluded, 2);
    }

    #[test]
    fn file_partition_used_without_facility_column() {
        let sheet = "year,month,09:00\n2024,3,7\n";
        let out = extractor()
            .extract_bytes(&csv(), sheet.as_bytes(), Some("north"))
            .unwrap();
        assert_eq!(out.records[0].partition, PartitionKey(1));
    }

    #[test]
    fn duplicate_rows_later_wins() {
        let sheet = "facility,year,month,09:00\nnorth,2024,1,3\nnorth,2024,1,8\n";
        let out = extractor().extract_bytes(&csv(), sheet.as_bytes(), None).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].slots.get("09:00"), Some(&8));
    }

    #[test]
    fn bad_values_are_malformed() {
        for sheet in [
            "facility,year,month,09:00\nnorth,20x4,1,3\n",
            "facility,year,month,09:00\nnorth,2024,13,3\n",
            "facility,year,month,09:00\nnorth,2024,1,-3\n",
            "facility,month,09:00\nnorth,1,3\n",
            "",
        ] {
            let err = extractor()
                .extract_bytes(&csv(), sheet.as_bytes(), None)
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::Malformed, "sheet: {sheet:?}");
            assert!(!err.retryable);
        }
    }

    #[test]
    fn digest_tracks_content() {
        let a = extractor()
            .extract_bytes(&csv(), b"facility,year,month\nnorth,2024,1\n", None)
            .unwrap();
        let b = extractor()
            .extract_bytes(&csv(), b"facility,year,month\nnorth,2024,2\n", None)
            .unwrap();
        assert_ne!(a.digest, b.digest);
    }
}
