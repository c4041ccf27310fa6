//! Decompression, format sniffing and row parsers for export result files.

use std::borrow::Cow;
use std::io::Read;

use csv::ReaderBuilder;
use flate2::read::MultiGzDecoder;
use sagan_core::{ContactRecord, FieldValue, SaganError, SaganResult, TAGS, TAGS_ARRAY};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Ndjson,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    /// 1-based line in the decompressed payload.
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedExport {
    pub format: ExportFormat,
    pub records: Vec<ContactRecord>,
    pub skipped: Vec<SkippedRow>,
}

impl ParsedExport {
    fn empty(format: ExportFormat) -> Self {
        Self {
            format,
            records: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn missing_email_count(&self) -> usize {
        self.records.iter().filter(|r| !r.has_email()).count()
    }

    /// Records usable for email-keyed operations.
    pub fn keyed_records(&self) -> impl Iterator<Item = &ContactRecord> {
        self.records.iter().filter(|r| r.has_email())
    }
}

pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

/// Inflates gzip payloads; anything without the gzip signature passes through
/// untouched.
pub fn decompress(bytes: &[u8]) -> SaganResult<Cow<'_, [u8]>> {
    if !is_gzip(bytes) {
        return Ok(Cow::Borrowed(bytes));
    }
    let mut out = Vec::with_capacity(bytes.len() * 4);
    MultiGzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(SaganError::DecompressFailed)?;
    Ok(Cow::Owned(out))
}

pub fn detect_format(text: &str, url_hint: Option<&str>) -> ExportFormat {
    let names_csv = url_hint
        .and_then(|url| url.split(['?', '#']).next())
        .map(|path| path.to_ascii_lowercase().contains(".csv"))
        .unwrap_or(false);
    if names_csv {
        return ExportFormat::Csv;
    }

    if text.lines().any(is_json_object_line) {
        return ExportFormat::Ndjson;
    }
    if text.contains(',') {
        ExportFormat::Csv
    } else {
        ExportFormat::Ndjson
    }
}

fn is_json_object_line(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('{')
        && serde_json::from_str::<JsonValue>(line)
            .map(|value| value.is_object())
            .unwrap_or(false)
}

/// Decompresses, decodes and parses one downloaded export file.
pub fn parse_payload(bytes: &[u8], url_hint: Option<&str>) -> SaganResult<ParsedExport> {
    let raw = decompress(bytes)?;
    let text = std::str::from_utf8(&raw)
        .map_err(|e| SaganError::Parse(format!("export payload is not UTF-8: {e}")))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    match detect_format(text, url_hint) {
        ExportFormat::Ndjson => Ok(parse_ndjson(text)),
        ExportFormat::Csv => parse_csv(text),
    }
}

pub fn parse_ndjson(text: &str) -> ParsedExport {
    let mut parsed = ParsedExport::empty(ExportFormat::Ndjson);
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonValue>(line) {
            Ok(JsonValue::Object(object)) => {
                let mut record = ContactRecord::from_json_object(object);
                normalize_tags(&mut record);
                parsed.records.push(record);
            }
            Ok(_) => parsed.skipped.push(SkippedRow {
                line: index + 1,
                reason: "line is not a JSON object".into(),
            }),
            Err(err) => {
                debug!(line = index + 1, error = %err, "skipping malformed JSON line");
                parsed.skipped.push(SkippedRow {
                    line: index + 1,
                    reason: err.to_string(),
                });
            }
        }
    }
    parsed
}

/// Header-row CSV. Header names are lower-cased with quote characters removed;
/// rows whose width differs from the header are skipped.
pub fn parse_csv(text: &str) -> SaganResult<ParsedExport> {
    let mut parsed = ParsedExport::empty(ExportFormat::Csv);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| SaganError::Parse(format!("reading CSV header row: {e}")))?
        .iter()
        .map(|h| h.to_lowercase().replace(['"', '\''], "").trim().to_string())
        .collect::<Vec<_>>();
    if headers.iter().all(String::is_empty) {
        return Ok(parsed);
    }

    for result in reader.records() {
        match result {
            Ok(row) => {
                let line = row.position().map(|p| p.line() as usize).unwrap_or_default();
                if row.len() != headers.len() {
                    debug!(line, expected = headers.len(), found = row.len(), "skipping CSV row");
                    parsed.skipped.push(SkippedRow {
                        line,
                        reason: format!(
                            "expected {} columns, found {}",
                            headers.len(),
                            row.len()
                        ),
                    });
                    continue;
                }
                let mut record = ContactRecord::new();
                for (header, value) in headers.iter().zip(row.iter()) {
                    if !header.is_empty() {
                        record.insert_text(header.as_str(), value.trim());
                    }
                }
                normalize_tags(&mut record);
                parsed.records.push(record);
            }
            Err(err) => parsed.skipped.push(SkippedRow {
                line: err
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or_default(),
                reason: err.to_string(),
            }),
        }
    }
    Ok(parsed)
}

/// Gives `tags` a display string and `tags_array` a list when the stored
/// value is a list or list-shaped quoted text. Plain text is left alone.
pub fn normalize_tags(record: &mut ContactRecord) {
    match record.get(TAGS).cloned() {
        Some(FieldValue::List(items)) => {
            let items = items
                .into_iter()
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect::<Vec<_>>();
            record.insert_text(TAGS, items.join(", "));
            record.insert_list(TAGS_ARRAY, items);
        }
        Some(FieldValue::Text(text)) if is_quoted_list(&text) => {
            let (normalized, items) = split_quoted_list(&text);
            record.insert_text(TAGS, normalized);
            record.insert_list(TAGS_ARRAY, items);
        }
        _ => {}
    }
}

fn is_quoted_list(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.contains("\"\"")
        || trimmed.contains("\",\"")
        || (trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"'))
}

fn split_quoted_list(text: &str) -> (String, Vec<String>) {
    let normalized = text
        .trim()
        .trim_matches('"')
        .replace("\"\"", "\"")
        .replace("\", \"", "\",\"");
    let items = normalized
        .split("\",\"")
        .map(|tag| tag.trim_matches('"').trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect();
    (normalized, items)
}
