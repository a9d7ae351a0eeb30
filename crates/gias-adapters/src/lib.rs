//! Source format adapters: encoding repair, geo dump reshaping and staging shape derivation.

use std::path::Path;

use encoding_rs::Encoding;
use gias_core::{StagingTableDef, MIN_GEO_FIELDS};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "gias-adapters";

/// Token the tab-delimited dumps use for "no value".
pub const NULL_SENTINEL: &str = "\\N";

const STDIN_PLACEHOLDER: &str = "stdin;";

#[derive(Debug, Error)]
pub enum NormalizationError {
    #[error("unknown source encoding label {label:?}")]
    UnknownEncoding { label: String },
    #[error("input contains bytes unmappable from {encoding}")]
    UnmappableEncoding { encoding: &'static str },
}

impl NormalizationError {
    pub fn classification(&self) -> &'static str {
        match self {
            NormalizationError::UnknownEncoding { .. } => "UnknownEncoding",
            NormalizationError::UnmappableEncoding { .. } => "UnmappableEncoding",
        }
    }
}

/// What to do with byte sequences the source encoding cannot map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmappablePolicy {
    /// Emit U+FFFD and count the substitutions.
    Substitute,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    pub encoding: &'static str,
    pub substitutions: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EncodingNormalizer {
    encoding: &'static Encoding,
    policy: UnmappablePolicy,
}

impl EncodingNormalizer {
    pub fn windows_1252() -> Self {
        Self {
            encoding: encoding_rs::WINDOWS_1252,
            policy: UnmappablePolicy::Substitute,
        }
    }

    pub fn for_label(label: &str, policy: UnmappablePolicy) -> Result<Self, NormalizationError> {
        let encoding = Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| {
            NormalizationError::UnknownEncoding {
                label: label.to_string(),
            }
        })?;
        Ok(Self { encoding, policy })
    }

    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Decode legacy bytes to UTF-8. A leading byte-order mark overrides the configured encoding.
    pub fn normalize(&self, bytes: &[u8]) -> Result<Normalized, NormalizationError> {
        let (text, used, had_errors) = self.encoding.decode(bytes);

        if had_errors && self.policy == UnmappablePolicy::Reject {
            return Err(NormalizationError::UnmappableEncoding {
                encoding: used.name(),
            });
        }

        let substitutions = if had_errors {
            text.matches('\u{FFFD}').count()
        } else {
            0
        };
        if substitutions > 0 {
            warn!(encoding = used.name(), substitutions, "substituted unmappable bytes");
        }

        Ok(Normalized {
            text: text.into_owned(),
            encoding: used.name(),
            substitutions,
        })
    }
}

#[derive(Debug, Error)]
pub enum ReshapeError {
    /// Row-level and recoverable: the row is dropped and reported, never raised.
    #[error("line {line} has {field_count} fields, fewer than {min_fields}")]
    UnparsableLine {
        line: usize,
        field_count: usize,
        min_fields: usize,
    },
    #[error("first line is not a bulk-load template containing `stdin;`")]
    MissingLoadTemplate,
    #[error("writing reshaped csv: {0}")]
    Csv(#[from] csv::Error),
}

/// One dump line, checked for arity once and then never re-inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    Valid(Vec<Option<String>>),
    Rejected { line: usize, field_count: usize },
}

impl RawRecord {
    pub fn parse(line_no: usize, line: &str, min_fields: usize) -> Self {
        let fields = line
            .split('\t')
            .map(|field| (field != NULL_SENTINEL).then(|| field.to_string()))
            .collect::<Vec<_>>();

        if fields.len() < min_fields {
            RawRecord::Rejected {
                line: line_no,
                field_count: fields.len(),
            }
        } else {
            RawRecord::Valid(fields)
        }
    }
}

#[derive(Debug)]
pub struct Reshaped {
    pub csv: Vec<u8>,
    pub load_command: String,
    pub kept_rows: usize,
    pub dropped: Vec<ReshapeError>,
}

impl Reshaped {
    pub fn dropped_rows(&self) -> usize {
        self.dropped.len()
    }
}

/// Split on CRLF, LF or CR. A trailing terminator does not produce an extra line.
pub fn split_lines(text: &str) -> Vec<&str> {
    let mut lines = text
        .split("\r\n")
        .flat_map(|chunk| chunk.split(['\n', '\r']))
        .collect::<Vec<_>>();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Turn a header-less, tab-delimited dump into a headed CSV plus the command that loads it.
///
/// The dump's first line is a bulk-load template such as
/// `COPY electoral_regions_raw (ogc_fid, ...) FROM stdin;`; its placeholder is
/// replaced with `destination` and CSV-with-header syntax. Fields equal to
/// [`NULL_SENTINEL`] are written as an unquoted sentinel and the command declares it as
/// the null string, so an empty string still loads as an empty string.
pub fn reshape(
    raw: &str,
    header: &[&str],
    destination: &Path,
) -> Result<Reshaped, ReshapeError> {
    let lines = split_lines(raw);
    let (template, data) = lines
        .split_first()
        .ok_or(ReshapeError::MissingLoadTemplate)?;
    if !template.contains(STDIN_PLACEHOLDER) {
        return Err(ReshapeError::MissingLoadTemplate);
    }
    let load_command = template.replace(
        STDIN_PLACEHOLDER,
        &format!(
            "{} with csv header null {}",
            sql_literal(&destination.display().to_string()),
            sql_literal(NULL_SENTINEL)
        ),
    );

    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    writer.write_record(header)?;

    let mut kept_rows = 0usize;
    let mut dropped = Vec::new();
    for (index, line) in data.iter().enumerate() {
        // 1-based, counting the template line.
        let line_no = index + 2;
        match RawRecord::parse(line_no, line, MIN_GEO_FIELDS) {
            RawRecord::Valid(fields) => {
                if fields.len() != header.len() {
                    debug!(
                        line = line_no,
                        fields = fields.len(),
                        expected = header.len(),
                        "row width differs from header"
                    );
                }
                writer.write_record(fields.iter().map(|f| f.as_deref().unwrap_or(NULL_SENTINEL)))?;
                kept_rows += 1;
            }
            RawRecord::Rejected { line, field_count } => {
                debug!(line, field_count, "dropping short row");
                dropped.push(ReshapeError::UnparsableLine {
                    line,
                    field_count,
                    min_fields: MIN_GEO_FIELDS,
                });
            }
        }
    }

    let csv = writer
        .into_inner()
        .map_err(|err| ReshapeError::Csv(err.into_error().into()))?;
    info!(
        destination = %destination.display(),
        kept_rows,
        dropped_rows = dropped.len(),
        "reshaped tab-delimited dump"
    );

    Ok(Reshaped {
        csv,
        load_command,
        kept_rows,
        dropped,
    })
}

/// Convert a free-form CSV heading into a snake_case column name.
///
/// `"LA (code)"` becomes `la_code`, `"PercentageFSM"` becomes `percentage_fsm`.
pub fn snake_case_column(heading: &str) -> String {
    let mut out = String::with_capacity(heading.len() + 4);
    let mut prev: Option<char> = None;
    for c in heading.trim_start_matches('\u{feff}').chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase()
                && prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit())
            {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
        prev = Some(c);
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Build a staging shape whose columns mirror a CSV header line.
pub fn staging_shape_from_csv(
    table: &str,
    csv_bytes: &[u8],
) -> Result<StagingTableDef, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(csv_bytes);
    let headings = reader.headers()?.clone();

    let mut columns: Vec<String> = Vec::with_capacity(headings.len());
    for (index, heading) in headings.iter().enumerate() {
        let mut name = snake_case_column(heading);
        if name.is_empty() {
            name = format!("column_{}", index + 1);
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            name = format!("c_{name}");
        }
        let base = name.clone();
        let mut suffix = 2;
        while columns.contains(&name) {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }
        columns.push(name);
    }

    Ok(StagingTableDef {
        name: table.to_string(),
        columns,
    })
}
