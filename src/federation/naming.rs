// SPDX-License-Identifier: Apache-2.0

//! Naming Resolver
//!
//! Turns arbitrary source names into engine identifiers, derives semantic
//! table names from column sets, and formats/quotes table paths. SQL in this
//! crate is composed as strings, so every identifier and literal passes
//! through [`quote_ident`] / [`quote_literal`] before interpolation.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::engine::types::SimpleColumn;

use super::provider::SourceKind;

/// Prefix applied to sanitized names that would start with a digit.
pub const DIGIT_PREFIX: &str = "t_";

const MAX_SEMANTIC_LEN: usize = 48;
const MAX_SEMANTIC_COLUMNS: usize = 3;

static GENERIC_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(id|index|idx|rowid|row_id|unnamed|column\d*|col\d*|field\d*)$")
        .expect("static regex")
});

static PLAIN_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("static regex"));

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quotes a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quotes each part and joins with dots.
pub fn qualified(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| quote_ident(p))
        .collect::<Vec<_>>()
        .join(".")
}

/// Sanitizes a raw name into a valid identifier.
///
/// ASCII alphanumerics are kept (lowercased), everything else becomes `_`,
/// runs of `_` collapse, leading/trailing `_` are trimmed and a leading digit
/// receives [`DIGIT_PREFIX`]. The function is idempotent.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;

    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }

    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("{DIGIT_PREFIX}{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Derives a deterministic, human-readable name from a column set.
///
/// Re-attaching unchanged data yields the same name.
pub fn semantic_name(columns: &[SimpleColumn]) -> String {
    let parts: Vec<String> = columns
        .iter()
        .map(|c| sanitize_identifier(&c.column_name))
        .filter(|name| !GENERIC_COLUMN.is_match(name))
        .take(MAX_SEMANTIC_COLUMNS)
        .collect();

    if parts.is_empty() {
        return "data".to_string();
    }

    let mut joined = parts.join("_");
    if joined.len() > MAX_SEMANTIC_LEN {
        joined.truncate(MAX_SEMANTIC_LEN);
        joined = joined.trim_end_matches('_').to_string();
    }
    joined
}

/// Returns `base`, or `base_2`, `base_3`... the first not in `taken`.
pub fn unique_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Name under which a datasource's database is attached.
pub fn attached_database_name(datasource_id: &str) -> String {
    sanitize_identifier(datasource_id)
}

/// Prefix shared by every native view of one datasource.
pub fn native_view_prefix(datasource_id: &str) -> String {
    format!("{}_", sanitize_identifier(datasource_id))
}

/// How a provider's tables are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathFormat {
    /// `schema.table` against the default catalog
    TwoPart,
    /// `database.schema.table`
    ThreePart,
}

impl PathFormat {
    pub fn parts(self) -> usize {
        match self {
            PathFormat::TwoPart => 2,
            PathFormat::ThreePart => 3,
        }
    }
}

/// Format table: which naming convention each source kind uses.
pub fn path_format(kind: SourceKind) -> PathFormat {
    match kind {
        SourceKind::NativeView => PathFormat::TwoPart,
        SourceKind::ForeignDatabase | SourceKind::ClickHouse | SourceKind::Spreadsheet => {
            PathFormat::ThreePart
        }
    }
}

/// Quotes a path segment only when it is not a plain lowercase identifier.
pub fn path_segment(part: &str) -> String {
    if PLAIN_IDENT.is_match(part) {
        part.to_string()
    } else {
        quote_ident(part)
    }
}

/// Joins segments into a dotted path, quoting where needed.
pub fn format_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| path_segment(p))
        .collect::<Vec<_>>()
        .join(".")
}

/// Splits a dotted path, honouring double-quoted segments.
pub fn split_path(path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts.into_iter().map(|p| p.trim().to_string()).collect()
}

/// True when `path` already carries at least the parts `format` needs.
pub fn looks_fully_qualified(path: &str, format: PathFormat) -> bool {
    split_path(path).iter().filter(|p| !p.is_empty()).count() >= format.parts()
}
