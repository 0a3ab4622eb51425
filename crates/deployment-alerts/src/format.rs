//! Render grammar for alert embeds.
//!
//! The engine keeps no database: the next cycle learns what was already alerted by
//! parsing the embeds this module rendered. Rendering and parsing live side by side
//! so both directions agree on titles, column names and the line delimiter.
//!
//! Grammar (format v1):
//!
//! ```text
//! level embed    := title "{LEVEL} - {chain}"
//!                   fields [Deployment, Chain, issue_row+]
//! issue_row      := name = issue type, value = line ("\n" line)*
//! indexing embed := title "INDEXING ERRORS - {protocol}"
//!                   inline fields Deployment, Chain, "Failed At Block"
//!                   row i = line i of each column
//! footer         := "deployment-alerts format v1" | absent (legacy)
//! ```

use crate::discord::{Embed, EmbedField, EmbedFooter};
use crate::findings::IssueLevel;

/// Footer prefix identifying our embeds; followed by the version number.
pub const FORMAT_FOOTER_PREFIX: &str = "deployment-alerts format v";
pub const FORMAT_VERSION: u32 = 1;

/// Line delimiter inside field values.
pub const LINE_DELIMITER: char = '\n';

pub const INDEXING_TITLE: &str = "INDEXING ERRORS";
pub const COLUMN_DEPLOYMENT: &str = "Deployment";
pub const COLUMN_CHAIN: &str = "Chain";
pub const COLUMN_BLOCK: &str = "Failed At Block";

/// Number of header rows at the top of a level embed.
pub const HEADER_ROWS: usize = 2;
/// Minimum rows for a level embed to be worth sending.
pub const MIN_EMBED_ROWS: usize = HEADER_ROWS + 1;
/// Values listed per issue type before the rest collapse into a count.
pub const MAX_LISTED_VALUES: usize = 3;

pub const MAX_FIELD_VALUE_CHARS: usize = 1024;
pub const MAX_EMBED_FIELDS: usize = 25;
pub const MAX_EMBED_CHARS: usize = 6000;
pub const MAX_DESCRIPTION_CHARS: usize = 300;

pub fn format_footer() -> EmbedFooter {
    EmbedFooter {
        text: format!("{FORMAT_FOOTER_PREFIX}{FORMAT_VERSION}"),
    }
}

/// Whether the embed was rendered by a grammar this parser understands.
///
/// Embeds without our footer are legacy renders of the same grammar. Embeds
/// stamped with another version are skipped, which means re-alerting rather than
/// suppressing on data we cannot read.
pub fn is_supported(embed: &Embed) -> bool {
    match embed
        .footer
        .as_ref()
        .and_then(|f| f.text.strip_prefix(FORMAT_FOOTER_PREFIX))
    {
        None => true,
        Some(version) => version.trim().parse::<u32>() == Ok(FORMAT_VERSION),
    }
}

pub fn level_title(level: IssueLevel, chain: &str) -> String {
    format!("{} - {chain}", level.title())
}

/// Parse `"{LEVEL} - {chain}"`.
pub fn parse_level_title(title: &str) -> Option<(IssueLevel, String)> {
    [IssueLevel::Protocol, IssueLevel::Pool]
        .into_iter()
        .find_map(|level| {
            let chain = title.strip_prefix(level.title())?.strip_prefix(" - ")?.trim();
            (!chain.is_empty()).then(|| (level, chain.to_string()))
        })
}

pub fn indexing_title(protocol: &str) -> String {
    format!("{INDEXING_TITLE} - {protocol}")
}

pub fn is_indexing_title(title: &str) -> bool {
    title.starts_with(INDEXING_TITLE)
}

/// Render the values of one issue type.
///
/// More than [`MAX_LISTED_VALUES`] values collapse into the first three plus a
/// count line. The count line survives the field size cap.
pub fn render_values(values: &[String]) -> String {
    let listed: Vec<String> = values
        .iter()
        .take(MAX_LISTED_VALUES)
        .map(|v| single_line(v))
        .collect();
    let listed = listed.join("\n");
    if values.len() <= MAX_LISTED_VALUES {
        return cap_lines(&listed, MAX_FIELD_VALUE_CHARS);
    }

    let count = format!("-{} pools with this error", values.len());
    let budget = MAX_FIELD_VALUE_CHARS - count.chars().count() - 1;
    format!("{}{LINE_DELIMITER}{count}", cap_lines(&listed, budget))
}

/// Issue rows of a level embed as `(issue type, rendered value)`, header rows
/// excluded.
pub fn issue_rows(embed: &Embed) -> impl Iterator<Item = (&str, &str)> {
    embed
        .fields
        .iter()
        .enumerate()
        .filter(|(i, f)| {
            !(*i < HEADER_ROWS && (f.name == COLUMN_DEPLOYMENT || f.name == COLUMN_CHAIN))
        })
        .map(|(_, f)| (f.name.as_str(), f.value.as_str()))
        .filter(|(name, _)| !name.trim().is_empty())
}

/// One rendered row of an indexing or aggregate embed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexingRow {
    pub deployment: String,
    /// Chain label, `-PENDING` suffix included.
    pub chain: String,
    pub block: u64,
}

/// Build a three-column indexing table embed.
pub fn indexing_embed(title: String, rows: &[IndexingRow], description: Option<String>) -> Embed {
    let column = |f: fn(&IndexingRow) -> String| {
        rows.iter().map(f).collect::<Vec<_>>().join("\n")
    };

    Embed {
        title,
        description: description.map(|d| truncate_chars(&single_line(&d), MAX_DESCRIPTION_CHARS)),
        fields: vec![
            EmbedField::inline(COLUMN_DEPLOYMENT, column(|r| single_line(&r.deployment))),
            EmbedField::inline(COLUMN_CHAIN, column(|r| single_line(&r.chain))),
            EmbedField::inline(COLUMN_BLOCK, column(|r| r.block.to_string())),
        ],
        footer: Some(format_footer()),
        ..Embed::default()
    }
}

/// Split rows so each column of each chunk fits in one field value.
pub fn chunk_indexing_rows(rows: &[IndexingRow]) -> Vec<Vec<IndexingRow>> {
    let mut chunks: Vec<Vec<IndexingRow>> = Vec::new();
    let mut current: Vec<IndexingRow> = Vec::new();
    let mut widths = [0usize; 3];

    for row in rows {
        let row_widths = [
            single_line(&row.deployment).chars().count() + 1,
            single_line(&row.chain).chars().count() + 1,
            row.block.to_string().len() + 1,
        ];
        let fits = widths
            .iter()
            .zip(row_widths)
            .all(|(w, r)| w + r <= MAX_FIELD_VALUE_CHARS);
        if !fits && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            widths = [0; 3];
        }
        for (w, r) in widths.iter_mut().zip(row_widths) {
            *w += r;
        }
        current.push(row.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// A row read back from a rendered indexing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIndexingRow {
    pub chain: String,
    /// Raw text of the block column, kept for textual diffing.
    pub block_text: String,
}

impl ParsedIndexingRow {
    pub fn block_number(&self) -> Option<u64> {
        self.block_text.trim().parse().ok()
    }
}

/// Zip the `Chain` and `Failed At Block` columns back into rows.
///
/// A missing column yields no rows. Columns of unequal length are zipped up to
/// the shorter one.
pub fn parse_indexing_rows(embed: &Embed) -> Vec<ParsedIndexingRow> {
    let (Some(chains), Some(blocks)) = (embed.field(COLUMN_CHAIN), embed.field(COLUMN_BLOCK))
    else {
        return Vec::new();
    };

    chains
        .value
        .split(LINE_DELIMITER)
        .zip(blocks.value.split(LINE_DELIMITER))
        .filter(|(chain, _)| !chain.trim().is_empty())
        .map(|(chain, block)| ParsedIndexingRow {
            chain: chain.trim().to_string(),
            block_text: block.trim().to_string(),
        })
        .collect()
}

/// Replace line breaks so a value cannot inject extra rows.
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn truncate_chars(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

/// Keep whole lines while the text fits in `max` characters.
fn cap_lines(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = String::new();
    for line in text.split(LINE_DELIMITER) {
        let extra = usize::from(!out.is_empty()) + line.chars().count();
        if out.chars().count() + extra > max {
            break;
        }
        if !out.is_empty() {
            out.push(LINE_DELIMITER);
        }
        out.push_str(line);
    }
    if out.is_empty() {
        out = truncate_chars(text, max);
    }
    out
}
