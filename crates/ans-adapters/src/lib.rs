//! Source adapters: directory-listing discovery, CSV decoding and header normalization.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use ans_core::FinancialRow;
use ans_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use encoding_rs::{Encoding, WINDOWS_1252};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const CRATE_NAME: &str = "ans-adapters";

pub const ANS_FINANCIAL_STATEMENTS_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/demonstracoes_contabeis/";

static YEAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}/$").expect("year pattern is valid"));
static QUARTER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-4]T\d{4}/$").expect("quarter pattern is valid"));
static ARCHIVE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.*\.zip$").expect("archive pattern is valid"));

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("could not retrieve directory {url}: {source}")]
    Directory {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("link {href:?} on {url} does not resolve: {source}")]
    Link {
        url: String,
        href: String,
        #[source]
        source: url::ParseError,
    },
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("header must not be blank")]
    BlankHeader,
    #[error("unmapped header: {0}")]
    UnmappedHeader(String),
}

/// Zip archive published for one disclosure quarter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveLocation {
    /// Quarter directory label, e.g. `4T2024`.
    pub period: String,
    pub url: String,
}

/// Anything that can return the HTML listing of a remote directory.
#[async_trait]
pub trait DirectoryListing: Send + Sync {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl DirectoryListing for HttpFetcher {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
        self.fetch_text(url).await
    }
}

#[async_trait]
impl<T: DirectoryListing + ?Sized> DirectoryListing for &T {
    async fn fetch_listing(&self, url: &str) -> Result<String, FetchError> {
        (**self).fetch_listing(url).await
    }
}

/// Walks the year → quarter → archive directory tree of the disclosure site.
pub struct Discoverer<L> {
    listing: L,
    base_url: String,
}

impl<L: DirectoryListing> Discoverer<L> {
    pub fn new(listing: L, base_url: impl Into<String>) -> Self {
        Self {
            listing,
            base_url: base_url.into(),
        }
    }

    /// Archives of the `count` most recent quarters that actually publish one.
    ///
    /// Years and quarters are visited newest first. A quarter directory with
    /// no `.zip` link is skipped and does not count towards `count`.
    pub async fn find_recent_periods(
        &self,
        count: usize,
    ) -> Result<Vec<ArchiveLocation>, AdapterError> {
        if count == 0 {
            return Err(AdapterError::InvalidArgument(
                "quarter count must be greater than zero".into(),
            ));
        }

        let mut years = self.links_matching(&self.base_url, &YEAR_PATTERN).await?;
        years.sort_by(|a, b| b.cmp(a));

        let mut found = Vec::with_capacity(count);
        for year_url in years {
            if found.len() >= count {
                break;
            }

            let mut quarters = self.links_matching(&year_url, &QUARTER_PATTERN).await?;
            quarters.sort_by(|a, b| b.cmp(a));

            for quarter_url in quarters {
                if found.len() >= count {
                    break;
                }

                let archives = self.links_matching(&quarter_url, &ARCHIVE_PATTERN).await?;
                match archives.into_iter().next() {
                    Some(url) => found.push(ArchiveLocation {
                        period: last_path_segment(&quarter_url),
                        url,
                    }),
                    None => debug!(quarter = %quarter_url, "quarter has no archive; skipping"),
                }
            }
        }

        info!(requested = count, found = found.len(), "archive discovery finished");
        Ok(found)
    }

    async fn links_matching(
        &self,
        url: &str,
        pattern: &Regex,
    ) -> Result<Vec<String>, AdapterError> {
        let html = self
            .listing
            .fetch_listing(url)
            .await
            .map_err(|source| AdapterError::Directory {
                url: url.to_string(),
                source,
            })?;
        extract_links(&html, url, pattern)
    }
}

/// Absolute URLs of every `a[href]` whose raw `href` fully matches `pattern`.
fn extract_links(html: &str, page_url: &str, pattern: &Regex) -> Result<Vec<String>, AdapterError> {
    let base = Url::parse(page_url).map_err(|source| AdapterError::Link {
        url: page_url.to_string(),
        href: page_url.to_string(),
        source,
    })?;
    let selector =
        Selector::parse("a[href]").map_err(|e| AdapterError::InvalidArgument(e.to_string()))?;
    let document = Html::parse_document(html);

    let mut links = Vec::new();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !pattern.is_match(href) {
            continue;
        }
        let absolute = base.join(href).map_err(|source| AdapterError::Link {
            url: page_url.to_string(),
            href: href.to_string(),
            source,
        })?;
        links.push(absolute.to_string());
    }
    Ok(links)
}

fn last_path_segment(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Cell filter: a case-insensitive regex, or a case-insensitive substring
/// when the pattern does not compile.
#[derive(Debug, Clone)]
enum RowPattern {
    Regex(Regex),
    Substring(String),
}

impl RowPattern {
    fn compile(pattern: &str) -> Self {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Self::Regex(regex),
            Err(_) => Self::Substring(pattern.to_lowercase()),
        }
    }

    fn matches(&self, cell: &str) -> bool {
        match self {
            Self::Regex(regex) => regex.is_match(cell),
            Self::Substring(needle) => cell.to_lowercase().contains(needle.as_str()),
        }
    }
}

/// Split-based reader for the publisher's `;` delimited files.
///
/// There is no quoting or escaping: a delimiter inside a cell splits the
/// cell. Lines are decoded one at a time with a single-byte legacy encoding
/// (Windows-1252, the superset browsers use for ISO-8859-1).
#[derive(Debug, Clone)]
pub struct CsvParser {
    delimiter: char,
    encoding: &'static Encoding,
}

impl Default for CsvParser {
    fn default() -> Self {
        Self {
            delimiter: ';',
            encoding: WINDOWS_1252,
        }
    }
}

impl CsvParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows where any cell matches any of `patterns`, keyed by trimmed
    /// upper-case header.
    ///
    /// A header-only or empty file yields no rows. Blank data lines are skipped.
    pub fn parse_and_filter<I, S>(
        &self,
        path: &Path,
        patterns: I,
    ) -> Result<Vec<FinancialRow>, AdapterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<RowPattern> = patterns
            .into_iter()
            .map(|p| RowPattern::compile(p.as_ref()))
            .collect();
        if patterns.is_empty() {
            return Err(AdapterError::InvalidArgument(
                "at least one row pattern is required".into(),
            ));
        }
        if !path.is_file() {
            return Err(AdapterError::InvalidArgument(format!(
                "csv file {} does not exist",
                path.display()
            )));
        }

        let file = File::open(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();

        let Some(header_line) = self.read_line(&mut reader, &mut buf, path)? else {
            return Ok(Vec::new());
        };
        let headers: Vec<String> = header_line
            .split(self.delimiter)
            .map(|h| h.trim().to_uppercase())
            .collect();

        let mut rows = Vec::new();
        let mut scanned = 0usize;
        while let Some(line) = self.read_line(&mut reader, &mut buf, path)? {
            if line.trim().is_empty() {
                continue;
            }
            scanned += 1;

            let mut row = FinancialRow::new();
            let mut keep = false;
            for (header, cell) in headers.iter().zip(line.split(self.delimiter)) {
                let cell = cell.trim();
                if !keep && patterns.iter().any(|p| p.matches(cell)) {
                    keep = true;
                }
                row.insert(header.clone(), cell.to_string());
            }
            if keep {
                rows.push(row);
            }
        }

        debug!(
            file = %path.display(),
            scanned,
            kept = rows.len(),
            "csv parsed"
        );
        Ok(rows)
    }

    fn read_line<R: BufRead>(
        &self,
        reader: &mut R,
        buf: &mut Vec<u8>,
        path: &Path,
    ) -> Result<Option<String>, AdapterError> {
        buf.clear();
        let read = reader
            .read_until(b'\n', buf)
            .map_err(|source| AdapterError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if read == 0 {
            return Ok(None);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let bytes = buf.strip_prefix(UTF8_BOM).unwrap_or(buf.as_slice());
        let (text, _had_errors) = self.encoding.decode_without_bom_handling(bytes);
        Ok(Some(text.into_owned()))
    }
}

/// Canonical column vocabulary shared by every disclosure revision.
pub const STANDARD_SCHEMA: [&str; 3] = ["CODIGO_CONTA", "REGISTRO_ANS", "DATA"];

/// Maps historical header spellings onto [`STANDARD_SCHEMA`] through an explicit table.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    aliases: HashMap<String, String>,
}

impl Default for SchemaNormalizer {
    fn default() -> Self {
        Self::new([
            ("CD_CONTA_CONTABIL", "CODIGO_CONTA"),
            ("CONTA_CONTABIL", "CODIGO_CONTA"),
            ("CODIGO_CONTA", "CODIGO_CONTA"),
            ("REG_ANS", "REGISTRO_ANS"),
            ("REGISTRO", "REGISTRO_ANS"),
            ("REGISTRO_ANS", "REGISTRO_ANS"),
            ("DATA_DOCUMENTO", "DATA"),
            ("DATA", "DATA"),
        ])
    }
}

impl SchemaNormalizer {
    pub fn new<I, K, V>(aliases: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            aliases: aliases
                .into_iter()
                .map(|(k, v)| (k.as_ref().trim().to_uppercase(), v.into()))
                .collect(),
        }
    }

    pub fn normalize(&self, header: &str) -> Result<&str, SchemaError> {
        let key = header.trim().to_uppercase();
        if key.is_empty() {
            return Err(SchemaError::BlankHeader);
        }
        self.aliases
            .get(&key)
            .map(String::as_str)
            .ok_or_else(|| SchemaError::UnmappedHeader(header.to_string()))
    }

    /// Re-key a parsed row onto canonical names.
    ///
    /// Lenient mode keeps unmapped keys as they are; strict mode fails on the
    /// first one. Source keys are visited in ascending order, so when an alias
    /// and its canonical name are both present the alphabetically first key
    /// wins (`REGISTRO_ANS` over `REG_ANS`).
    pub fn normalize_row(
        &self,
        row: FinancialRow,
        strict: bool,
    ) -> Result<FinancialRow, SchemaError> {
        let mut normalized = FinancialRow::new();
        for (key, value) in row {
            let target = match self.normalize(&key) {
                Ok(canonical) => canonical.to_string(),
                Err(err) if strict => return Err(err),
                Err(_) => key,
            };
            normalized.entry(target).or_insert(value);
        }
        Ok(normalized)
    }
}
