//! Ingest pipeline: registry join, per-account aggregation and transactional load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ans_adapters::{
    AdapterError, ArchiveLocation, CsvParser, Discoverer, SchemaNormalizer,
    ANS_FINANCIAL_STATEMENTS_URL,
};
use ans_core::{
    canonical_operator_id, AggregatedRecord, EnrichedRecord, FinancialRow, RegistryEntry,
};
use ans_storage::{extract_archive, HttpClientConfig, HttpFetcher};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, instrument, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ans-sync";

pub const ANS_REGISTRY_URL: &str = concat!(
    "https://dadosabertos.ans.gov.br/FTP/PDA/",
    "operadoras_de_plano_de_saude_ativas/Relatorio_cadop.csv"
);

/// Column the pipeline adds to every financial row: the archive's quarter label.
pub const PERIOD_COLUMN: &str = "TRIMESTRE";

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

// SQLite's default SQLITE_MAX_VARIABLE_NUMBER since 3.32.
const MAX_BIND_PARAMS: usize = 32_766;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub base_url: String,
    pub registry_url: String,
    pub registry_path: Option<PathBuf>,
    pub download_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub quarters: usize,
    pub row_patterns: Vec<String>,
    pub strict_headers: bool,
    pub import_chunk_size: usize,
    pub user_agent: String,
    pub http_connect_timeout_secs: u64,
    pub http_read_timeout_secs: u64,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let row_patterns: Vec<String> = std::env::var("ANS_ROW_PATTERNS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/ans.db".to_string()),
            base_url: std::env::var("ANS_BASE_URL")
                .unwrap_or_else(|_| ANS_FINANCIAL_STATEMENTS_URL.to_string()),
            registry_url: std::env::var("ANS_REGISTRY_URL")
                .unwrap_or_else(|_| ANS_REGISTRY_URL.to_string()),
            registry_path: std::env::var("ANS_REGISTRY_PATH").ok().map(PathBuf::from),
            download_dir: std::env::var("ANS_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./downloads_ans")),
            reports_dir: std::env::var("ANS_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            quarters: env_parse("ANS_QUARTERS", 3),
            row_patterns: if row_patterns.is_empty() {
                vec![".*".to_string()]
            } else {
                row_patterns
            },
            strict_headers: std::env::var("ANS_STRICT_HEADERS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            import_chunk_size: env_parse("ANS_IMPORT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            user_agent: std::env::var("ANS_USER_AGENT")
                .unwrap_or_else(|_| "ans-ingest/0.1".to_string()),
            http_connect_timeout_secs: env_parse("ANS_HTTP_CONNECT_TIMEOUT_SECS", 10),
            http_read_timeout_secs: env_parse("ANS_HTTP_READ_TIMEOUT_SECS", 30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Header spellings the enricher accepts for each field, tried in order.
#[derive(Debug, Clone)]
pub struct ColumnAliases {
    pub operator_id: Vec<String>,
    pub legal_name: Vec<String>,
    pub trade_name: Vec<String>,
    pub city: Vec<String>,
    pub state: Vec<String>,
    pub account_code: Vec<String>,
    pub value: Vec<String>,
    pub period: Vec<String>,
}

impl Default for ColumnAliases {
    fn default() -> Self {
        fn names(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }
        Self {
            operator_id: names(&["CNPJ", "REG_ANS", "REGISTRO_ANS"]),
            legal_name: names(&["RAZAO_SOCIAL"]),
            trade_name: names(&["NOME_FANTASIA"]),
            city: names(&["CIDADE"]),
            state: names(&["UF"]),
            account_code: names(&["CD_CONTA_CONTABIL", "CODIGO_CONTA"]),
            value: names(&["VL_SALDO_FINAL", "VALOR"]),
            period: names(&["DATA", PERIOD_COLUMN]),
        }
    }
}

/// First alias present in `row` with a non-blank value.
fn first_value<'a>(row: &'a FinancialRow, aliases: &[String]) -> Option<&'a str> {
    aliases
        .iter()
        .filter_map(|alias| row.get(alias))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

/// Canonical identifier from the first alias whose value still has digits.
fn resolve_operator_id(row: &FinancialRow, aliases: &[String]) -> String {
    aliases
        .iter()
        .filter_map(|alias| row.get(alias))
        .map(|value| canonical_operator_id(value))
        .find(|id| !id.is_empty())
        .unwrap_or_default()
}

/// Registry entries keyed by canonical operator identifier.
///
/// Held fully in memory: the regulator lists a few thousand active operators,
/// well below the point where a database-side join would pay off.
#[derive(Debug, Clone, Default)]
pub struct RegistryIndex {
    entries: Vec<RegistryEntry>,
    by_id: HashMap<String, usize>,
}

impl RegistryIndex {
    /// Build the index; the first row seen for an identifier wins and rows
    /// without any digits in their identifier are ignored.
    pub fn from_rows(rows: &[FinancialRow], aliases: &ColumnAliases) -> Self {
        let mut index = Self::default();
        for row in rows {
            let operator_id = resolve_operator_id(row, &aliases.operator_id);
            if operator_id.is_empty() || index.by_id.contains_key(&operator_id) {
                continue;
            }
            let text = |names: &[String]| first_value(row, names).unwrap_or_default().to_string();
            let entry = RegistryEntry {
                operator_id: operator_id.clone(),
                legal_name: text(&aliases.legal_name),
                trade_name: text(&aliases.trade_name),
                city: first_value(row, &aliases.city).map(str::to_string),
                state: first_value(row, &aliases.state).map(str::to_string),
            };
            index.by_id.insert(operator_id, index.entries.len());
            index.entries.push(entry);
        }
        index
    }

    pub fn get(&self, operator_id: &str) -> Option<&RegistryEntry> {
        self.by_id.get(operator_id).map(|&slot| &self.entries[slot])
    }

    /// Entries in first-seen order.
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("reading registry {}: {source}", path.display())]
    Registry {
        path: PathBuf,
        #[source]
        source: AdapterError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Enrichment {
    pub records: Vec<EnrichedRecord>,
    /// Orphan rows: financial rows whose identifier is not in the registry.
    pub dropped_rows: usize,
}

/// Left-joins financial rows against the operator registry.
#[derive(Debug, Clone, Default)]
pub struct Enricher {
    parser: CsvParser,
    aliases: ColumnAliases,
}

impl Enricher {
    pub fn new(parser: CsvParser, aliases: ColumnAliases) -> Self {
        Self { parser, aliases }
    }

    pub fn load_registry(&self, registry_path: &Path) -> Result<RegistryIndex, EnrichError> {
        let rows = self
            .parser
            .parse_and_filter(registry_path, [".*"])
            .map_err(|source| EnrichError::Registry {
                path: registry_path.to_path_buf(),
                source,
            })?;
        let index = RegistryIndex::from_rows(&rows, &self.aliases);
        info!(
            registry = %registry_path.display(),
            rows = rows.len(),
            entries = index.len(),
            "registry index built"
        );
        Ok(index)
    }

    pub fn enrich(
        &self,
        financial_rows: &[FinancialRow],
        registry_path: &Path,
    ) -> Result<Enrichment, EnrichError> {
        let index = self.load_registry(registry_path)?;
        Ok(self.enrich_with_index(financial_rows, &index))
    }

    /// Name fields come from the registry entry; account code, value and
    /// period from the financial row.
    pub fn enrich_with_index(
        &self,
        financial_rows: &[FinancialRow],
        index: &RegistryIndex,
    ) -> Enrichment {
        let records: Vec<EnrichedRecord> = financial_rows
            .iter()
            .filter_map(|row| {
                let operator_id = resolve_operator_id(row, &self.aliases.operator_id);
                let entry = index.get(&operator_id)?;
                let text =
                    |names: &[String]| first_value(row, names).unwrap_or_default().to_string();
                Some(EnrichedRecord {
                    operator_id: entry.operator_id.clone(),
                    legal_name: entry.legal_name.clone(),
                    trade_name: entry.trade_name.clone(),
                    account_code: text(&self.aliases.account_code),
                    raw_value: text(&self.aliases.value),
                    period: text(&self.aliases.period),
                })
            })
            .collect();

        let dropped_rows = financial_rows.len() - records.len();
        if dropped_rows > 0 {
            warn!(
                enriched = records.len(),
                dropped = dropped_rows,
                "financial rows without a registry match were dropped"
            );
        } else {
            info!(enriched = records.len(), "all financial rows matched the registry");
        }
        Enrichment {
            records,
            dropped_rows,
        }
    }
}

/// Parse a Brazilian-formatted amount (`1.234,56`) into a decimal.
///
/// Every `.` is a thousands separator and `,` the decimal mark; anything that
/// does not parse afterwards counts as zero.
pub fn parse_brl_amount(raw: &str) -> Decimal {
    let normalized = raw.trim().replace('.', "").replace(',', ".");
    Decimal::from_str(&normalized).unwrap_or(Decimal::ZERO)
}

/// Sums enriched values per (operator, account code).
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator;

impl Aggregator {
    /// One record per distinct (operator, account code), sorted by operator.
    ///
    /// Groups of the same operator keep the order in which they were first
    /// encountered. The group's legal name is the first non-empty one seen.
    pub fn aggregate(&self, records: &[EnrichedRecord]) -> Vec<AggregatedRecord> {
        let mut slots: HashMap<(&str, &str), usize> = HashMap::new();
        let mut groups: Vec<AggregatedRecord> = Vec::new();

        for record in records {
            let key = (record.operator_id.as_str(), record.account_code.as_str());
            let slot = *slots.entry(key).or_insert_with(|| {
                groups.push(AggregatedRecord {
                    operator_id: record.operator_id.clone(),
                    legal_name: String::new(),
                    account_code: record.account_code.clone(),
                    total_value: Decimal::ZERO,
                });
                groups.len() - 1
            });

            let group = &mut groups[slot];
            let amount = parse_brl_amount(&record.raw_value);
            match group.total_value.checked_add(amount) {
                Some(sum) => group.total_value = sum,
                None => warn!(
                    operator_id = %group.operator_id,
                    account_code = %group.account_code,
                    value = %record.raw_value,
                    "total would overflow; value left out of the sum"
                ),
            }
            if group.legal_name.is_empty() && !record.legal_name.is_empty() {
                group.legal_name = record.legal_name.clone();
            }
        }

        groups.sort_by(|a, b| a.operator_id.cmp(&b.operator_id));
        groups
    }
}

/// Open the SQLite store, creating the file and its directory when missing.
///
/// The pool holds a single connection: the importer is the only writer.
pub async fn connect_database(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Transactional bulk writer for the operators and aggregated-expenses tables.
///
/// Each call runs inside one transaction; rows are flushed as multi-row
/// `INSERT` statements of at most `chunk_size` rows. A failing chunk rolls the
/// whole call back.
#[derive(Debug, Clone)]
pub struct Importer {
    pool: SqlitePool,
    chunk_size: usize,
}

impl Importer {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn rows_per_chunk(&self, params_per_row: usize) -> usize {
        self.chunk_size.min(MAX_BIND_PARAMS / params_per_row).max(1)
    }

    /// Insert or refresh operators by identifier; blank identifiers are skipped.
    ///
    /// Returns the number of rows written.
    pub async fn upsert_registry(&self, entries: &[RegistryEntry]) -> Result<usize, sqlx::Error> {
        let rows: Vec<&RegistryEntry> = entries
            .iter()
            .filter(|e| !e.operator_id.trim().is_empty())
            .collect();
        if rows.len() < entries.len() {
            debug!(
                skipped = entries.len() - rows.len(),
                "registry rows without identifier skipped"
            );
        }

        let mut tx = self.pool.begin().await?;
        let result = async {
            for chunk in rows.chunks(self.rows_per_chunk(5)) {
                let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "INSERT INTO operadoras (cnpj, razao_social, nome_fantasia, cidade, uf) ",
                );
                builder.push_values(chunk.iter().copied(), |mut row, entry| {
                    row.push_bind(entry.operator_id.as_str())
                        .push_bind(entry.legal_name.as_str())
                        .push_bind(entry.trade_name.as_str())
                        .push_bind(entry.city.as_deref())
                        .push_bind(entry.state.as_deref());
                });
                builder.push(
                    " ON CONFLICT (cnpj) DO UPDATE SET \
                     razao_social = excluded.razao_social, \
                     nome_fantasia = excluded.nome_fantasia, \
                     cidade = excluded.cidade, \
                     uf = excluded.uf, \
                     updated_at = CURRENT_TIMESTAMP",
                );
                builder.build().execute(&mut *tx).await?;
            }
            Ok::<(), sqlx::Error>(())
        }
        .await;

        finish(tx, result).await?;
        info!(rows = rows.len(), "registry upserted");
        Ok(rows.len())
    }

    /// Write aggregated totals, replacing any existing total for the same
    /// (operator, account code) so re-runs stay idempotent.
    pub async fn import_aggregates(
        &self,
        records: &[AggregatedRecord],
    ) -> Result<usize, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = async {
            for chunk in records.chunks(self.rows_per_chunk(3)) {
                let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                    "INSERT INTO despesas_agregadas (cnpj_operadora, codigo_conta, valor_total) ",
                );
                builder.push_values(chunk, |mut row, record| {
                    row.push_bind(record.operator_id.as_str())
                        .push_bind(record.account_code.as_str())
                        .push_bind(record.total_value.to_string());
                });
                builder.push(
                    " ON CONFLICT (cnpj_operadora, codigo_conta) DO UPDATE SET \
                     valor_total = excluded.valor_total",
                );
                builder.build().execute(&mut *tx).await?;
            }
            Ok::<(), sqlx::Error>(())
        }
        .await;

        finish(tx, result).await?;
        info!(rows = records.len(), "aggregates imported");
        Ok(records.len())
    }
}

async fn finish(
    tx: Transaction<'_, Sqlite>,
    result: Result<(), sqlx::Error>,
) -> Result<(), sqlx::Error> {
    match result {
        Ok(()) => tx.commit().await,
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed after import error");
            }
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub archives: Vec<ArchiveLocation>,
    pub csv_files: usize,
    pub financial_rows: usize,
    pub registry_entries: usize,
    pub enriched_rows: usize,
    pub dropped_rows: usize,
    pub aggregated_rows: usize,
    pub reports_dir: String,
}

/// Discoverer → Fetcher → Parser → Enricher → Aggregator → Importer, one
/// stage after the other.
pub struct IngestPipeline {
    config: IngestConfig,
    http: HttpFetcher,
    parser: CsvParser,
    normalizer: SchemaNormalizer,
    enricher: Enricher,
    aggregator: Aggregator,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            connect_timeout: Duration::from_secs(config.http_connect_timeout_secs),
            read_timeout: Duration::from_secs(config.http_read_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let parser = CsvParser::new();
        Ok(Self {
            config,
            http,
            enricher: Enricher::new(parser.clone(), ColumnAliases::default()),
            parser,
            normalizer: SchemaNormalizer::default(),
            aggregator: Aggregator,
        })
    }

    /// Replace the header alias table and the enrichment column aliases.
    pub fn with_schema(mut self, normalizer: SchemaNormalizer, aliases: ColumnAliases) -> Self {
        self.normalizer = normalizer;
        self.enricher = Enricher::new(self.parser.clone(), aliases);
        self
    }

    pub async fn discover(&self, quarters: usize) -> Result<Vec<ArchiveLocation>> {
        Discoverer::new(&self.http, self.config.base_url.as_str())
            .find_recent_periods(quarters)
            .await
            .with_context(|| format!("discovering archives under {}", self.config.base_url))
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, quarters = self.config.quarters, "ingest run started");

        let archives = self.discover(self.config.quarters).await?;
        if archives.is_empty() {
            anyhow::bail!("no quarterly archive published under {}", self.config.base_url);
        }

        let mut csv_files = 0usize;
        let mut financial_rows = Vec::new();
        for archive in &archives {
            let files = self.fetch_archive(archive).await?;
            csv_files += files.len();
            for file in files {
                let rows = self
                    .parser
                    .parse_and_filter(&file, &self.config.row_patterns)
                    .with_context(|| format!("parsing {}", file.display()))?;
                for row in rows {
                    let mut row = self
                        .normalizer
                        .normalize_row(row, self.config.strict_headers)
                        .with_context(|| format!("normalizing headers of {}", file.display()))?;
                    row.insert(PERIOD_COLUMN.to_string(), archive.period.clone());
                    financial_rows.push(row);
                }
            }
        }
        info!(csv_files, rows = financial_rows.len(), "financial rows parsed");

        let registry_path = self.fetch_registry().await?;
        let (index, enrichment) = info_span!("enrich").in_scope(|| {
            let index = self.enricher.load_registry(&registry_path)?;
            let enrichment = self.enricher.enrich_with_index(&financial_rows, &index);
            Ok::<_, EnrichError>((index, enrichment))
        })?;
        let aggregated =
            info_span!("aggregate").in_scope(|| self.aggregator.aggregate(&enrichment.records));
        info!(groups = aggregated.len(), "aggregation finished");

        let pool = connect_database(&self.config.database_url)
            .await
            .with_context(|| format!("connecting to {}", self.config.database_url))?;
        MIGRATOR.run(&pool).await.context("applying migrations")?;
        let importer = Importer::new(pool.clone()).with_chunk_size(self.config.import_chunk_size);
        importer
            .upsert_registry(index.entries())
            .await
            .context("upserting operator registry")?;
        importer
            .import_aggregates(&aggregated)
            .await
            .context("importing aggregated expenses")?;
        pool.close().await;

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            archives,
            csv_files,
            financial_rows: financial_rows.len(),
            registry_entries: index.len(),
            enriched_rows: enrichment.records.len(),
            dropped_rows: enrichment.dropped_rows,
            aggregated_rows: aggregated.len(),
            reports_dir: reports_dir.display().to_string(),
        };
        write_reports(&reports_dir, &enrichment.records, &summary).await?;

        info!(%run_id, aggregated = summary.aggregated_rows, "ingest run finished");
        Ok(summary)
    }

    /// Download one quarter archive, extract it, and list its CSV files.
    #[instrument(skip(self, archive), fields(period = %archive.period))]
    async fn fetch_archive(&self, archive: &ArchiveLocation) -> Result<Vec<PathBuf>> {
        let period_dir = self.config.download_dir.join(&archive.period);
        let archive_path = period_dir.join(file_name_from_url(&archive.url, "archive.zip"));
        self.http
            .download(&archive.url, &archive_path)
            .await
            .with_context(|| format!("downloading {}", archive.url))?;

        // Start from an empty directory: files left by an earlier archive of
        // the same quarter must not be parsed again.
        let extract_dir = self.config.download_dir.join("extracted").join(&archive.period);
        match fs::remove_dir_all(&extract_dir).await {
            Ok(()) => debug!(dir = %extract_dir.display(), "stale extraction removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("clearing {}", extract_dir.display()))
            }
        }

        let files = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            extract_archive(&archive_path, &extract_dir)
                .with_context(|| format!("extracting {}", archive_path.display()))?;
            collect_csv_files(&extract_dir)
        })
        .await
        .context("extraction task failed")??;
        if files.is_empty() {
            warn!(archive = %archive.url, "archive contains no csv file");
        }
        Ok(files)
    }

    #[instrument(skip(self))]
    async fn fetch_registry(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.registry_path {
            return Ok(path.clone());
        }
        let path = self
            .config
            .download_dir
            .join("registry")
            .join(file_name_from_url(&self.config.registry_url, "registry.csv"));
        self.http
            .download(&self.config.registry_url, &path)
            .await
            .with_context(|| format!("downloading registry {}", self.config.registry_url))?;
        Ok(path)
    }
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    IngestPipeline::new(IngestConfig::from_env())?.run_once().await
}

/// Apply pending migrations to `DATABASE_URL` without ingesting anything.
pub async fn migrate_from_env() -> Result<()> {
    let config = IngestConfig::from_env();
    let pool = connect_database(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    MIGRATOR.run(&pool).await.context("applying migrations")?;
    pool.close().await;
    info!(database = %config.database_url, "migrations applied");
    Ok(())
}

fn file_name_from_url(url: &str, fallback: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Every `*.csv` below `dir`, in sorted path order.
fn collect_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pending = vec![dir.to_path_buf()];
    let mut found = Vec::new();
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current)
            .with_context(|| format!("reading {}", current.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("reading {}", current.display()))?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

async fn write_reports(
    reports_dir: &Path,
    records: &[EnrichedRecord],
    summary: &IngestRunSummary,
) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let csv_path = reports_dir.join("enriched.csv");
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_path(&csv_path)
        .with_context(|| format!("creating {}", csv_path.display()))?;
    writer.write_record([
        "CNPJ",
        "RAZAO_SOCIAL",
        "NOME_FANTASIA",
        "CODIGO_CONTA",
        "VALOR",
        "DATA",
    ])?;
    for record in records {
        writer.write_record([
            &record.operator_id,
            &record.legal_name,
            &record.trade_name,
            &record.account_code,
            &record.raw_value,
            &record.period,
        ])?;
    }
    writer
        .flush()
        .with_context(|| format!("writing {}", csv_path.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), summary_json)
        .await
        .context("writing summary.json")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn row(cells: &[(&str, &str)]) -> FinancialRow {
        cells
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn enriched(operator_id: &str, account_code: &str, raw_value: &str) -> EnrichedRecord {
        EnrichedRecord {
            operator_id: operator_id.to_string(),
            legal_name: format!("OPERADORA {operator_id}"),
            trade_name: String::new(),
            account_code: account_code.to_string(),
            raw_value: raw_value.to_string(),
            period: "2024-10-01".to_string(),
        }
    }

    fn registry_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write registry");
        file
    }

    fn total(records: &[AggregatedRecord], operator_id: &str, account_code: &str) -> Decimal {
        records
            .iter()
            .find(|r| r.operator_id == operator_id && r.account_code == account_code)
            .map(|r| r.total_value)
            .expect("group present")
    }

    #[test]
    fn formatted_and_bare_identifiers_join() {
        let registry = registry_file(
            "CNPJ;RAZAO_SOCIAL;NOME_FANTASIA;CIDADE;UF\n\
             12.345.678/0001-99;OPERADORA EXEMPLO S.A.;EXEMPLO SAUDE;Recife;PE\n",
        );
        let rows = vec![row(&[
            ("CNPJ", "12345678000199"),
            ("CD_CONTA_CONTABIL", "411"),
            ("VL_SALDO_FINAL", "10,00"),
            ("DATA", "2024-10-01"),
        ])];

        let enrichment = Enricher::default()
            .enrich(&rows, registry.path())
            .expect("enrich");

        assert_eq!(enrichment.dropped_rows, 0);
        assert_eq!(
            enrichment.records,
            vec![EnrichedRecord {
                operator_id: "12345678000199".into(),
                legal_name: "OPERADORA EXEMPLO S.A.".into(),
                trade_name: "EXEMPLO SAUDE".into(),
                account_code: "411".into(),
                raw_value: "10,00".into(),
                period: "2024-10-01".into(),
            }]
        );
    }

    #[test]
    fn orphan_rows_are_dropped_and_counted() {
        let registry = registry_file("REG_ANS;RAZAO_SOCIAL;NOME_FANTASIA\n419761;OPERADORA A;A\n");
        let rows = vec![
            row(&[("REG_ANS", "419761"), ("CD_CONTA_CONTABIL", "411"), ("VL_SALDO_FINAL", "1,00")]),
            row(&[("REG_ANS", "000001"), ("CD_CONTA_CONTABIL", "411"), ("VL_SALDO_FINAL", "2,00")]),
        ];

        let enrichment = Enricher::default()
            .enrich(&rows, registry.path())
            .expect("enrich");

        assert_eq!(enrichment.records.len(), 1);
        assert_eq!(enrichment.dropped_rows, 1);
        assert_eq!(enrichment.records[0].operator_id, "419761");
    }

    #[test]
    fn registry_names_win_over_financial_row_names() {
        let registry = registry_file(
            "REG_ANS;RAZAO_SOCIAL;NOME_FANTASIA\n419761;NOME CADASTRAL;FANTASIA\n",
        );
        let rows = vec![row(&[
            ("REGISTRO_ANS", "419761"),
            ("RAZAO_SOCIAL", "NOME NO DEMONSTRATIVO"),
            ("CODIGO_CONTA", "311"),
            ("VALOR", "5,00"),
            (PERIOD_COLUMN, "4T2024"),
        ])];

        let enrichment = Enricher::default()
            .enrich(&rows, registry.path())
            .expect("enrich");

        let record = &enrichment.records[0];
        assert_eq!(record.legal_name, "NOME CADASTRAL");
        assert_eq!(record.trade_name, "FANTASIA");
        assert_eq!(record.account_code, "311");
        assert_eq!(record.raw_value, "5,00");
        assert_eq!(record.period, "4T2024");
    }

    #[test]
    fn first_registry_row_wins_on_duplicate_identifier() {
        let rows = vec![
            row(&[("CNPJ", "11.111.111/0001-11"), ("RAZAO_SOCIAL", "PRIMEIRA")]),
            row(&[("CNPJ", "11111111000111"), ("RAZAO_SOCIAL", "SEGUNDA")]),
            row(&[("CNPJ", "-"), ("RAZAO_SOCIAL", "SEM IDENTIFICADOR")]),
        ];

        let index = RegistryIndex::from_rows(&rows, &ColumnAliases::default());

        assert_eq!(index.len(), 1);
        assert_eq!(index.get("11111111000111").unwrap().legal_name, "PRIMEIRA");
        assert_eq!(index.get("11111111000111").unwrap().city, None);
    }

    #[test]
    fn missing_registry_file_is_reported() {
        let err = Enricher::default()
            .enrich(&[], Path::new("/no/such/registry.csv"))
            .expect_err("missing registry");
        assert!(matches!(
            err,
            EnrichError::Registry { source: AdapterError::InvalidArgument(_), .. }
        ));
    }

    #[test]
    fn brazilian_amounts_parse_and_garbage_is_zero() {
        assert_eq!(parse_brl_amount("1.000,00"), Decimal::new(100000, 2));
        assert_eq!(parse_brl_amount("500,50"), Decimal::new(50050, 2));
        assert_eq!(parse_brl_amount("-1.234.567,89"), Decimal::new(-123456789, 2));
        assert_eq!(parse_brl_amount(" 42 "), Decimal::new(42, 0));
        assert_eq!(parse_brl_amount(""), Decimal::ZERO);
        assert_eq!(parse_brl_amount("n/d"), Decimal::ZERO);
        assert_eq!(parse_brl_amount("1,2,3"), Decimal::ZERO);
    }

    #[test]
    fn aggregation_sums_groups_in_operator_order() {
        let records = vec![
            enriched("12345678", "3111", "1.000,00"),
            enriched("87654321", "3111", "300,00"),
            enriched("12345678", "3111", "500,50"),
        ];

        let aggregated = Aggregator.aggregate(&records);

        assert_eq!(
            aggregated,
            vec![
                AggregatedRecord {
                    operator_id: "12345678".into(),
                    legal_name: "OPERADORA 12345678".into(),
                    account_code: "3111".into(),
                    total_value: Decimal::new(150050, 2),
                },
                AggregatedRecord {
                    operator_id: "87654321".into(),
                    legal_name: "OPERADORA 87654321".into(),
                    account_code: "3111".into(),
                    total_value: Decimal::new(30000, 2),
                },
            ]
        );
    }

    #[test]
    fn empty_input_aggregates_to_nothing() {
        assert!(Aggregator.aggregate(&[]).is_empty());
    }

    #[test]
    fn unparseable_values_count_as_zero_without_changing_groups() {
        let records = vec![
            enriched("1", "411", "10,00"),
            enriched("1", "411", "n/a"),
            enriched("1", "411", ""),
            enriched("2", "411", "???"),
        ];

        let aggregated = Aggregator.aggregate(&records);

        assert_eq!(aggregated.len(), 2);
        assert_eq!(total(&aggregated, "1", "411"), Decimal::new(1000, 2));
        assert_eq!(total(&aggregated, "2", "411"), Decimal::ZERO);
    }

    #[test]
    fn overflowing_sum_keeps_the_group_without_panicking() {
        let largest = "79.228.162.514.264.337.593.543.950.335";
        let records = vec![
            enriched("1", "411", largest),
            enriched("1", "411", largest),
            enriched("1", "411", "1,00"),
            enriched("2", "411", "5,00"),
        ];

        let aggregated = Aggregator.aggregate(&records);

        assert_eq!(aggregated.len(), 2);
        assert_eq!(total(&aggregated, "1", "411"), Decimal::MAX);
        assert_eq!(total(&aggregated, "2", "411"), Decimal::new(500, 2));
    }

    #[test]
    fn totals_and_ordering_survive_input_permutations() {
        let base = vec![
            enriched("30", "411", "0,10"),
            enriched("10", "411", "0,20"),
            enriched("20", "311", "1.234,56"),
            enriched("10", "311", "0,30"),
            enriched("30", "411", "0,70"),
            enriched("20", "311", "-34,56"),
            enriched("10", "411", "9.999.999,99"),
        ];
        let reference = Aggregator.aggregate(&base);
        let distinct: std::collections::HashSet<_> = base
            .iter()
            .map(|r| (r.operator_id.clone(), r.account_code.clone()))
            .collect();
        assert_eq!(reference.len(), distinct.len());

        for shift in 0..base.len() {
            let mut permuted = base.clone();
            permuted.rotate_left(shift);
            if shift % 2 == 1 {
                permuted.reverse();
            }

            let aggregated = Aggregator.aggregate(&permuted);

            assert_eq!(aggregated.len(), reference.len());
            assert!(aggregated
                .windows(2)
                .all(|pair| pair[0].operator_id <= pair[1].operator_id));
            for group in &reference {
                assert_eq!(
                    total(&aggregated, &group.operator_id, &group.account_code),
                    group.total_value
                );
            }
        }
        assert_eq!(total(&reference, "20", "311"), Decimal::new(120000, 2));
    }

    #[test]
    fn first_non_empty_legal_name_is_kept() {
        let mut unnamed = enriched("1", "411", "1,00");
        unnamed.legal_name.clear();
        let records = vec![unnamed, enriched("1", "411", "2,00")];

        let aggregated = Aggregator.aggregate(&records);

        assert_eq!(aggregated[0].legal_name, "OPERADORA 1");
    }

    async fn memory_importer(chunk_size: usize) -> (SqlitePool, Importer) {
        let pool = connect_database("sqlite::memory:").await.expect("pool");
        MIGRATOR.run(&pool).await.expect("migrate");
        let importer = Importer::new(pool.clone()).with_chunk_size(chunk_size);
        (pool, importer)
    }

    async fn count(pool: &SqlitePool, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .expect("count")
    }

    fn entry(operator_id: &str, legal_name: &str) -> RegistryEntry {
        RegistryEntry {
            operator_id: operator_id.to_string(),
            legal_name: legal_name.to_string(),
            trade_name: format!("{legal_name} FANTASIA"),
            city: Some("Recife".into()),
            state: Some("PE".into()),
        }
    }

    fn aggregate(operator_id: &str, account_code: &str, cents: i64) -> AggregatedRecord {
        AggregatedRecord {
            operator_id: operator_id.to_string(),
            legal_name: String::new(),
            account_code: account_code.to_string(),
            total_value: Decimal::new(cents, 2),
        }
    }

    #[tokio::test]
    async fn registry_upsert_is_idempotent_and_skips_blank_ids() {
        let (pool, importer) = memory_importer(DEFAULT_CHUNK_SIZE).await;

        let written = importer
            .upsert_registry(&[
                entry("123", "OPERADORA A"),
                entry("456", "OPERADORA B"),
                entry("  ", "SEM ID"),
            ])
            .await
            .expect("first upsert");
        assert_eq!(written, 2);

        importer
            .upsert_registry(&[entry("123", "OPERADORA A RENOMEADA")])
            .await
            .expect("second upsert");

        assert_eq!(count(&pool, "operadoras").await, 2);
        let name: String =
            sqlx::query_scalar("SELECT razao_social FROM operadoras WHERE cnpj = '123'")
                .fetch_one(&pool)
                .await
                .expect("name");
        assert_eq!(name, "OPERADORA A RENOMEADA");
    }

    #[tokio::test]
    async fn aggregates_import_across_several_chunks() {
        let (pool, importer) = memory_importer(1000).await;
        let records: Vec<_> = (0..2500)
            .map(|i| aggregate(&format!("{i:06}"), "411", i * 100))
            .collect();

        let written = importer.import_aggregates(&records).await.expect("import");

        assert_eq!(written, 2500);
        assert_eq!(count(&pool, "despesas_agregadas").await, 2500);
    }

    #[tokio::test]
    async fn reimport_merges_by_operator_and_account() {
        let (pool, importer) = memory_importer(2).await;
        importer
            .import_aggregates(&[aggregate("1", "411", 100050), aggregate("2", "411", 200000)])
            .await
            .expect("first import");

        importer
            .import_aggregates(&[aggregate("1", "411", 150050), aggregate("1", "311", 99)])
            .await
            .expect("second import");

        assert_eq!(count(&pool, "despesas_agregadas").await, 3);
        let total: f64 = sqlx::query_scalar(
            "SELECT CAST(valor_total AS REAL) FROM despesas_agregadas \
             WHERE cnpj_operadora = '1' AND codigo_conta = '411'",
        )
        .fetch_one(&pool)
        .await
        .expect("total");
        assert!((total - 1500.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failing_chunk_rolls_back_the_whole_call() {
        let (pool, importer) = memory_importer(1000).await;
        let mut records: Vec<_> = (0..1500)
            .map(|i| aggregate(&format!("{i:06}"), "411", i))
            .collect();
        records.push(aggregate("", "411", 1));

        let err = importer
            .import_aggregates(&records)
            .await
            .expect_err("blank operator violates the table check");

        assert!(matches!(err, sqlx::Error::Database(_)));
        assert_eq!(count(&pool, "despesas_agregadas").await, 0);
    }

    #[test]
    fn file_names_are_taken_from_the_last_url_segment() {
        assert_eq!(
            file_name_from_url("https://h/pda/2024/4T2024/4T2024.zip?x=1", "archive.zip"),
            "4T2024.zip"
        );
        assert_eq!(file_name_from_url("https://h/pda/", "archive.zip"), "archive.zip");
    }
}
