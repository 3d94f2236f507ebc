//! Persistence for parsed reports.
//!
//! The store keeps one summary row per report plus the retained class rows.
//! Reading the history only touches summary rows, so those aggregates carry
//! their stored totals instead of class data.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::{debug, info};

use crate::error::{CovsplitError, Result};
use crate::model::{ClassRecord, CoverageMetric, PackageSummary, ReportAggregate, SummaryMetrics};

pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = include_str!("../schema.sql");

/// Class rows written per batch between progress updates.
const BATCH_SIZE: usize = 100;

/// Persistence operations the service layer needs.
pub trait ReportStore {
    /// Save a report, replacing any report uploaded on the same local
    /// calendar day. `progress` receives the percentage of class rows
    /// written. Returns the new report id.
    fn save(&mut self, report: &ReportAggregate, progress: &mut dyn FnMut(u32)) -> Result<i64>;

    /// Load a report with its stored class detail.
    fn get_by_id(&self, id: i64) -> Result<Option<ReportAggregate>>;

    /// All reports, newest first, as summary-only aggregates.
    fn get_all(&self) -> Result<Vec<ReportAggregate>>;

    /// Delete a report and its class rows.
    fn delete(&mut self, id: i64) -> Result<()>;
}

/// SQLite-backed [`ReportStore`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }
}

/// Ensure the schema is initialized. Safe to call on an already-initialized DB.
fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) if v > SCHEMA_VERSION => {
            return Err(CovsplitError::Other(format!(
                "Database schema version {} is newer than this binary supports ({}). \
                 Please upgrade covsplit.",
                v, SCHEMA_VERSION
            )));
        }
        Some(v) => {
            return Err(CovsplitError::Other(format!(
                "No migration path from schema version {} to {}. \
                 Consider deleting the database and uploading again.",
                v, SCHEMA_VERSION
            )));
        }
    }
    Ok(())
}

impl ReportStore for SqliteStore {
    fn save(&mut self, report: &ReportAggregate, progress: &mut dyn FnMut(u32)) -> Result<i64> {
        let tx = self.conn.transaction()?;

        let upload_day = report.uploaded_at.date_naive().to_string();
        let replaced = tx.execute(
            "DELETE FROM report WHERE upload_day = ?1",
            params![upload_day],
        )?;
        if replaced > 0 {
            info!(day = %upload_day, replaced, "replacing earlier report for the same day");
        }

        let report_id = insert_report_row(&tx, report, &upload_day)?;
        let written = insert_class_rows(&tx, report_id, report, progress)?;

        tx.commit()?;
        debug!(report_id, classes = written, "saved report");
        Ok(report_id)
    }

    fn get_by_id(&self, id: i64) -> Result<Option<ReportAggregate>> {
        let stored = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_REPORT),
                params![id],
                StoredReport::from_row,
            )
            .optional()?;
        let Some(stored) = stored else {
            return Ok(None);
        };

        let packages = load_packages(&self.conn, id, &stored.exclusion_pattern)?;
        if packages.is_empty() {
            return stored.into_summary().map(Some);
        }

        let mut report = stored.into_empty_aggregate()?;
        for package in packages {
            report.add_package(package);
        }
        Ok(Some(report))
    }

    fn get_all(&self) -> Result<Vec<ReportAggregate>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} ORDER BY uploaded_at DESC, id DESC",
            SELECT_REPORT
        ))?;
        let rows = stmt.query_map([], StoredReport::from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?.into_summary()?);
        }
        Ok(result)
    }

    fn delete(&mut self, id: i64) -> Result<()> {
        // Class rows go with it via ON DELETE CASCADE.
        let deleted = self
            .conn
            .execute("DELETE FROM report WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(CovsplitError::ReportNotFound(id));
        }
        debug!(report_id = id, "deleted report");
        Ok(())
    }
}

fn insert_report_row(tx: &Transaction, report: &ReportAggregate, upload_day: &str) -> Result<i64> {
    let metrics = report.summary_metrics();
    let branches = report.total_branch_metrics();
    tx.execute(
        "INSERT INTO report (
             uploaded_at, upload_day, file_size_bytes, parse_duration_ms, exclusion_pattern,
             lines_covered, lines_total, core_lines_covered, core_lines_total,
             excluded_lines_covered, excluded_lines_total, branches_covered, branches_total,
             line_rate, core_line_rate, excluded_line_rate
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            report.uploaded_at.to_rfc3339(),
            upload_day,
            sql_count(report.file_size_bytes),
            sql_count(report.parse_duration_ms),
            report.exclusion_pattern,
            sql_count(metrics.total.covered),
            sql_count(metrics.total.total),
            sql_count(metrics.core.covered),
            sql_count(metrics.core.total),
            sql_count(metrics.excluded.covered),
            sql_count(metrics.excluded.total),
            sql_count(branches.covered),
            sql_count(branches.total),
            metrics.total.rate(),
            metrics.core.rate(),
            metrics.excluded.rate(),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Write every retained class in batches. Returns the number of rows written.
fn insert_class_rows(
    tx: &Transaction,
    report_id: i64,
    report: &ReportAggregate,
    progress: &mut dyn FnMut(u32),
) -> Result<usize> {
    let retained: Vec<(&str, &ClassRecord)> = report
        .packages()
        .iter()
        .flat_map(|p| {
            p.classes
                .iter()
                .filter(|c| c.retained)
                .map(move |c| (p.name.as_str(), c))
        })
        .collect();

    let total = retained.len();
    if total == 0 {
        progress(100);
        return Ok(0);
    }

    let mut stmt = tx.prepare_cached(
        "INSERT INTO class_detail (
             report_id, package_name, class_name, lines_covered, lines_total,
             branches_covered, branches_total, line_rate, complexity
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    let mut written = 0;
    for batch in retained.chunks(BATCH_SIZE) {
        for (package_name, class) in batch {
            stmt.execute(params![
                report_id,
                package_name,
                class.full_name,
                sql_count(class.line_metric.covered),
                sql_count(class.line_metric.total),
                sql_count(class.branch_metric.covered),
                sql_count(class.branch_metric.total),
                class.line_metric.rate(),
                class.complexity,
            ])?;
        }
        written += batch.len();
        progress((written * 100 / total) as u32);
    }
    Ok(written)
}

/// Counters above the INTEGER range are stored clamped.
fn sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Rebuild packages from class rows, in the order they were saved.
fn load_packages(
    conn: &Connection,
    report_id: i64,
    exclusion_pattern: &str,
) -> Result<Vec<PackageSummary>> {
    let mut stmt = conn.prepare(
        "SELECT package_name, class_name, lines_covered, lines_total,
                branches_covered, branches_total, complexity
         FROM class_detail
         WHERE report_id = ?1
         ORDER BY id",
    )?;
    let rows = stmt.query_map(params![report_id], |row| {
        let package_name: String = row.get(0)?;
        let class = ClassRecord::new(
            row.get::<_, String>(1)?,
            CoverageMetric::new(row.get(2)?, row.get(3)?),
            CoverageMetric::new(row.get(4)?, row.get(5)?),
            row.get(6)?,
            exclusion_pattern,
        );
        Ok((package_name, class))
    })?;

    let mut packages: Vec<PackageSummary> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let (package_name, class) = row?;
        let idx = match index.get(&package_name) {
            Some(&idx) => idx,
            None => {
                packages.push(PackageSummary::new(package_name.clone()));
                index.insert(package_name, packages.len() - 1);
                packages.len() - 1
            }
        };
        packages[idx].add_class(class);
    }
    Ok(packages)
}

const SELECT_REPORT: &str = "SELECT id, uploaded_at, file_size_bytes, parse_duration_ms,
        exclusion_pattern, lines_covered, lines_total, core_lines_covered, core_lines_total,
        excluded_lines_covered, excluded_lines_total
 FROM report";

/// A `report` row as read back from SQLite.
struct StoredReport {
    id: i64,
    uploaded_at: String,
    file_size_bytes: u64,
    parse_duration_ms: u64,
    exclusion_pattern: String,
    metrics: SummaryMetrics,
}

impl StoredReport {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uploaded_at: row.get(1)?,
            file_size_bytes: row.get(2)?,
            parse_duration_ms: row.get(3)?,
            exclusion_pattern: row.get(4)?,
            metrics: SummaryMetrics {
                total: CoverageMetric::new(row.get(5)?, row.get(6)?),
                core: CoverageMetric::new(row.get(7)?, row.get(8)?),
                excluded: CoverageMetric::new(row.get(9)?, row.get(10)?),
            },
        })
    }

    fn uploaded_at(&self) -> Result<DateTime<Local>> {
        DateTime::parse_from_rfc3339(&self.uploaded_at)
            .map(|t| t.with_timezone(&Local))
            .map_err(|e| {
                CovsplitError::Other(format!(
                    "Report {} has an invalid timestamp '{}': {}",
                    self.id, self.uploaded_at, e
                ))
            })
    }

    fn into_summary(self) -> Result<ReportAggregate> {
        let mut report = ReportAggregate::from_summary(
            self.uploaded_at()?,
            self.file_size_bytes,
            self.exclusion_pattern,
            self.metrics,
        )
        .with_id(self.id);
        report.parse_duration_ms = self.parse_duration_ms;
        Ok(report)
    }

    fn into_empty_aggregate(self) -> Result<ReportAggregate> {
        let mut report =
            ReportAggregate::new(self.uploaded_at()?, self.file_size_bytes, self.exclusion_pattern)
                .with_id(self.id);
        report.parse_duration_ms = self.parse_duration_ms;
        Ok(report)
    }
}
