//! Command handler functions for the covsplit CLI.
//!
//! Each `cmd_*` function returns its output as a `String`, making them easy
//! to test without capturing stdout.

use std::fmt::Write;

use anyhow::Result;
use serde::Serialize;

use crate::error::CovsplitError;
use crate::model::{CoverageMetric, PackageSummary, ReportAggregate};
use crate::parsers::cobertura::CoberturaParser;
use crate::parsers::ReportParser;
use crate::service::CoverageService;
use crate::store::ReportStore;

pub fn cmd_upload<S: ReportStore>(
    service: &mut CoverageService<S>,
    document: &str,
    exclusion_pattern: &str,
    parse_progress: &mut dyn FnMut(f64),
    save_progress: &mut dyn FnMut(u32),
) -> Result<String> {
    let report = service.upload(document, exclusion_pattern, parse_progress, save_progress)?;
    Ok(format_summary(&report))
}

pub fn cmd_parse(
    document: &str,
    exclusion_pattern: &str,
    json: bool,
    progress: &mut dyn FnMut(f64),
) -> Result<String> {
    let report = CoberturaParser::new(exclusion_pattern).parse_with_progress(document, progress)?;
    if json {
        return to_json(&ReportJson::new(&report));
    }
    let mut out = format_summary(&report);
    out.push('\n');
    out.push_str(&format_packages(report.packages(), false));
    Ok(out)
}

pub fn cmd_history<S: ReportStore>(service: &CoverageService<S>, json: bool) -> Result<String> {
    let reports = service.history()?;
    if json {
        let rows: Vec<ReportJson> = reports.iter().map(ReportJson::new).collect();
        return to_json(&rows);
    }
    if reports.is_empty() {
        return Ok("No reports in database.\n".to_string());
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:>5}  {:<20} {:>16} {:>16} {:>16}",
        "ID", "UPLOADED", "TOTAL", "CORE", "EXCLUDED"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(78)).unwrap();
    for r in &reports {
        writeln!(
            out,
            "{:>5}  {:<20} {:>16} {:>16} {:>16}",
            r.id.unwrap_or_default(),
            r.uploaded_at.format("%Y-%m-%d %H:%M:%S"),
            format_metric(r.total_metrics()),
            format_metric(r.core_metrics()),
            format_metric(r.excluded_metrics()),
        )
        .unwrap();
    }
    Ok(out)
}

pub fn cmd_show<S: ReportStore>(
    service: &CoverageService<S>,
    id: i64,
    exclusion_pattern: Option<&str>,
    sort_by_coverage: bool,
    json: bool,
) -> Result<String> {
    let mut report = service
        .details(id)?
        .ok_or(CovsplitError::ReportNotFound(id))?;
    if let Some(pattern) = exclusion_pattern {
        report = report.with_exclusion_pattern(pattern);
    }

    if json {
        return to_json(&ReportJson::new(&report));
    }

    let mut out = format_summary(&report);
    out.push('\n');
    if report.packages().is_empty() {
        out.push_str("No class detail stored for this report.\n");
    } else {
        out.push_str(&format_packages(report.packages(), sort_by_coverage));
    }
    Ok(out)
}

pub fn cmd_delete<S: ReportStore>(service: &mut CoverageService<S>, id: i64) -> Result<String> {
    service.delete(id)?;
    Ok(format!("Deleted report {}\n", id))
}

fn format_metric(metric: CoverageMetric) -> String {
    format!(
        "{}/{} ({:.1}%)",
        metric.covered,
        metric.total,
        metric.rate() * 100.0
    )
}

fn format_summary(report: &ReportAggregate) -> String {
    let mut out = String::new();
    match report.id {
        Some(id) => writeln!(out, "Report:     {}", id).unwrap(),
        None => writeln!(out, "Report:     (not saved)").unwrap(),
    }
    writeln!(
        out,
        "Uploaded:   {}",
        report.uploaded_at.format("%Y-%m-%d %H:%M:%S")
    )
    .unwrap();
    writeln!(out, "Pattern:    {:?}", report.exclusion_pattern).unwrap();
    if !report.packages().is_empty() {
        writeln!(
            out,
            "Packages:   {} ({} classes)",
            report.packages().len(),
            report.class_count()
        )
        .unwrap();
    }
    writeln!(out, "Lines:      {}", format_metric(report.total_metrics())).unwrap();
    writeln!(out, "Core:       {}", format_metric(report.core_metrics())).unwrap();
    writeln!(out, "Excluded:   {}", format_metric(report.excluded_metrics())).unwrap();
    let branches = report.total_branch_metrics();
    if branches.total > 0 {
        writeln!(out, "Branches:   {}", format_metric(branches)).unwrap();
    }
    writeln!(
        out,
        "Source:     {} bytes, parsed in {} ms",
        report.file_size_bytes, report.parse_duration_ms
    )
    .unwrap();
    out
}

fn format_packages(packages: &[PackageSummary], sort_by_coverage: bool) -> String {
    let mut rows: Vec<&PackageSummary> = packages.iter().collect();
    if sort_by_coverage {
        rows.sort_by(|a, b| {
            a.total_line_coverage()
                .rate()
                .total_cmp(&b.total_line_coverage().rate())
        });
    }

    let mut out = String::new();
    writeln!(
        out,
        "{:<50} {:>8} {:>8} {:>8} {:>8} {:>9}",
        "PACKAGE", "CLASSES", "LINES", "COVERED", "RATE", "EXCLUDED"
    )
    .unwrap();
    writeln!(out, "{}", "-".repeat(96)).unwrap();
    for p in rows {
        let lines = p.total_line_coverage();
        writeln!(
            out,
            "{:<50} {:>8} {:>8} {:>8} {:>7.1}% {:>9}",
            p.name,
            p.classes.len(),
            lines.total,
            lines.covered,
            lines.rate() * 100.0,
            p.classes.iter().filter(|c| c.excluded).count(),
        )
        .unwrap();
    }
    out
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut out = serde_json::to_string_pretty(value)?;
    out.push('\n');
    Ok(out)
}

/// JSON shape of a report: stored fields plus the derived totals.
#[derive(Serialize)]
struct ReportJson<'a> {
    id: Option<i64>,
    uploaded_at: String,
    file_size_bytes: u64,
    parse_duration_ms: u64,
    exclusion_pattern: &'a str,
    total: CoverageMetric,
    core: CoverageMetric,
    excluded: CoverageMetric,
    branches: CoverageMetric,
    packages: &'a [PackageSummary],
}

impl<'a> ReportJson<'a> {
    fn new(report: &'a ReportAggregate) -> Self {
        Self {
            id: report.id,
            uploaded_at: report.uploaded_at.to_rfc3339(),
            file_size_bytes: report.file_size_bytes,
            parse_duration_ms: report.parse_duration_ms,
            exclusion_pattern: &report.exclusion_pattern,
            total: report.total_metrics(),
            core: report.core_metrics(),
            excluded: report.excluded_metrics(),
            branches: report.total_branch_metrics(),
            packages: report.packages(),
        }
    }
}
