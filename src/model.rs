//! In-memory representation of a parsed coverage report. The parser produces
//! a `ReportAggregate`; the store persists it and rebuilds it on read.

use std::iter::Sum;
use std::ops::Add;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::classify::is_excluded;

/// Compute a coverage rate, returning 0.0 when the total is zero.
#[must_use]
pub fn rate(covered: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64
    }
}

/// A covered/total counter pair. `covered <= total` is expected but not
/// enforced; values from the source document are carried as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct CoverageMetric {
    pub covered: u64,
    pub total: u64,
}

impl CoverageMetric {
    pub const EMPTY: CoverageMetric = CoverageMetric {
        covered: 0,
        total: 0,
    };

    #[must_use]
    pub const fn new(covered: u64, total: u64) -> Self {
        Self { covered, total }
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        rate(self.covered, self.total)
    }
}

/// Largest counter value; sums clamp here so they still fit an SQLite INTEGER.
pub const MAX_COUNT: u64 = i64::MAX as u64;

impl Add for CoverageMetric {
    type Output = CoverageMetric;

    fn add(self, rhs: CoverageMetric) -> CoverageMetric {
        CoverageMetric {
            covered: self.covered.saturating_add(rhs.covered).min(MAX_COUNT),
            total: self.total.saturating_add(rhs.total).min(MAX_COUNT),
        }
    }
}

impl Sum for CoverageMetric {
    fn sum<I: Iterator<Item = CoverageMetric>>(iter: I) -> Self {
        iter.fold(CoverageMetric::EMPTY, Add::add)
    }
}

/// One `<class>` element after counter extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassRecord {
    /// Last `.`-segment of `full_name`.
    pub name: String,
    pub full_name: String,
    pub line_metric: CoverageMetric,
    pub branch_metric: CoverageMetric,
    pub complexity: f64,
    /// Tagged with the pattern the record was built with. Report-level
    /// metrics classify against the report's current pattern instead.
    pub excluded: bool,
    /// Whether the store keeps this class when the report is saved.
    pub retained: bool,
}

impl ClassRecord {
    /// Build a record, deriving the simple name and tagging it against
    /// `exclusion_pattern`. New records are retained.
    pub fn new(
        full_name: impl Into<String>,
        line_metric: CoverageMetric,
        branch_metric: CoverageMetric,
        complexity: f64,
        exclusion_pattern: &str,
    ) -> Self {
        let full_name = full_name.into();
        let name = simple_name(&full_name).to_string();
        let excluded = is_excluded(&full_name, exclusion_pattern);
        Self {
            name,
            full_name,
            line_metric,
            branch_metric,
            complexity,
            excluded,
            retained: true,
        }
    }

    /// Everything before the last `.` of the full name, or "" if there is none.
    #[must_use]
    pub fn namespace(&self) -> &str {
        match self.full_name.rfind('.') {
            Some(idx) => &self.full_name[..idx],
            None => "",
        }
    }

    #[must_use]
    pub fn with_excluded(self, excluded: bool) -> Self {
        Self { excluded, ..self }
    }

    #[must_use]
    pub fn with_retained(self, retained: bool) -> Self {
        Self { retained, ..self }
    }
}

fn simple_name(full_name: &str) -> &str {
    full_name.rsplit('.').next().unwrap_or(full_name)
}

/// A named group of classes, one per non-test `<package>` element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageSummary {
    pub name: String,
    pub classes: Vec<ClassRecord>,
}

impl PackageSummary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: Vec::new(),
        }
    }

    pub fn add_class(&mut self, class: ClassRecord) {
        self.classes.push(class);
    }

    #[must_use]
    pub fn total_line_coverage(&self) -> CoverageMetric {
        self.classes.iter().map(|c| c.line_metric).sum()
    }

    #[must_use]
    pub fn total_branch_coverage(&self) -> CoverageMetric {
        self.classes.iter().map(|c| c.branch_metric).sum()
    }

    #[must_use]
    pub fn core_line_coverage(&self) -> CoverageMetric {
        self.classes
            .iter()
            .filter(|c| !c.excluded)
            .map(|c| c.line_metric)
            .sum()
    }

    #[must_use]
    pub fn excluded_line_coverage(&self) -> CoverageMetric {
        self.classes
            .iter()
            .filter(|c| c.excluded)
            .map(|c| c.line_metric)
            .sum()
    }
}

/// Precomputed partition totals, as stored in a report summary row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryMetrics {
    pub total: CoverageMetric,
    pub core: CoverageMetric,
    pub excluded: CoverageMetric,
}

/// Where a report's metrics come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportDetail {
    /// Class-level data is loaded; metrics are folded from it.
    Packages(Vec<PackageSummary>),
    /// Only the stored totals are available.
    Summary(SummaryMetrics),
}

/// The result of parsing one coverage document.
#[derive(Debug, Clone)]
pub struct ReportAggregate {
    /// Store-assigned id, `None` until saved.
    pub id: Option<i64>,
    pub uploaded_at: DateTime<Local>,
    pub file_size_bytes: u64,
    pub exclusion_pattern: String,
    pub parse_duration_ms: u64,
    detail: ReportDetail,
}

impl ReportAggregate {
    /// An aggregate computed from class records, initially with no packages.
    pub fn new(
        uploaded_at: DateTime<Local>,
        file_size_bytes: u64,
        exclusion_pattern: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            uploaded_at,
            file_size_bytes,
            exclusion_pattern: exclusion_pattern.into(),
            parse_duration_ms: 0,
            detail: ReportDetail::Packages(Vec::new()),
        }
    }

    /// An aggregate rebuilt from stored totals without class detail.
    pub fn from_summary(
        uploaded_at: DateTime<Local>,
        file_size_bytes: u64,
        exclusion_pattern: impl Into<String>,
        metrics: SummaryMetrics,
    ) -> Self {
        Self {
            detail: ReportDetail::Summary(metrics),
            ..Self::new(uploaded_at, file_size_bytes, exclusion_pattern)
        }
    }

    #[must_use]
    pub fn with_id(self, id: i64) -> Self {
        Self {
            id: Some(id),
            ..self
        }
    }

    #[must_use]
    pub fn detail(&self) -> &ReportDetail {
        &self.detail
    }

    /// Append a package. Adding class data to a summary-only aggregate makes
    /// the class data authoritative and drops the stored totals.
    pub fn add_package(&mut self, package: PackageSummary) {
        match &mut self.detail {
            ReportDetail::Packages(packages) => packages.push(package),
            ReportDetail::Summary(_) => self.detail = ReportDetail::Packages(vec![package]),
        }
    }

    #[must_use]
    pub fn packages(&self) -> &[PackageSummary] {
        match &self.detail {
            ReportDetail::Packages(packages) => packages.as_slice(),
            ReportDetail::Summary(_) => &[],
        }
    }

    /// Every class in package-then-class order.
    pub fn all_classes(&self) -> impl Iterator<Item = &ClassRecord> + Clone + '_ {
        self.packages().iter().flat_map(|p| p.classes.iter())
    }

    #[must_use]
    pub fn class_count(&self) -> usize {
        self.packages().iter().map(|p| p.classes.len()).sum()
    }

    #[must_use]
    pub fn total_metrics(&self) -> CoverageMetric {
        match &self.detail {
            ReportDetail::Summary(metrics) => metrics.total,
            ReportDetail::Packages(_) => self.total_metrics_where(|_| true),
        }
    }

    /// Fold the line metric of every class matching `predicate`.
    pub fn total_metrics_where<P>(&self, predicate: P) -> CoverageMetric
    where
        P: Fn(&ClassRecord) -> bool,
    {
        self.all_classes()
            .filter(|c| predicate(*c))
            .map(|c| c.line_metric)
            .sum()
    }

    #[must_use]
    pub fn core_metrics(&self) -> CoverageMetric {
        match &self.detail {
            ReportDetail::Summary(metrics) => metrics.core,
            ReportDetail::Packages(_) => {
                self.total_metrics_where(|c| !is_excluded(&c.full_name, &self.exclusion_pattern))
            }
        }
    }

    #[must_use]
    pub fn excluded_metrics(&self) -> CoverageMetric {
        match &self.detail {
            ReportDetail::Summary(metrics) => metrics.excluded,
            ReportDetail::Packages(_) => {
                self.total_metrics_where(|c| is_excluded(&c.full_name, &self.exclusion_pattern))
            }
        }
    }

    /// Branch counters are carried but never partitioned.
    #[must_use]
    pub fn total_branch_metrics(&self) -> CoverageMetric {
        self.all_classes().map(|c| c.branch_metric).sum()
    }

    #[must_use]
    pub fn summary_metrics(&self) -> SummaryMetrics {
        SummaryMetrics {
            total: self.total_metrics(),
            core: self.core_metrics(),
            excluded: self.excluded_metrics(),
        }
    }

    /// Replace the exclusion pattern and re-tag every class with it.
    #[must_use]
    pub fn with_exclusion_pattern(self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let detail = match self.detail {
            ReportDetail::Packages(packages) => ReportDetail::Packages(
                packages
                    .into_iter()
                    .map(|p| PackageSummary {
                        classes: p
                            .classes
                            .into_iter()
                            .map(|c| {
                                let excluded = is_excluded(&c.full_name, &pattern);
                                c.with_excluded(excluded)
                            })
                            .collect(),
                        ..p
                    })
                    .collect(),
            ),
            summary @ ReportDetail::Summary(_) => summary,
        };
        Self {
            exclusion_pattern: pattern,
            detail,
            ..self
        }
    }
}
