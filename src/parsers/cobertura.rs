/// Parser for Cobertura XML coverage reports.
///
/// Cobertura XML structure (the parts we read):
///   <coverage>
///     <packages>
///       <package name="...">
///         <classes>
///           <class name="..." lines-valid="N" lines-covered="N"
///                  branches-valid="N" branches-covered="N" complexity="F">
///             <lines>
///               <line number="N" hits="N"/>
///             </lines>
///           </class>
///         </classes>
///       </package>
///     </packages>
///   </coverage>
///
/// Generators disagree on which class attributes they emit, so every counter
/// has a fallback: line totals are recounted from `<line>` children when the
/// `lines-*` attributes are missing, everything else defaults to zero.
///
/// The document is read twice. The first pass checks well-formedness and
/// counts classes so progress can be reported against a known total; the
/// second pass builds the report.
use std::time::Instant;

use chrono::Local;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;

use super::{get_attr, xml_err, xml_reader, ReportParser};
use crate::classify::{contains_ignore_case, DEFAULT_EXCLUSION_PATTERN};
use crate::error::{CovsplitError, Result};
use crate::model::*;

/// Progress reported before any real work starts.
const PROGRESS_START: f64 = 0.05;
/// Share of the progress range spent walking classes.
const PROGRESS_CLASSES: f64 = 0.90;

pub struct CoberturaParser {
    exclusion_pattern: String,
}

impl CoberturaParser {
    pub fn new(exclusion_pattern: impl Into<String>) -> Self {
        Self {
            exclusion_pattern: exclusion_pattern.into(),
        }
    }

    #[must_use]
    pub fn exclusion_pattern(&self) -> &str {
        &self.exclusion_pattern
    }
}

impl Default for CoberturaParser {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUSION_PATTERN)
    }
}

impl ReportParser for CoberturaParser {
    fn parse_with_progress(
        &self,
        input: &str,
        progress: &mut dyn FnMut(f64),
    ) -> Result<ReportAggregate> {
        parse_cobertura(input, &self.exclusion_pattern, progress)
    }
}

fn parse_cobertura(
    input: &str,
    exclusion_pattern: &str,
    progress: &mut dyn FnMut(f64),
) -> Result<ReportAggregate> {
    let started = Instant::now();
    progress(PROGRESS_START);

    let document = input.strip_prefix('\u{feff}').unwrap_or(input);

    let mut counter = ClassCounter::default();
    walk(document, &mut counter)?;
    let total_classes: usize = counter.per_package.iter().sum();

    let report = ReportAggregate::new(Local::now(), input.len() as u64, exclusion_pattern);
    let mut extractor = Extractor {
        exclusion_pattern: exclusion_pattern.to_string(),
        report,
        class_counts: counter.per_package,
        package_index: 0,
        package: None,
        class: None,
        processed_classes: 0,
        total_classes,
        progress,
    };
    walk(document, &mut extractor)?;

    let mut report = extractor.report;
    report.parse_duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    debug!(
        packages = report.packages().len(),
        classes = report.class_count(),
        duration_ms = report.parse_duration_ms,
        "parsed cobertura report"
    );
    (extractor.progress)(1.0);

    Ok(report)
}

/// Role of an element within the Cobertura layout. Only the first
/// `<packages>`, `<classes>` and `<lines>` child of their parent counts;
/// anything else is `Other` and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Root,
    Packages,
    Package,
    Classes,
    Class,
    Lines,
    Line,
    Other,
}

struct Frame {
    node: Node,
    claimed: bool,
}

impl Frame {
    fn new(node: Node) -> Self {
        Self {
            node,
            claimed: false,
        }
    }

    fn child(&mut self, name: &[u8]) -> Node {
        match (self.node, name) {
            (Node::Root, b"packages") => self.claim(Node::Packages),
            (Node::Packages, b"package") => Node::Package,
            (Node::Package, b"classes") => self.claim(Node::Classes),
            (Node::Classes, b"class") => Node::Class,
            (Node::Class, b"lines") => self.claim(Node::Lines),
            (Node::Lines, b"line") => Node::Line,
            _ => Node::Other,
        }
    }

    fn claim(&mut self, node: Node) -> Node {
        if self.claimed {
            Node::Other
        } else {
            self.claimed = true;
            node
        }
    }
}

trait Visitor {
    fn open(&mut self, node: Node, element: &BytesStart);
    fn close(&mut self, node: Node);
}

/// Walk the document, rejecting anything that is not well-formed, and hand
/// every element to the visitor with its role.
fn walk(input: &str, visitor: &mut dyn Visitor) -> Result<()> {
    let mut reader = xml_reader(input);
    let mut stack: Vec<Frame> = Vec::new();
    let mut root_seen = false;

    loop {
        match reader.read_event() {
            Err(e) => return Err(xml_err(e, &reader)),
            Ok(Event::Eof) => break,
            Ok(Event::Start(ref e)) => {
                let node = enter(&mut stack, &mut root_seen, e, &reader)?;
                visitor.open(node, e);
                stack.push(Frame::new(node));
            }
            Ok(Event::Empty(ref e)) => {
                let node = enter(&mut stack, &mut root_seen, e, &reader)?;
                visitor.open(node, e);
                visitor.close(node);
            }
            Ok(Event::End(_)) => match stack.pop() {
                Some(frame) => visitor.close(frame.node),
                None => {
                    return Err(CovsplitError::Format(format!(
                        "unexpected closing tag at position {}",
                        reader.buffer_position()
                    )))
                }
            },
            Ok(Event::Text(ref e)) => {
                if stack.is_empty() {
                    return Err(CovsplitError::Format(format!(
                        "text outside the root element at position {}",
                        reader.buffer_position()
                    )));
                }
                e.unescape().map_err(|err| xml_err(err, &reader))?;
            }
            Ok(Event::CData(_)) if stack.is_empty() => {
                return Err(CovsplitError::Format(format!(
                    "CDATA outside the root element at position {}",
                    reader.buffer_position()
                )));
            }
            Ok(_) => {}
        }
    }

    if let Some(frame) = stack.last() {
        return Err(CovsplitError::Format(format!(
            "document ended with {} unclosed element(s) ({:?} innermost)",
            stack.len(),
            frame.node
        )));
    }
    if !root_seen {
        return Err(CovsplitError::Format("document has no root element".into()));
    }
    Ok(())
}

fn enter(
    stack: &mut [Frame],
    root_seen: &mut bool,
    e: &BytesStart,
    reader: &Reader<&[u8]>,
) -> Result<Node> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| xml_err(err.into(), reader))?;
        attr.unescape_value().map_err(|err| xml_err(err, reader))?;
    }

    let Some(parent) = stack.last_mut() else {
        if *root_seen {
            return Err(CovsplitError::Format(format!(
                "second root element at position {}",
                reader.buffer_position()
            )));
        }
        *root_seen = true;
        return Ok(Node::Root);
    };
    Ok(parent.child(e.name().as_ref()))
}

/// First pass: number of classes in each package, in document order.
#[derive(Default)]
struct ClassCounter {
    per_package: Vec<usize>,
}

impl Visitor for ClassCounter {
    fn open(&mut self, node: Node, _element: &BytesStart) {
        match node {
            Node::Package => self.per_package.push(0),
            Node::Class => {
                if let Some(count) = self.per_package.last_mut() {
                    *count += 1;
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, _node: Node) {}
}

/// Counters collected for the class currently being read.
struct ClassState {
    full_name: String,
    lines_valid: Option<u64>,
    lines_covered: Option<u64>,
    branches_valid: Option<u64>,
    branches_covered: Option<u64>,
    complexity: f64,
    line_elements: u64,
    hit_line_elements: u64,
}

impl ClassState {
    fn from_element(e: &BytesStart) -> Self {
        Self {
            full_name: get_attr(e, b"name").unwrap_or_else(|| "Unknown".to_string()),
            lines_valid: parse_count(get_attr(e, b"lines-valid")),
            lines_covered: parse_count(get_attr(e, b"lines-covered")),
            branches_valid: parse_count(get_attr(e, b"branches-valid")),
            branches_covered: parse_count(get_attr(e, b"branches-covered")),
            complexity: parse_complexity(get_attr(e, b"complexity")),
            line_elements: 0,
            hit_line_elements: 0,
        }
    }

    fn into_record(self, exclusion_pattern: &str) -> ClassRecord {
        let line_metric = CoverageMetric::new(
            self.lines_covered.unwrap_or(self.hit_line_elements),
            self.lines_valid.unwrap_or(self.line_elements),
        );
        // No line-level fallback for branches: absent means zero.
        let branch_metric = CoverageMetric::new(
            self.branches_covered.unwrap_or(0),
            self.branches_valid.unwrap_or(0),
        );
        ClassRecord::new(
            self.full_name,
            line_metric,
            branch_metric,
            self.complexity,
            exclusion_pattern,
        )
    }
}

/// A non-negative count that fits an SQLite INTEGER; anything else is absent.
fn parse_count(value: Option<String>) -> Option<u64> {
    let count: i64 = value?.trim().parse().ok()?;
    u64::try_from(count).ok()
}

fn parse_complexity(value: Option<String>) -> f64 {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|c| c.is_finite() && *c >= 0.0)
        .unwrap_or(0.0)
}

fn is_test_package(name: &str) -> bool {
    contains_ignore_case(name, "test")
}

/// Second pass: builds the report.
struct Extractor<'a> {
    exclusion_pattern: String,
    report: ReportAggregate,
    class_counts: Vec<usize>,
    package_index: usize,
    /// `None` while inside a skipped test package.
    package: Option<PackageSummary>,
    class: Option<ClassState>,
    processed_classes: usize,
    total_classes: usize,
    progress: &'a mut dyn FnMut(f64),
}

impl Visitor for Extractor<'_> {
    fn open(&mut self, node: Node, element: &BytesStart) {
        match node {
            Node::Package => {
                let name = get_attr(element, b"name").unwrap_or_else(|| "Unknown".to_string());
                let class_count = self.class_counts.get(self.package_index).copied().unwrap_or(0);
                self.package_index += 1;
                if is_test_package(&name) {
                    debug!(package = %name, classes = class_count, "skipping test package");
                    self.processed_classes += class_count;
                    self.package = None;
                } else {
                    self.package = Some(PackageSummary::new(name));
                }
            }
            Node::Class if self.package.is_some() => {
                self.class = Some(ClassState::from_element(element));
            }
            Node::Line => {
                if let Some(class) = self.class.as_mut() {
                    class.line_elements += 1;
                    let hits = get_attr(element, b"hits");
                    if hits.as_deref().unwrap_or("0") != "0" {
                        class.hit_line_elements += 1;
                    }
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, node: Node) {
        match node {
            Node::Class => {
                let (Some(package), Some(class)) = (self.package.as_mut(), self.class.take())
                else {
                    return;
                };
                package.add_class(class.into_record(&self.exclusion_pattern));
                self.processed_classes += 1;
                if self.total_classes > 0 {
                    let done = self.processed_classes as f64 / self.total_classes as f64;
                    (self.progress)(PROGRESS_START + PROGRESS_CLASSES * done);
                }
            }
            Node::Package => {
                if let Some(package) = self.package.take() {
                    if !package.classes.is_empty() {
                        self.report.add_package(package);
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str, pattern: &str) -> Result<ReportAggregate> {
        CoberturaParser::new(pattern).parse(xml)
    }

    #[test]
    fn test_parse_single_class() {
        let xml = r#"<coverage><packages><package name="App.Core"><classes>
            <class name="App.Core.Foo" lines-valid="10" lines-covered="7"
                   branches-valid="4" branches-covered="3" complexity="2.5"/>
        </classes></package></packages></coverage>"#;
        let report = parse(xml, ".Controller").unwrap();

        assert_eq!(report.packages().len(), 1);
        let pkg = &report.packages()[0];
        assert_eq!(pkg.name, "App.Core");
        assert_eq!(pkg.classes.len(), 1);

        let foo = &pkg.classes[0];
        assert_eq!(foo.name, "Foo");
        assert_eq!(foo.full_name, "App.Core.Foo");
        assert_eq!(foo.line_metric, CoverageMetric::new(7, 10));
        assert_eq!(foo.branch_metric, CoverageMetric::new(3, 4));
        assert_eq!(foo.complexity, 2.5);
        assert!(!foo.excluded);
        assert!(foo.retained);

        assert_eq!(report.core_metrics(), CoverageMetric::new(7, 10));
        assert_eq!(report.excluded_metrics(), CoverageMetric::EMPTY);
        assert_eq!(report.file_size_bytes, xml.len() as u64);
    }

    #[test]
    fn test_line_fallback_counts_hits() {
        let xml = r#"<coverage><packages><package name="P"><classes>
            <class name="P.A"><lines>
                <line number="1" hits="1"/>
                <line number="2" hits="1"/>
                <line number="3" hits="0"/>
            </lines></class>
        </classes></package></packages></coverage>"#;
        let report = parse(xml, "").unwrap();
        let class = &report.packages()[0].classes[0];
        assert_eq!(class.line_metric, CoverageMetric::new(2, 3));
        assert_eq!(class.branch_metric, CoverageMetric::EMPTY);
        assert_eq!(class.complexity, 0.0);
    }

    #[test]
    fn test_missing_hits_is_uncovered() {
        let xml = r#"<coverage><packages><package name="P"><classes>
            <class name="P.A"><lines><line number="1"/><line number="2" hits="5"/></lines></class>
        </classes></package></packages></coverage>"#;
        let report = parse(xml, "").unwrap();
        assert_eq!(
            report.packages()[0].classes[0].line_metric,
            CoverageMetric::new(1, 2)
        );
    }

    #[test]
    fn test_unparsable_attributes_fall_back() {
        let xml = r#"<coverage><packages><package name="P"><classes>
            <class name="P.A" lines-valid="n/a" lines-covered="-1"
                   branches-valid="x" complexity="NaN">
                <lines><line number="1" hits="3"/></lines>
            </class>
        </classes></package></packages></coverage>"#;
        let report = parse(xml, "").unwrap();
        let class = &report.packages()[0].classes[0];
        assert_eq!(class.line_metric, CoverageMetric::new(1, 1));
        assert_eq!(class.branch_metric, CoverageMetric::EMPTY);
        assert_eq!(class.complexity, 0.0);
    }

    #[test]
    fn test_counts_beyond_sqlite_range_fall_back() {
        let xml = r#"<coverage><packages><package name="P"><classes>
            <class name="P.A" lines-valid="10000000000000000000" lines-covered="9223372036854775807"
                   branches-valid="9223372036854775808" branches-covered="1">
                <lines><line number="1" hits="1"/><line number="2" hits="0"/></lines>
            </class>
        </classes></package></packages></coverage>"#;
        let report = parse(xml, "").unwrap();
        let class = &report.packages()[0].classes[0];
        assert_eq!(class.line_metric, CoverageMetric::new(MAX_COUNT, 2));
        assert_eq!(class.branch_metric, CoverageMetric::new(1, 0));
    }

    #[test]
    fn test_only_first_lines_block_counts() {
        let xml = r#"<coverage><packages><package name="P"><classes>
            <class name="P.A">
                <methods><method name="m"><lines><line number="1" hits="1"/></lines></method></methods>
                <lines><line number="1" hits="1"/><line number="2" hits="0"/></lines>
                <lines><line number="9" hits="1"/></lines>
            </class>
        </classes></package></packages></coverage>"#;
        let report = parse(xml, "").unwrap();
        assert_eq!(
            report.packages()[0].classes[0].line_metric,
            CoverageMetric::new(1, 2)
        );
    }

    #[test]
    fn test_defaults_for_missing_names() {
        let xml = r#"<coverage><packages><package><classes>
            <class lines-valid="1" lines-covered="1"/>
        </classes></package></packages></coverage>"#;
        let report = parse(xml, "").unwrap();
        let pkg = &report.packages()[0];
        assert_eq!(pkg.name, "Unknown");
        assert_eq!(pkg.classes[0].name, "Unknown");
        assert_eq!(pkg.classes[0].namespace(), "");
    }

    #[test]
    fn test_skips_test_packages() {
        let xml = r#"<coverage><packages>
            <package name="App.UnitTests"><classes><class name="App.UnitTests.T1"/><class name="App.UnitTests.T2"/></classes></package>
            <package name="App.Core"><classes><class name="App.Core.Foo" lines-valid="2" lines-covered="1"/></classes></package>
        </packages></coverage>"#;
        let mut seen = Vec::new();
        let report = CoberturaParser::new("")
            .parse_with_progress(xml, &mut |p| seen.push(p))
            .unwrap();

        assert_eq!(report.packages().len(), 1);
        assert_eq!(report.packages()[0].name, "App.Core");
        // One class report; the skipped package's two classes already count.
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], 0.05);
        assert!((seen[1] - 0.95).abs() < 1e-9);
        assert_eq!(seen[2], 1.0);
    }

    #[test]
    fn test_drops_empty_packages() {
        let xml = r#"<coverage><packages>
            <package name="Empty"><classes/></package>
            <package name="NoClasses"/>
            <package name="App"><classes><class name="App.A"/></classes></package>
        </packages></coverage>"#;
        let report = parse(xml, "").unwrap();
        let names: Vec<_> = report.packages().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["App"]);
    }

    #[test]
    fn test_no_packages_is_empty_report() {
        let mut seen = Vec::new();
        let report = CoberturaParser::new(".Controller")
            .parse_with_progress("<coverage/>", &mut |p| seen.push(p))
            .unwrap();
        assert!(report.packages().is_empty());
        assert_eq!(report.total_metrics(), CoverageMetric::EMPTY);
        assert_eq!(seen, vec![0.05, 1.0]);
    }

    #[test]
    fn test_ignores_misplaced_classes() {
        let xml = r#"<coverage>
            <class name="Stray" lines-valid="5"/>
            <packages><package name="P"><class name="P.Direct" lines-valid="5"/>
                <classes><class name="P.A" lines-valid="1" lines-covered="1"/></classes>
            </package></packages>
        </coverage>"#;
        let report = parse(xml, "").unwrap();
        assert_eq!(report.class_count(), 1);
        assert_eq!(report.total_metrics(), CoverageMetric::new(1, 1));
    }

    #[test]
    fn test_controller_excluded() {
        let xml = r#"<coverage><packages><package name="App.Web"><classes>
            <class name="App.Web.Controllers.HomeController" lines-valid="4" lines-covered="1"/>
            <class name="App.Web.FooController" lines-valid="6" lines-covered="6"/>
        </classes></package></packages></coverage>"#;
        let report = parse(xml, ".Controller").unwrap();
        assert_eq!(report.excluded_metrics(), CoverageMetric::new(1, 4));
        assert_eq!(report.core_metrics(), CoverageMetric::new(6, 6));
    }

    #[test]
    fn test_strips_byte_order_mark() {
        let xml = "\u{feff}<?xml version=\"1.0\"?><coverage><packages/></coverage>";
        let report = parse(xml, "").unwrap();
        assert_eq!(report.file_size_bytes, xml.len() as u64);
    }

    #[test]
    fn test_rejects_empty_document() {
        let err = parse("", "").unwrap_err();
        assert!(err.is_format_error());
        let err = parse("   <?xml version=\"1.0\"?>  ", "").unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_rejects_malformed_documents() {
        for xml in [
            "<coverage><packages></coverage>",
            "<coverage><packages>",
            "<a/><b/>",
            "not xml at all",
            "<coverage></coverage>trailing",
            r#"<coverage name="a" name="b"/>"#,
        ] {
            let err = parse(xml, "").unwrap_err();
            assert!(err.is_format_error(), "{xml:?} gave {err}");
        }
    }

    #[test]
    fn test_rejects_before_class_progress() {
        let mut seen = Vec::new();
        let result = CoberturaParser::new("").parse_with_progress(
            r#"<coverage><packages><package name="P"><classes><class name="A"/></classes></package>"#,
            &mut |p| seen.push(p),
        );
        assert!(result.is_err());
        assert_eq!(seen, vec![0.05]);
    }

    #[test]
    fn test_default_pattern() {
        assert_eq!(CoberturaParser::default().exclusion_pattern(), ".Controller");
    }
}
