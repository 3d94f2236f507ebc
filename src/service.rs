//! Command/query façade: routes upload, save, delete, history and detail
//! requests to the parser or the store.

use tracing::debug;

use crate::error::Result;
use crate::model::ReportAggregate;
use crate::parsers::cobertura::CoberturaParser;
use crate::parsers::ReportParser;
use crate::store::ReportStore;

/// A request the service can handle.
pub enum Request {
    /// Parse a document and save the result.
    Upload {
        document: String,
        exclusion_pattern: String,
    },
    /// Save an already-parsed report.
    Save(ReportAggregate),
    Delete(i64),
    GetHistory,
    GetDetails(i64),
}

/// Result of a dispatched [`Request`].
#[derive(Debug)]
pub enum Response {
    Uploaded(ReportAggregate),
    Saved(i64),
    Deleted,
    History(Vec<ReportAggregate>),
    Details(Option<ReportAggregate>),
}

pub struct CoverageService<S> {
    store: S,
}

impl<S: ReportStore> CoverageService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Parse `document` with `exclusion_pattern` and save it. The returned
    /// report carries its new id.
    pub fn upload(
        &mut self,
        document: &str,
        exclusion_pattern: &str,
        parse_progress: &mut dyn FnMut(f64),
        save_progress: &mut dyn FnMut(u32),
    ) -> Result<ReportAggregate> {
        let report =
            CoberturaParser::new(exclusion_pattern).parse_with_progress(document, parse_progress)?;
        let id = self.store.save(&report, save_progress)?;
        debug!(report_id = id, "uploaded report");
        Ok(report.with_id(id))
    }

    pub fn save(&mut self, report: &ReportAggregate, progress: &mut dyn FnMut(u32)) -> Result<i64> {
        self.store.save(report, progress)
    }

    pub fn history(&self) -> Result<Vec<ReportAggregate>> {
        self.store.get_all()
    }

    pub fn details(&self, id: i64) -> Result<Option<ReportAggregate>> {
        self.store.get_by_id(id)
    }

    pub fn delete(&mut self, id: i64) -> Result<()> {
        self.store.delete(id)
    }

    /// Route a request to the matching operation, without progress reporting.
    pub fn dispatch(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Upload {
                document,
                exclusion_pattern,
            } => self
                .upload(&document, &exclusion_pattern, &mut |_| {}, &mut |_| {})
                .map(Response::Uploaded),
            Request::Save(report) => self.save(&report, &mut |_| {}).map(Response::Saved),
            Request::Delete(id) => self.delete(id).map(|()| Response::Deleted),
            Request::GetHistory => self.history().map(Response::History),
            Request::GetDetails(id) => self.details(id).map(Response::Details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CoverageMetric;
    use crate::store::SqliteStore;

    const DOC: &str = r#"<coverage><packages><package name="App"><classes>
        <class name="App.Core.Foo" lines-valid="10" lines-covered="7"/>
        <class name="App.Controllers.Home" lines-valid="10" lines-covered="1"/>
    </classes></package></packages></coverage>"#;

    fn service() -> CoverageService<SqliteStore> {
        CoverageService::new(SqliteStore::open_in_memory().unwrap())
    }

    #[test]
    fn test_upload_then_details() {
        let mut service = service();
        let uploaded = service
            .upload(DOC, ".Controller", &mut |_| {}, &mut |_| {})
            .unwrap();
        let id = uploaded.id.unwrap();

        let details = service.details(id).unwrap().unwrap();
        assert_eq!(details.core_metrics(), CoverageMetric::new(7, 10));
        assert_eq!(details.excluded_metrics(), CoverageMetric::new(1, 10));
    }

    #[test]
    fn test_upload_rejects_bad_document() {
        let mut service = service();
        let err = service
            .upload("<coverage>", ".Controller", &mut |_| {}, &mut |_| {})
            .unwrap_err();
        assert!(err.is_format_error());
        assert!(service.history().unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_routes_requests() {
        let mut service = service();
        let Response::Uploaded(report) = service
            .dispatch(Request::Upload {
                document: DOC.to_string(),
                exclusion_pattern: String::new(),
            })
            .unwrap()
        else {
            panic!("expected upload response");
        };
        let id = report.id.unwrap();

        match service.dispatch(Request::GetHistory).unwrap() {
            Response::History(all) => {
                assert_eq!(all.len(), 1);
                assert_eq!(all[0].excluded_metrics(), CoverageMetric::EMPTY);
            }
            other => panic!("unexpected response {other:?}"),
        }

        assert!(matches!(
            service.dispatch(Request::Delete(id)).unwrap(),
            Response::Deleted
        ));
        assert!(matches!(
            service.dispatch(Request::GetDetails(id)).unwrap(),
            Response::Details(None)
        ));
    }

    #[test]
    fn test_dispatch_save() {
        let mut service = service();
        let report = CoberturaParser::default().parse(DOC).unwrap();
        let Response::Saved(id) = service.dispatch(Request::Save(report)).unwrap() else {
            panic!("expected save response");
        };
        assert!(service.details(id).unwrap().is_some());
    }
}
