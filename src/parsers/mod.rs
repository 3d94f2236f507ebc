pub mod cobertura;

use quick_xml::events::BytesStart;
use quick_xml::reader::Reader;

use crate::error::{CovsplitError, Result};
use crate::model::ReportAggregate;

/// Every format parser implements this trait.
pub trait ReportParser {
    /// Parse the document, calling `progress` with the completed fraction
    /// (0.0 to 1.0) as work proceeds.
    fn parse_with_progress(
        &self,
        input: &str,
        progress: &mut dyn FnMut(f64),
    ) -> Result<ReportAggregate>;

    /// Parse the document without progress reporting.
    fn parse(&self, input: &str) -> Result<ReportAggregate> {
        self.parse_with_progress(input, &mut |_| {})
    }
}

/// Build a quick-xml reader over an in-memory document.
pub(crate) fn xml_reader(input: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(input);
    reader.trim_text(true);
    reader
}

/// Wrap a quick-xml error with the reader's current byte offset.
pub(crate) fn xml_err(source: quick_xml::Error, reader: &Reader<&[u8]>) -> CovsplitError {
    CovsplitError::Xml {
        source,
        position: reader.buffer_position(),
    }
}

/// Unescaped value of the attribute with the given (qualified) name.
pub(crate) fn get_attr(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}
