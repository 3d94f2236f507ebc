use thiserror::Error;

#[derive(Error, Debug)]
pub enum CovsplitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("XML parse error at position {position}: {source}")]
    Xml {
        source: quick_xml::Error,
        position: usize,
    },

    #[error("Invalid coverage document: {0}")]
    Format(String),

    #[error("Report not found: {0}")]
    ReportNotFound(i64),

    #[error("{0}")]
    Other(String),
}

impl CovsplitError {
    /// True when the input was not a coverage document we can read at all.
    #[must_use]
    pub fn is_format_error(&self) -> bool {
        matches!(self, CovsplitError::Xml { .. } | CovsplitError::Format(_))
    }
}

pub type Result<T> = std::result::Result<T, CovsplitError>;
