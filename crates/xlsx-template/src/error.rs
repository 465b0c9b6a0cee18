use thiserror::Error;

use crate::package::XlsxError;

#[derive(Debug, Error)]
pub enum TemplateError {
    /// A required part or element is missing or unreadable, or no caption row could be found.
    #[error("malformed template: {0}")]
    MalformedTemplate(String),
    /// The template has a caption row but no example data rows to sample styles from.
    #[error("template has no example data rows to take styles from")]
    NoStylePattern,
    /// The container itself could not be read or written.
    #[error("archive error: {0}")]
    Archive(XlsxError),
}

impl From<XlsxError> for TemplateError {
    fn from(err: XlsxError) -> Self {
        match err {
            XlsxError::Zip(_)
            | XlsxError::Io(_)
            | XlsxError::PartTooLarge { .. }
            | XlsxError::PackageTooLarge { .. } => TemplateError::Archive(err),
            other => TemplateError::MalformedTemplate(other.to_string()),
        }
    }
}
