//! Error types for the fieldmap engine

use thiserror::Error;

/// Errors raised while extracting field geometry from a source document.
///
/// `NoFormFields` is the one non-fatal variant: the extractor surfaces it so
/// the caller can switch to the background-image fallback instead of giving
/// up on the document.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Failed to read source document: {0}")]
    Unreadable(String),

    #[error("Document is encrypted; unlock it before extracting")]
    Encrypted,

    #[error("Document has no interactive form fields")]
    NoFormFields,

    /// Persisting freshly extracted positions failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the position store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Position file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed position file: {0}")]
    Malformed(String),
}

/// Errors raised while rendering a filled document.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Position references page {page} but the document has {page_count} pages")]
    InvalidPageRef { page: u32, page_count: u32 },

    #[error("No background image available for page {0}")]
    MissingBackground(u32),

    #[error("External raster tool failed: {0}")]
    ExternalToolFailure(String),

    #[error("Failed to read source document: {0}")]
    Unreadable(String),

    #[error("Output I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Loading the template's stored positions failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised when validating a position set against a document.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Field '{field}' has a non-positive width or height")]
    NonPositiveSize { field: String },

    #[error("Field '{field}' references page {page} but the document has {page_count} pages")]
    PageOutOfRange {
        field: String,
        page: u32,
        page_count: u32,
    },
}

/// Errors raised by the external rasterization adapter.
///
/// Failures are scoped to a single page; the extractor logs them and omits
/// the page rather than aborting the run.
#[derive(Error, Debug)]
pub enum RasterError {
    #[error("No rasterization tool found on this system")]
    ToolNotFound,

    #[error("Rasterization of page {page} failed (exit {status}): {stderr}")]
    Failed {
        page: u32,
        status: i32,
        stderr: String,
    },

    #[error("Rasterization of page {page} timed out after {seconds}s")]
    Timeout { page: u32, seconds: u64 },

    #[error("Rasterization I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the engine-level compare operation.
#[derive(Error, Debug)]
pub enum CompareError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to read reference positions: {0}")]
    Reference(String),
}

impl From<RasterError> for RenderError {
    fn from(err: RasterError) -> Self {
        RenderError::ExternalToolFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_error_messages() {
        let err = ExtractionError::Unreadable("bad xref".to_string());
        assert!(err.to_string().contains("bad xref"));

        let err = ExtractionError::Encrypted;
        assert!(err.to_string().contains("encrypted"));
    }

    #[test]
    fn test_render_error_page_ref_message() {
        let err = RenderError::InvalidPageRef {
            page: 5,
            page_count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains('5'));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_store_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_raster_error_converts_to_render_error() {
        let raster = RasterError::Timeout {
            page: 3,
            seconds: 30,
        };
        let render: RenderError = raster.into();
        assert!(matches!(render, RenderError::ExternalToolFailure(_)));
        assert!(render.to_string().contains("page 3"));
    }
}
