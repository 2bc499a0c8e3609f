use std::path::PathBuf;

use thiserror::Error;

/// Failures of a single insert/update request. Each one aborts the current
/// request and leaves the cell text and stored images untouched.
#[derive(Debug, Error)]
pub enum DropError {
    #[error("no workspace folder found; pass --workspace or set NBIMG_WORKSPACE")]
    NoWorkspace,

    #[error("unable to retrieve the target cell; select a cell with --cell")]
    NoTargetCell,

    #[error("image file does not exist: {}", .0.display())]
    ImageNotFound(PathBuf),

    #[error("path is not a file: {}", .0.display())]
    NotAFile(PathBuf),

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("please select an image first")]
    NoImageSelected,

    #[error("no image data received")]
    MissingImageData,

    #[error("image payload is not valid base64: {0}")]
    InvalidImageData(#[from] base64::DecodeError),

    #[error("no free file name for {base} after {attempts} attempts")]
    NoFreeFileName { base: String, attempts: u32 },

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("{0}")]
    Panel(String),
}

pub type DropResult<T> = Result<T, DropError>;
