use thiserror::Error;

/// Structural failures that abort an operation.
///
/// Per-light problems during calibration are not errors; they are collected as
/// [`Rejection`](crate::calibration::solver::Rejection)s in the solver report.
#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "no mirror ball found in {width}x{height} mask frame (no edge survived edge_ratio {edge_ratio} and the stand mask)"
    )]
    NoSphereFound {
        width: u32,
        height: u32,
        edge_ratio: f32,
    },

    #[error("stored data does not match its description: expected {expected} but found {found}")]
    DataMismatch { expected: usize, found: usize },

    #[error("rows {start}..{end} are outside of an image {height} rows high")]
    RowsOutOfRange { start: u32, end: u32, height: u32 },

    #[error("basis {basis} cannot be fitted in the {coordinate_system} coordinate system")]
    UnsupportedBasisConfiguration {
        basis: String,
        coordinate_system: String,
    },

    #[error("no pseudoinverse has been computed for this fitter")]
    MissingInverse,

    #[error("image stack has no image for light {id}")]
    MissingImage { id: u32 },

    #[error("expected {expected_width}x{expected_height}x{expected_channels} image but got {width}x{height}x{channels}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        expected_channels: usize,
        width: u32,
        height: u32,
        channels: usize,
    },

    #[error("expected 1 or 3 channels but got {channels}")]
    InvalidChannels { channels: usize },

    #[error("calibration has no lights left after filtering ({filtered} of {total} removed)")]
    EmptyCalibration { total: usize, filtered: usize },

    #[error("pseudoinverse failed: {0}")]
    Pseudoinverse(&'static str),

    #[error("cannot build a light direction from a zero-length vector")]
    ZeroVector,

    #[error("unsupported calibration file version {found}, expected {expected}")]
    UnsupportedVersion { expected: u32, found: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
