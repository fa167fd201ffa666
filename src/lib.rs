//! Light Dome Reflectance Utilities
//!
//! Calibrates the lights of a dome from photos of a mirror ball, fits a per-pixel
//! reflectance model to photos of an object lit by each light in turn and relights
//! the object from the fitted model.
//!
//! ```text
//! mask + light frames --CalibrationSolver--> Calibration
//! Calibration + ImageStack --Fitter--> CoefficientField
//! CoefficientField + light / environment --Reconstructor--> image
//! ```

#[allow(missing_docs)]
pub mod error;

pub mod basis;
pub mod calibration;
pub mod direction;
pub mod field;
pub mod fitter;
pub mod raster;
pub mod render;
pub mod stack;

pub mod prelude {
    #[cfg(feature = "serde")]
    pub use crate::calibration::file::CalibrationFile;
    pub use crate::{
        basis::{Basis, CoordinateSystem},
        calibration::{
            Calibration,
            solver::{CalibrationReport, CalibrationSolver, SolverConfig},
        },
        direction::{LatLong, LightDirection},
        error::Error,
        field::{CoefficientField, PackingLayout},
        fitter::{FitSummary, Fitter, FitterConfig},
        raster::GrayFrame,
        render::{EnvironmentMap, HdriConfig, Reconstructor},
        stack::{ColorDomain, ImageStack},
    };
}
