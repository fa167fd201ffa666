//! JSON persistence for calibrations.
//!
//! ```text
//! {
//!   "version": 1,
//!   "created": "2025-06-13T16:26:47Z",
//!   "lights": [{ "id": 0, "uv": [0.5, 0.25], "xyz": [0.41, 0.2, -0.88] }],
//!   "fitter": { ... }
//! }
//! ```
//!
//! `xyz` is authoritative. `uv` only records where the reflection was seen and may
//! be missing.

use super::Calibration;
use crate::{direction::LightDirection, error::Error, fitter::InverseRecord};
use chrono::{DateTime, Utc};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

pub const CALIBRATION_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LightRecord {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uv: Option<[f64; 2]>,
    pub xyz: [f64; 3],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    pub lights: Vec<LightRecord>,
    /// A cached pseudoinverse computed from these lights.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fitter: Option<InverseRecord>,
}

impl CalibrationFile {
    pub fn new(calibration: &Calibration, fitter: Option<InverseRecord>) -> Self {
        Self {
            version: CALIBRATION_VERSION,
            created: Some(Utc::now()),
            lights: calibration
                .iter()
                .map(|(id, light)| LightRecord {
                    id,
                    uv: light.uv().map(Into::into),
                    xyz: light.direction().into(),
                })
                .collect(),
            fitter,
        }
    }

    /// Rebuilds the calibration. Directions are renormalized.
    pub fn calibration(&self) -> Result<Calibration, Error> {
        if self.version != CALIBRATION_VERSION {
            return Err(Error::UnsupportedVersion {
                expected: CALIBRATION_VERSION,
                found: self.version,
            });
        }

        let mut calibration = Calibration::new();
        for light in &self.lights {
            calibration.add_light(
                light.id,
                LightDirection::try_from(light.xyz)?,
                light.uv.map(Vector2::from),
            );
        }
        Ok(calibration)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}
