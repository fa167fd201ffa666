//! Finds the mirror ball in a mask frame and each light's reflection on it.

use super::Calibration;
use crate::{
    direction::LightDirection,
    error::Error,
    raster::{self, BinaryMask, Circle, GrayFrame},
};
use nalgebra::Vector2;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uom::si::{angle::degree, f64::Angle};

/// Thresholds and filter sizes used by [`CalibrationSolver`].
///
/// Intensities are on the [0, 1] range of a [`GrayFrame`].
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct SolverConfig {
    /// Standard deviation of the blur applied to the mask frame, in pixels.
    pub denoise_sigma: f32,

    /// Edges weaker than this fraction of the strongest edge are ignored.
    pub edge_ratio: f32,

    /// Fraction of the frame height, from the bottom, hidden by the stand mask.
    pub stand_mask_fraction: f32,

    /// Fraction of the frame height over which the stand mask fades in.
    pub stand_mask_ramp: f32,

    /// A light frame whose brightest pixel on the ball is below this is treated as black.
    pub black_threshold: f32,

    /// Binarization threshold for reflections.
    pub threshold: f32,

    /// Reflections smaller than this fraction of the ball radius are noise.
    pub min_size_ratio: f64,

    /// Half the camera's viewing angle, in degrees, for perspective correction.
    ///
    /// Zero is the orthographic approximation. It is never derived from camera
    /// metadata; set it explicitly when the lens is known.
    pub viewing_angle_half_deg: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            denoise_sigma: 1.0,
            edge_ratio: 0.5,
            stand_mask_fraction: 0.2,
            stand_mask_ramp: 0.05,
            black_threshold: 0.05,
            threshold: 0.5,
            min_size_ratio: 0.01,
            viewing_angle_half_deg: 0.0,
        }
    }
}

/// Why a light frame did not produce a calibration sample.
#[derive(Clone, Debug, PartialEq)]
pub enum RejectionReason {
    /// Nothing on the ball reached `black_threshold`.
    BlackFrame { max_value: f32 },

    /// Nothing on the ball reached the binarization threshold.
    NoReflection { threshold: f32 },

    /// The largest reflection was below `min_size_ratio` of the ball radius.
    TooSmall { radius: f64, min_radius: f64 },
}

/// A light frame that was skipped.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    pub id: u32,
    pub reason: RejectionReason,
}

/// The reflection picked for a light frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Reflection {
    /// Enclosing circle of the chosen region in pixel coordinates.
    pub circle: Circle,

    /// Offset from the ball center in ball radii, `v` pointing up.
    pub uv: Vector2<f64>,

    /// Smaller regions that lost to `circle`.
    pub discarded: Vec<Circle>,
}

/// Everything a calibration run produced.
#[derive(Clone, Debug)]
pub struct CalibrationReport {
    pub calibration: Calibration,
    pub sphere: Circle,
    pub reflections: Vec<(u32, Reflection)>,
    pub rejections: Vec<Rejection>,
}

impl CalibrationReport {
    pub fn accepted(&self) -> usize {
        self.calibration.len()
    }

    pub fn rejected(&self) -> usize {
        self.rejections.len()
    }
}

/// Turns a mirror ball photo sequence into a [`Calibration`].
///
/// The solver is deterministic: identical frames and configuration always give a
/// bit-for-bit identical calibration.
#[derive(Clone, Debug, Default)]
pub struct CalibrationSolver {
    config: SolverConfig,
}

impl CalibrationSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Locates the ball as the smallest circle around every edge in the mask frame.
    pub fn locate_sphere(&self, mask: &GrayFrame) -> Result<Circle, Error> {
        let mut edges = raster::edges(&raster::denoise(mask, self.config.denoise_sigma));
        raster::apply_stand_mask(
            &mut edges,
            self.config.stand_mask_fraction,
            self.config.stand_mask_ramp,
        );

        let no_sphere = || Error::NoSphereFound {
            width: mask.width(),
            height: mask.height(),
            edge_ratio: self.config.edge_ratio,
        };

        let strongest = raster::max_value(&edges, None);
        if strongest <= 0.0 {
            return Err(no_sphere());
        }

        let points =
            BinaryMask::threshold(&edges, strongest * self.config.edge_ratio, None).points();
        let sphere = raster::min_enclosing_circle(&points).ok_or_else(no_sphere)?;
        if sphere.radius() <= 0.0 {
            return Err(no_sphere());
        }

        info!(
            x = sphere.center().x,
            y = sphere.center().y,
            radius = sphere.radius(),
            edge_pixels = points.len(),
            "located mirror ball"
        );
        Ok(sphere)
    }

    /// Finds the reflection of a single light on the ball.
    ///
    /// The region with the largest enclosing circle wins. On equal radii the
    /// region found first in raster order wins.
    pub fn locate_reflection(
        &self,
        frame: &GrayFrame,
        sphere: &Circle,
    ) -> Result<Reflection, RejectionReason> {
        let max_value = raster::max_value(frame, Some(sphere));
        if max_value < self.config.black_threshold {
            return Err(RejectionReason::BlackFrame { max_value });
        }

        let mut circles: Vec<Circle> =
            BinaryMask::threshold(frame, self.config.threshold, Some(sphere))
                .regions()
                .iter()
                .filter_map(|region| raster::min_enclosing_circle(region))
                .collect();

        let winner = circles
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (index, circle)| match best {
                Some((_, radius)) if radius >= circle.radius() => best,
                _ => Some((index, circle.radius())),
            })
            .map(|(index, _)| index)
            .ok_or(RejectionReason::NoReflection {
                threshold: self.config.threshold,
            })?;
        let circle = circles.remove(winner);

        let min_radius = self.config.min_size_ratio * sphere.radius();
        if circle.radius() < min_radius {
            return Err(RejectionReason::TooSmall {
                radius: circle.radius(),
                min_radius,
            });
        }

        let offset = circle.center() - sphere.center();
        Ok(Reflection {
            circle,
            uv: Vector2::new(offset.x, -offset.y) / sphere.radius(),
            discarded: circles,
        })
    }

    /// Calibrates every light in `frames` against the ball found in `mask`.
    ///
    /// Failing to find the ball aborts the run. Frames without a usable reflection
    /// are logged and reported in [`CalibrationReport::rejections`].
    pub fn solve<'a, I>(&self, mask: &GrayFrame, frames: I) -> Result<CalibrationReport, Error>
    where
        I: IntoIterator<Item = (u32, &'a GrayFrame)>,
    {
        let sphere = self.locate_sphere(mask)?;
        let viewing_angle_half = Angle::new::<degree>(self.config.viewing_angle_half_deg);

        let mut calibration = Calibration::new();
        let mut reflections = Vec::new();
        let mut rejections = Vec::new();

        for (id, frame) in frames {
            if frame.dimensions() != mask.dimensions() {
                return Err(Error::DimensionMismatch {
                    expected_width: mask.width(),
                    expected_height: mask.height(),
                    expected_channels: 1,
                    width: frame.width(),
                    height: frame.height(),
                    channels: 1,
                });
            }

            match self.locate_reflection(frame, &sphere) {
                Ok(reflection) => {
                    debug!(
                        id,
                        u = reflection.uv.x,
                        v = reflection.uv.y,
                        radius = reflection.circle.radius(),
                        discarded = reflection.discarded.len(),
                        "accepted reflection"
                    );
                    calibration.add_light(
                        id,
                        LightDirection::from_mirror_reflection(reflection.uv, viewing_angle_half),
                        Some(reflection.uv),
                    );
                    reflections.push((id, reflection));
                }
                Err(reason) => {
                    warn!(id, ?reason, "rejected light sample");
                    rejections.push(Rejection { id, reason });
                }
            }
        }

        if calibration.is_empty() {
            warn!(
                rejected = rejections.len(),
                "no light produced a usable reflection, calibration is empty"
            );
        } else {
            info!(
                accepted = calibration.len(),
                rejected = rejections.len(),
                "calibration finished"
            );
        }

        Ok(CalibrationReport {
            calibration,
            sphere,
            reflections,
            rejections,
        })
    }
}
