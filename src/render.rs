//! Relighting from a fitted [`CoefficientField`].

use crate::{
    basis::{Basis, Projection},
    direction::LightDirection,
    error::Error,
    field::CoefficientField,
};
use image::{DynamicImage, Rgb, Rgb32FImage};
use nalgebra::Vector3;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use tracing::debug;
use uom::si::{angle::radian, f64::Angle};

/// Albedo below which a normal is not trusted.
const DEGENERATE_ALBEDO: f32 = 1e-6;

const LUMINANCE: [f32; 3] = [0.2126, 0.7152, 0.0722];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct HdriConfig {
    /// Samples per side of the grid laid over the unit disk.
    pub grid: usize,
}

impl Default for HdriConfig {
    fn default() -> Self {
        Self { grid: 16 }
    }
}

/// An equirectangular environment map.
///
/// The top row looks straight up, the bottom row straight down and the center
/// column towards the camera.
#[derive(Clone, Debug)]
pub struct EnvironmentMap {
    image: Rgb32FImage,
}

impl EnvironmentMap {
    pub fn new(image: Rgb32FImage) -> Self {
        Self { image }
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        Self::new(image.to_rgb32f())
    }

    /// Nearest neighbour lookup of the radiance arriving from `direction`.
    pub fn radiance(&self, direction: &LightDirection) -> [f32; 3] {
        let (width, height) = self.image.dimensions();
        if width == 0 || height == 0 {
            return [0.0; 3];
        }

        let lat_long = direction.lat_long();
        let u = (lat_long.longitude().get::<radian>() + PI) / (2.0 * PI);
        let v = (FRAC_PI_2 - lat_long.latitude().get::<radian>()) / PI;
        let x = ((u * width as f64) as u32).min(width - 1);
        let y = ((v * height as f64) as u32).min(height - 1);
        self.image.get_pixel(x, y).0
    }
}

/// A relit image, channel interleaved in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedImage {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub pixels: Vec<f32>,
}

impl RenderedImage {
    pub fn value(&self, x: u32, y: u32, channel: usize) -> f32 {
        self.pixels[(y as usize * self.width as usize + x as usize) * self.channels + channel]
    }

    /// A float RGB image. Single channel renders are replicated into grey.
    pub fn to_dynamic(&self) -> DynamicImage {
        DynamicImage::ImageRgb32F(Rgb32FImage::from_fn(self.width, self.height, |x, y| {
            match self.channels {
                1 => {
                    let value = self.value(x, y, 0);
                    Rgb([value, value, value])
                }
                _ => Rgb([self.value(x, y, 0), self.value(x, y, 1), self.value(x, y, 2)]),
            }
        }))
    }
}

/// Normals recovered from a field fitted with [`Basis::Normal`].
#[derive(Clone, Debug, PartialEq)]
pub struct NormalMap {
    pub width: u32,
    pub height: u32,

    /// Unit normals, zero where degenerate.
    pub normals: Vec<Vector3<f32>>,

    /// Length of the fitted vector before normalization.
    pub albedo: Vec<f32>,

    /// Pixels whose albedo was too small to give a direction.
    pub degenerate: Vec<bool>,
}

impl NormalMap {
    /// Normals mapped from [-1, 1] onto [0, 1] per component.
    pub fn to_image(&self) -> Rgb32FImage {
        Rgb32FImage::from_fn(self.width, self.height, |x, y| {
            let n = self.normals[(y * self.width + x) as usize];
            Rgb([(n.x + 1.0) / 2.0, (n.y + 1.0) / 2.0, (n.z + 1.0) / 2.0])
        })
    }
}

/// Evaluates a coefficient field under new lighting.
#[derive(Clone, Debug)]
pub struct Reconstructor<'a> {
    field: &'a CoefficientField,
    projection: Projection,
}

impl<'a> Reconstructor<'a> {
    pub fn new(field: &'a CoefficientField) -> Result<Self, Error> {
        Ok(Self {
            projection: field.projection()?,
            field,
        })
    }

    /// The image under a single light from `direction`.
    pub fn render_light(&self, direction: &LightDirection) -> RenderedImage {
        let row = self.projection.row(direction);
        let row: &[f64] = &row;
        self.render_with(|_| row, self.field.metadata().channels)
    }

    fn render_with<'r, F>(&self, weights: F, channels: usize) -> RenderedImage
    where
        F: Fn(usize) -> &'r [f64] + Sync,
    {
        let (width, height) = (self.field.width(), self.field.height());
        let field_channels = self.field.metadata().channels.max(1);

        let mut pixels = vec![0.0f32; width as usize * height as usize * channels];
        pixels
            .par_chunks_mut((width as usize * channels).max(1))
            .enumerate()
            .for_each(|(y, row)| {
                for (x, pixel) in row.chunks_mut(channels).enumerate() {
                    for (channel, out) in pixel.iter_mut().enumerate() {
                        let coefficients = self.field.coefficients(
                            x as u32,
                            y as u32,
                            channel.min(field_channels - 1),
                        );
                        let value: f64 = coefficients
                            .iter()
                            .zip(weights(channel))
                            .map(|(c, w)| *c as f64 * w)
                            .sum();
                        *out = value.max(0.0) as f32;
                    }
                }
            });

        RenderedImage {
            width,
            height,
            channels,
            pixels,
        }
    }

    /// Approximates the image under `environment` rotated about the vertical axis.
    ///
    /// Light directions are sampled on a `grid x grid` lattice over the unit disk,
    /// the orthographic projection of the hemisphere facing the camera, so samples
    /// are denser towards the view axis. Each basis function is integrated against
    /// the environment once and every pixel then needs a single dot product per
    /// channel. The result always has three channels.
    pub fn render_hdri(
        &self,
        environment: &EnvironmentMap,
        rotation: Angle,
        config: &HdriConfig,
    ) -> RenderedImage {
        let count = self.projection.coefficient_count();
        let grid = config.grid.max(1);

        let mut weights = vec![vec![0.0f64; count]; 3];
        let mut row = vec![0.0f64; count];
        let mut samples = 0usize;
        for j in 0..grid {
            for i in 0..grid {
                let u = (2.0 * i as f64 + 1.0) / grid as f64 - 1.0;
                let v = 1.0 - (2.0 * j as f64 + 1.0) / grid as f64;
                let r2 = u * u + v * v;
                if r2 >= 1.0 {
                    continue;
                }

                let xyz = Vector3::new(u, v, -(1.0 - r2).sqrt());
                let Ok(direction) = LightDirection::from_xyz(xyz) else {
                    continue;
                };
                let radiance = environment.radiance(&direction.rotated_about_vertical(rotation));
                self.projection.fill_row(&mut row, &direction);
                for (channel, weights) in weights.iter_mut().enumerate() {
                    for (weight, value) in weights.iter_mut().zip(&row) {
                        *weight += radiance[channel] as f64 * value;
                    }
                }
                samples += 1;
            }
        }

        if samples > 0 {
            weights
                .iter_mut()
                .flatten()
                .for_each(|weight| *weight /= samples as f64);
        }
        debug!(
            samples,
            rotation = rotation.get::<radian>(),
            "integrated environment"
        );

        let weights = &weights;
        self.render_with(move |channel| weights[channel].as_slice(), 3)
    }

    /// Unit normals and albedo of a field fitted with [`Basis::Normal`].
    ///
    /// Color fields are reduced to luminance first.
    pub fn normal_map(&self) -> Result<NormalMap, Error> {
        let metadata = self.field.metadata();
        if metadata.basis != Basis::Normal {
            return Err(Error::UnsupportedBasisConfiguration {
                basis: metadata.basis.to_string(),
                coordinate_system: metadata.coordinate_system.to_string(),
            });
        }

        let (width, height) = (self.field.width(), self.field.height());
        let channels = metadata.channels;
        let vectors: Vec<Vector3<f32>> = (0..height)
            .into_par_iter()
            .flat_map_iter(|y| {
                (0..width).map(move |x| {
                    (0..channels)
                        .map(|channel| {
                            let weight = match channels {
                                3 => LUMINANCE[channel],
                                _ => 1.0 / channels as f32,
                            };
                            Vector3::from_column_slice(self.field.coefficients(x, y, channel))
                                * weight
                        })
                        .sum::<Vector3<f32>>()
                })
            })
            .collect();

        let albedo: Vec<f32> = vectors.iter().map(|n| n.norm()).collect();
        let degenerate: Vec<bool> = albedo.iter().map(|a| *a < DEGENERATE_ALBEDO).collect();
        let normals = vectors
            .iter()
            .zip(&degenerate)
            .map(|(n, degenerate)| match degenerate {
                true => Vector3::zeros(),
                false => n.normalize(),
            })
            .collect();

        Ok(NormalMap {
            width,
            height,
            normals,
            albedo,
            degenerate,
        })
    }
}
