//! Per-pixel basis functions and the coordinates they are evaluated at.

use crate::{direction::LightDirection, error::Error};
use nalgebra::{Vector2, Vector3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI, SQRT_2};
use std::fmt;
use uom::si::angle::radian;

/// The family of functions fitted to every pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(tag = "kind", rename_all = "snake_case")
)]
pub enum Basis {
    /// Bivariate polynomial of total `degree` in a 2D coordinate system.
    Polynomial { degree: usize },

    /// Real spherical harmonics up to band `degree`, evaluated at latitude and longitude.
    SphericalHarmonics { degree: usize },

    /// The light direction itself, giving an albedo scaled normal.
    Normal,
}

impl Basis {
    pub fn coefficient_count(&self) -> usize {
        match self {
            Basis::Polynomial { degree } => (degree + 1) * (degree + 2) / 2,
            Basis::SphericalHarmonics { degree } => (degree + 1) * (degree + 1),
            Basis::Normal => 3,
        }
    }

    /// Returns `true` if this basis can be fitted in `coordinate_system`.
    pub fn supports(&self, coordinate_system: CoordinateSystem) -> bool {
        matches!(
            (self, coordinate_system),
            (
                Basis::Polynomial { .. },
                CoordinateSystem::LatLong | CoordinateSystem::ZenithVector
            ) | (Basis::SphericalHarmonics { .. }, CoordinateSystem::LatLong)
                | (Basis::Normal, CoordinateSystem::Xyz)
        )
    }

    /// Lights this basis can learn from.
    ///
    /// A normal facing the camera cannot be informed by a light below the horizon.
    pub fn accepts(&self, direction: &LightDirection) -> bool {
        match self {
            Basis::Normal => direction.y() > 0.0,
            _ => true,
        }
    }

    /// Writes the basis functions evaluated at `input` into `row`.
    ///
    /// `row` must hold at least [`Basis::coefficient_count`] values and `input`
    /// must be the kind [`Projection::input`] produces for this basis.
    pub fn fill_row(&self, row: &mut [f64], input: &BasisInput) {
        match (self, input) {
            (Basis::Polynomial { degree }, BasisInput::Planar(uv)) => {
                fill_polynomial(row, *degree, uv.x, uv.y)
            }
            (Basis::SphericalHarmonics { .. }, BasisInput::Spherical { latitude, longitude }) => {
                let theta = FRAC_PI_2 - latitude;
                for (k, value) in row.iter_mut().take(self.coefficient_count()).enumerate() {
                    let l = (k as f64).sqrt().floor() as i64;
                    let m = k as i64 - l * (l + 1);
                    *value = real_spherical_harmonic(l, m, theta, *longitude);
                }
            }
            (Basis::Normal, BasisInput::Cartesian(xyz)) => {
                row[..3].copy_from_slice(xyz.as_slice());
            }
            // Projection::input always pairs a basis with its own input kind.
            _ => {
                debug_assert!(false, "{self} cannot be evaluated at {input:?}");
                row.iter_mut().for_each(|value| *value = 0.0)
            }
        }
    }

    pub fn evaluate(&self, input: &BasisInput) -> Vec<f64> {
        let mut row = vec![0.0; self.coefficient_count()];
        self.fill_row(&mut row, input);
        row
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Basis::Polynomial { degree } => write!(f, "polynomial(degree {degree})"),
            Basis::SphericalHarmonics { degree } => {
                write!(f, "spherical_harmonics(degree {degree})")
            }
            Basis::Normal => write!(f, "normal"),
        }
    }
}

/// How a light direction is turned into basis input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum CoordinateSystem {
    LatLong,
    ZenithVector,
    Xyz,
}

impl fmt::Display for CoordinateSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinateSystem::LatLong => write!(f, "lat_long"),
            CoordinateSystem::ZenithVector => write!(f, "zenith_vector"),
            CoordinateSystem::Xyz => write!(f, "xyz"),
        }
    }
}

/// A direction expressed in the input domain of a basis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BasisInput {
    /// A point in a 2D coordinate system, scaled onto [-1, 1] by [`Bounds`].
    Planar(Vector2<f64>),

    /// Latitude and longitude in radians.
    Spherical { latitude: f64, longitude: f64 },

    Cartesian(Vector3<f64>),
}

/// Bounding box of the fitted lights in a 2D coordinate system.
///
/// Polynomial inputs are rescaled so that this box maps onto [-1, 1], which keeps
/// the design matrix well conditioned when the lights only cover part of the
/// sphere. It is stored with the coefficients so that reconstruction applies the
/// same rescaling.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Bounds {
    pub min: [f64; 2],
    pub max: [f64; 2],
}

impl Bounds {
    /// The box that leaves coordinates unchanged.
    pub fn unit() -> Self {
        Self {
            min: [-1.0, -1.0],
            max: [1.0, 1.0],
        }
    }

    /// The smallest box around `points`, or the unit box if there are none.
    pub fn enclosing(points: impl IntoIterator<Item = Vector2<f64>>) -> Self {
        points
            .into_iter()
            .fold(None, |bounds: Option<Self>, point| {
                Some(match bounds {
                    None => Self {
                        min: [point.x, point.y],
                        max: [point.x, point.y],
                    },
                    Some(b) => Self {
                        min: [b.min[0].min(point.x), b.min[1].min(point.y)],
                        max: [b.max[0].max(point.x), b.max[1].max(point.y)],
                    },
                })
            })
            .unwrap_or_else(Self::unit)
    }

    pub fn normalize(&self, point: Vector2<f64>) -> Vector2<f64> {
        let scale = |value: f64, axis: usize| {
            let span = self.max[axis] - self.min[axis];
            match span > 1e-12 {
                true => 2.0 * (value - self.min[axis]) / span - 1.0,
                false => 0.0,
            }
        };
        Vector2::new(scale(point.x, 0), scale(point.y, 1))
    }
}

/// A validated basis and coordinate system pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    basis: Basis,
    coordinate_system: CoordinateSystem,
    bounds: Bounds,
}

impl Projection {
    /// Fails with [`Error::UnsupportedBasisConfiguration`] for pairs that cannot be fitted.
    pub fn new(basis: Basis, coordinate_system: CoordinateSystem) -> Result<Self, Error> {
        if !basis.supports(coordinate_system) {
            return Err(Error::UnsupportedBasisConfiguration {
                basis: basis.to_string(),
                coordinate_system: coordinate_system.to_string(),
            });
        }

        Ok(Self {
            basis,
            coordinate_system,
            bounds: Bounds::unit(),
        })
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Fits the bounds to the planar coordinates of `directions`.
    ///
    /// Only polynomial inputs are rescaled; other bases keep the unit bounds.
    pub fn fitted_to<'a>(self, directions: impl IntoIterator<Item = &'a LightDirection>) -> Self {
        match self.basis {
            Basis::Polynomial { .. } => {
                let bounds = Bounds::enclosing(directions.into_iter().map(|d| self.planar(d)));
                self.with_bounds(bounds)
            }
            _ => self,
        }
    }

    pub fn basis(&self) -> Basis {
        self.basis
    }

    pub fn coordinate_system(&self) -> CoordinateSystem {
        self.coordinate_system
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn coefficient_count(&self) -> usize {
        self.basis.coefficient_count()
    }

    fn planar(&self, direction: &LightDirection) -> Vector2<f64> {
        match self.coordinate_system {
            CoordinateSystem::ZenithVector => direction.normalized_zenith_vector(),
            _ => direction.normalized_lat_long(),
        }
    }

    pub fn input(&self, direction: &LightDirection) -> BasisInput {
        match self.basis {
            Basis::Polynomial { .. } => {
                BasisInput::Planar(self.bounds.normalize(self.planar(direction)))
            }
            Basis::SphericalHarmonics { .. } => {
                let lat_long = direction.lat_long();
                BasisInput::Spherical {
                    latitude: lat_long.latitude().get::<radian>(),
                    longitude: lat_long.longitude().get::<radian>(),
                }
            }
            Basis::Normal => BasisInput::Cartesian(*direction.xyz()),
        }
    }

    pub fn fill_row(&self, row: &mut [f64], direction: &LightDirection) {
        self.basis.fill_row(row, &self.input(direction));
    }

    pub fn row(&self, direction: &LightDirection) -> Vec<f64> {
        let mut row = vec![0.0; self.coefficient_count()];
        self.fill_row(&mut row, direction);
        row
    }
}

fn fill_polynomial(row: &mut [f64], degree: usize, u: f64, v: f64) {
    row[0] = 1.0;
    if degree == 0 {
        return;
    }

    row[1] = u;
    row[2] = v;
    let mut index = 3;
    for n in 2..=degree {
        for i in 0..=n {
            row[index] = u.powi((n - i) as i32) * v.powi(i as i32);
            index += 1;
        }
    }
}

/// Orthonormal real spherical harmonic of band `l` and order `m` at polar angle
/// `theta` and azimuth `phi`. Negative orders use sine, positive orders cosine.
fn real_spherical_harmonic(l: i64, m: i64, theta: f64, phi: f64) -> f64 {
    let order = m.unsigned_abs() as i64;
    let legendre = associated_legendre(l, order, theta.cos());
    let k = normalization(l, order);
    match m {
        0 => k * legendre,
        m if m > 0 => SQRT_2 * k * (m as f64 * phi).cos() * legendre,
        _ => SQRT_2 * k * (order as f64 * phi).sin() * legendre,
    }
}

fn normalization(l: i64, m: i64) -> f64 {
    // (l - m)! / (l + m)!
    let ratio = ((l - m + 1)..=(l + m)).fold(1.0, |acc, k| acc / k as f64);
    ((2 * l + 1) as f64 / (4.0 * PI) * ratio).sqrt()
}

/// P_l^m(x) for m >= 0, including the Condon-Shortley phase.
fn associated_legendre(l: i64, m: i64, x: f64) -> f64 {
    let mut pmm = 1.0;
    if m > 0 {
        let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
        let mut fact = 1.0;
        for _ in 0..m {
            pmm *= -fact * somx2;
            fact += 2.0;
        }
    }
    if l == m {
        return pmm;
    }

    let mut pmmp1 = x * (2 * m + 1) as f64 * pmm;
    if l == m + 1 {
        return pmmp1;
    }

    let mut pll = 0.0;
    for ll in (m + 2)..=l {
        pll = ((2 * ll - 1) as f64 * x * pmmp1 - (ll + m - 1) as f64 * pmm) / (ll - m) as f64;
        pmm = pmmp1;
        pmmp1 = pll;
    }
    pll
}
