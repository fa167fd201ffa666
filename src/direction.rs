//! Light directions and the coordinate systems they are fitted in.
//!
//! Directions live in a camera-aligned frame:
//!
//! ```text
//!          +y (up)
//!           |
//!           |
//!           +------ +x (right)
//!          /
//!         /
//!       -z (towards the camera)
//! ```
//!
//! A light sitting at the camera has direction `(0, 0, -1)` and lights behind the
//! object have a positive `z` component.

use crate::error::Error;
use nalgebra::{Vector2, Vector3};
use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::OnceLock;
use uom::si::{angle::radian, f64::Angle};

/// Components below this are treated as zero when deciding if a direction sits on a pole.
const POLE_EPSILON: f64 = 1e-12;

/// Norms this close to one are treated as already normalized.
const UNIT_EPSILON: f64 = 1e-12;

/// Latitude and longitude of a [`LightDirection`].
///
/// Latitude is measured from the horizontal plane towards +y and lies on
/// [-PI/2, PI/2]. Longitude is measured around the vertical axis from the camera
/// direction towards +x and lies on (-PI, PI].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatLong {
    latitude: Angle,
    longitude: Angle,
}

impl LatLong {
    pub fn new(latitude: Angle, longitude: Angle) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn from_radians(latitude: f64, longitude: f64) -> Self {
        Self::new(
            Angle::new::<radian>(latitude),
            Angle::new::<radian>(longitude),
        )
    }

    pub fn latitude(&self) -> Angle {
        self.latitude
    }

    pub fn longitude(&self) -> Angle {
        self.longitude
    }
}

/// A unit vector pointing from the object towards a light.
///
/// The lat-long and zenith vector forms are derived on first access and cached.
/// All three forms describe the same direction.
#[derive(Clone, Debug)]
pub struct LightDirection {
    xyz: Vector3<f64>,
    lat_long: OnceLock<LatLong>,
    zenith: OnceLock<Vector2<f64>>,
}

impl LightDirection {
    fn from_unit(xyz: Vector3<f64>) -> Self {
        Self {
            xyz,
            lat_long: OnceLock::new(),
            zenith: OnceLock::new(),
        }
    }

    /// Creates a direction from any non-zero vector.
    pub fn from_xyz(xyz: Vector3<f64>) -> Result<Self, Error> {
        let norm = xyz.norm();
        if norm <= POLE_EPSILON || !norm.is_finite() {
            return Err(Error::ZeroVector);
        }

        // Vectors that are already unit length are kept bit for bit so that
        // persisted directions keep their calibration fingerprint.
        match (norm - 1.0).abs() <= UNIT_EPSILON {
            true => Ok(Self::from_unit(xyz)),
            false => Ok(Self::from_unit(xyz / norm)),
        }
    }

    /// Maps a reflection seen on a mirror ball to the direction of the light that caused it.
    ///
    /// `uv` is the offset of the reflection from the ball center divided by the ball
    /// radius, with `v` pointing up. The ball normal at the reflection makes an angle
    /// `asin(|uv|)` with the view axis and the light sits at twice that angle.
    ///
    /// `viewing_angle_half` corrects for a camera that is not infinitely far away by
    /// scaling the angle with `(PI - viewing_angle_half) / PI`. Zero gives the
    /// orthographic approximation. Offsets outside the ball are clamped to the rim.
    pub fn from_mirror_reflection(uv: Vector2<f64>, viewing_angle_half: Angle) -> Self {
        let r = uv.norm();
        if r <= POLE_EPSILON {
            return Self::from_unit(Vector3::new(0.0, 0.0, -1.0));
        }

        let correction = (PI - viewing_angle_half.get::<radian>()) / PI;
        let angle = 2.0 * r.min(1.0).asin() * correction;
        let (sin, cos) = angle.sin_cos();
        let planar = uv / r;

        Self::from_unit(Vector3::new(sin * planar.x, sin * planar.y, -cos))
    }

    /// Exact inverse of [`LightDirection::lat_long`].
    pub fn from_lat_long(lat_long: LatLong) -> Self {
        let (sin_lat, cos_lat) = lat_long.latitude.get::<radian>().sin_cos();
        let (sin_long, cos_long) = lat_long.longitude.get::<radian>().sin_cos();
        let direction = Self::from_unit(Vector3::new(
            cos_lat * sin_long,
            sin_lat,
            -cos_lat * cos_long,
        ));
        let _ = direction.lat_long.set(lat_long);
        direction
    }

    /// Exact inverse of [`LightDirection::zenith_vector`].
    pub fn from_zenith_vector(zenith: Vector2<f64>) -> Self {
        let zenith_angle = zenith.norm();
        if zenith_angle <= POLE_EPSILON {
            return Self::from_unit(Vector3::new(0.0, 1.0, 0.0));
        }

        Self::from_lat_long(LatLong::from_radians(
            FRAC_PI_2 - zenith_angle,
            zenith.x.atan2(zenith.y),
        ))
    }

    pub fn xyz(&self) -> &Vector3<f64> {
        &self.xyz
    }

    pub fn x(&self) -> f64 {
        self.xyz.x
    }

    /// The vertical component.
    pub fn y(&self) -> f64 {
        self.xyz.y
    }

    pub fn z(&self) -> f64 {
        self.xyz.z
    }

    fn on_pole(&self) -> bool {
        self.xyz.x.abs() <= POLE_EPSILON && self.xyz.z.abs() <= POLE_EPSILON
    }

    /// Longitude in radians, wrapped into (-PI, PI].
    ///
    /// Directions behind the vertical axis (`z > 0`) land beyond +/- PI/2.
    fn longitude(&self) -> f64 {
        match self.on_pole() {
            true => 0.0,
            // atan2 gives -PI for x = -0.0 behind the object.
            false => match self.xyz.x.atan2(-self.xyz.z) {
                longitude if longitude <= -PI => PI,
                longitude => longitude,
            },
        }
    }

    pub fn lat_long(&self) -> LatLong {
        *self.lat_long.get_or_init(|| {
            LatLong::from_radians(self.xyz.y.clamp(-1.0, 1.0).asin(), self.longitude())
        })
    }

    /// Lat-long scaled onto [-1, 1] as `(longitude / PI, latitude / (PI / 2))`.
    pub fn normalized_lat_long(&self) -> Vector2<f64> {
        let lat_long = self.lat_long();
        Vector2::new(
            lat_long.longitude.get::<radian>() / PI,
            lat_long.latitude.get::<radian>() / FRAC_PI_2,
        )
    }

    /// A 2D encoding whose length is the angle from straight up and whose
    /// orientation is the longitude.
    ///
    /// The north pole maps to the zero vector and the south pole to `(0, PI)`.
    pub fn zenith_vector(&self) -> Vector2<f64> {
        *self.zenith.get_or_init(|| {
            if self.on_pole() {
                return match self.xyz.y > 0.0 {
                    true => Vector2::zeros(),
                    false => Vector2::new(0.0, PI),
                };
            }

            let zenith_angle = self.xyz.y.clamp(-1.0, 1.0).acos();
            let (sin_long, cos_long) = self.longitude().sin_cos();
            Vector2::new(zenith_angle * sin_long, zenith_angle * cos_long)
        })
    }

    /// The zenith vector divided by PI so that it lies in the unit disk.
    pub fn normalized_zenith_vector(&self) -> Vector2<f64> {
        self.zenith_vector() / PI
    }

    /// Rotates the direction about the vertical axis by `angle`.
    pub fn rotated_about_vertical(&self, angle: Angle) -> Self {
        let (sin, cos) = angle.get::<radian>().sin_cos();
        Self::from_unit(Vector3::new(
            cos * self.xyz.x - sin * self.xyz.z,
            self.xyz.y,
            sin * self.xyz.x + cos * self.xyz.z,
        ))
    }
}

impl PartialEq for LightDirection {
    fn eq(&self, other: &Self) -> bool {
        self.xyz == other.xyz
    }
}

impl TryFrom<[f64; 3]> for LightDirection {
    type Error = Error;

    fn try_from(xyz: [f64; 3]) -> Result<Self, Self::Error> {
        Self::from_xyz(Vector3::from(xyz))
    }
}

impl From<&LightDirection> for [f64; 3] {
    fn from(direction: &LightDirection) -> Self {
        direction.xyz.into()
    }
}
