//! Light id to direction mappings.

#[cfg(feature = "serde")]
pub mod file;
pub mod solver;

use crate::direction::LightDirection;
use nalgebra::{Vector2, Vector3};
use std::collections::BTreeMap;
use tracing::debug;

/// Added to the distance from the ball center before inverting it into a merge weight.
const MERGE_EPSILON: f64 = 0.05;

/// A light's calibrated direction and, when it came from a mirror ball, where its
/// reflection was seen.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibratedLight {
    direction: LightDirection,
    uv: Option<Vector2<f64>>,
}

impl CalibratedLight {
    pub fn new(direction: LightDirection, uv: Option<Vector2<f64>>) -> Self {
        Self { direction, uv }
    }

    pub fn direction(&self) -> &LightDirection {
        &self.direction
    }

    /// Offset of the reflection from the ball center in ball radii.
    pub fn uv(&self) -> Option<Vector2<f64>> {
        self.uv
    }

    /// Weight of this sample when merging sessions.
    ///
    /// Reflections near the ball center are measured more reliably than ones near the rim.
    fn merge_weight(&self) -> f64 {
        match self.uv {
            Some(uv) => 1.0 / (uv.norm() + MERGE_EPSILON),
            None => 1.0,
        }
    }
}

/// Calibrated lights ordered by id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Calibration {
    lights: BTreeMap<u32, CalibratedLight>,
    min_id: Option<u32>,
    max_id: Option<u32>,
}

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the light with `id`, returning the light it replaced.
    pub fn add_light(
        &mut self,
        id: u32,
        direction: LightDirection,
        uv: Option<Vector2<f64>>,
    ) -> Option<CalibratedLight> {
        self.min_id = Some(self.min_id.map_or(id, |min| min.min(id)));
        self.max_id = Some(self.max_id.map_or(id, |max| max.max(id)));
        self.lights.insert(id, CalibratedLight::new(direction, uv))
    }

    pub fn get(&self, id: u32) -> Option<&CalibratedLight> {
        self.lights.get(&id)
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    /// Smallest and largest light id.
    pub fn id_bounds(&self) -> Option<(u32, u32)> {
        Some((self.min_id?, self.max_id?))
    }

    /// Lights in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &CalibratedLight)> {
        self.lights.iter().map(|(id, light)| (*id, light))
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.lights.keys().copied()
    }

    /// A copy holding only the lights accepted by `predicate`.
    pub fn filtered<P>(&self, mut predicate: P) -> Self
    where
        P: FnMut(u32, &LightDirection) -> bool,
    {
        let mut filtered = Self::new();
        for (id, light) in self.iter() {
            if predicate(id, light.direction()) {
                filtered.add_light(id, light.direction.clone(), light.uv);
            }
        }
        filtered
    }

    /// Identity of the ids and directions, used to tell whether a cached
    /// pseudoinverse still belongs to this calibration.
    ///
    /// FNV-1a over the ids and the bit patterns of the directions, so it is stable
    /// across processes and can be persisted.
    pub fn fingerprint(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        let mut feed = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(PRIME);
            }
        };

        for (id, light) in self.iter() {
            feed(&id.to_le_bytes());
            for component in light.direction.xyz().iter() {
                feed(&component.to_bits().to_le_bytes());
            }
        }

        hash
    }

    /// Stitches calibrations from several capture sessions.
    ///
    /// Every id present in any input appears in the output. Directions sharing an id
    /// are averaged, each weighted by the inverse of its distance from the ball
    /// center, and renormalized.
    pub fn merge<'a, I>(calibrations: I) -> Self
    where
        I: IntoIterator<Item = &'a Calibration>,
    {
        let mut sums: BTreeMap<u32, (Vector3<f64>, Option<Vector2<f64>>, f64, usize)> =
            BTreeMap::new();

        for calibration in calibrations {
            for (id, light) in calibration.iter() {
                let weight = light.merge_weight();
                let entry = sums
                    .entry(id)
                    .or_insert((Vector3::zeros(), Some(Vector2::zeros()), 0.0, 0));
                entry.0 += light.direction.xyz() * weight;
                entry.1 = match (entry.1, light.uv) {
                    (Some(sum), Some(uv)) => Some(sum + uv * weight),
                    _ => None,
                };
                entry.2 += weight;
                entry.3 += 1;
            }
        }

        let mut merged = Self::new();
        for (id, (xyz, uv, weight, samples)) in sums {
            // Opposing samples can cancel out, in which case the id is dropped.
            match LightDirection::from_xyz(xyz) {
                Ok(direction) => {
                    debug!(id, samples, "merged light");
                    merged.add_light(id, direction, uv.map(|uv| uv / weight));
                }
                Err(_) => debug!(id, samples, "dropped light whose samples cancel out"),
            }
        }

        merged
    }
}

impl FromIterator<(u32, LightDirection)> for Calibration {
    fn from_iter<T: IntoIterator<Item = (u32, LightDirection)>>(iter: T) -> Self {
        let mut calibration = Self::new();
        for (id, direction) in iter {
            calibration.add_light(id, direction, None);
        }
        calibration
    }
}
