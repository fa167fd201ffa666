//! Least squares fit of a [`Basis`] to every pixel of an [`ImageStack`].
//!
//! For `n` lights and `c` basis functions the design matrix `A` is `n x c`, one
//! row of basis values per light. Each pixel's coefficients are `pinv(A) * b` where
//! `b` holds that pixel's `n` samples. The pseudoinverse only depends on the
//! calibration, so a [`Fitter`] computes it once and reuses it for every pixel and
//! every stack fitted against the same calibration.

use crate::{
    basis::{Basis, CoordinateSystem, Projection},
    calibration::Calibration,
    direction::LightDirection,
    error::Error,
    field::{CoefficientField, FieldMetadata},
    stack::ImageStack,
};
use nalgebra::DMatrix;
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info, warn};

/// Rec. 709 luminance weights.
const LUMINANCE: [f64; 3] = [0.2126, 0.7152, 0.0722];

/// An optional predicate over lights, applied on top of the basis' own filter.
pub type LightFilter<'a> = &'a (dyn Fn(u32, &LightDirection) -> bool + Sync);

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct FitterConfig {
    /// Fit a single luminance channel instead of every color channel.
    pub grayscale: bool,

    /// Number of image rows processed per slice.
    pub slice_rows: u32,

    /// Singular values below this are treated as zero by the pseudoinverse.
    pub pinv_epsilon: f64,
}

impl Default for FitterConfig {
    fn default() -> Self {
        Self {
            grayscale: false,
            slice_rows: 64,
            pinv_epsilon: 1e-10,
        }
    }
}

/// The design matrix and its pseudoinverse for one calibration.
#[derive(Clone, Debug)]
pub struct Pseudoinverse {
    light_ids: Vec<u32>,
    directions: Vec<LightDirection>,
    design: DMatrix<f64>,
    inverse: DMatrix<f64>,
    fingerprint: u64,
    projection: Projection,
}

impl Pseudoinverse {
    /// Ids of the lights the matrices were built from, in row order of the design matrix.
    pub fn light_ids(&self) -> &[u32] {
        &self.light_ids
    }

    pub fn design(&self) -> &DMatrix<f64> {
        &self.design
    }

    /// `coefficient_count x lights`.
    pub fn inverse(&self) -> &DMatrix<f64> {
        &self.inverse
    }

    /// Fingerprint of the calibration this was computed from.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// The projection with its bounds fitted to these lights.
    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn is_underdetermined(&self) -> bool {
        self.light_ids.len() < self.projection.coefficient_count()
    }
}

/// What a call to [`Fitter::compute_coefficients`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitSummary {
    pub lights_used: usize,
    pub coefficient_count: usize,

    /// Fewer lights than coefficients. The minimum norm solution was used.
    pub underdetermined: bool,

    pub slices: usize,
}

/// Lights and the matrix mapping their samples onto coefficients.
struct Plan {
    light_ids: Vec<u32>,
    inverse: DMatrix<f64>,
}

/// A fitting session for one basis and coordinate system.
///
/// The session owns the pseudoinverse of the last calibration it saw and only
/// recomputes it when asked to or when handed a different calibration.
#[derive(Clone, Debug)]
pub struct Fitter {
    projection: Projection,
    config: FitterConfig,
    cache: Option<Pseudoinverse>,
}

impl Fitter {
    /// Fails before any work if `basis` cannot be fitted in `coordinate_system`.
    pub fn new(
        basis: Basis,
        coordinate_system: CoordinateSystem,
        config: FitterConfig,
    ) -> Result<Self, Error> {
        Ok(Self {
            projection: Projection::new(basis, coordinate_system)?,
            config,
            cache: None,
        })
    }

    pub fn basis(&self) -> Basis {
        self.projection.basis()
    }

    pub fn coordinate_system(&self) -> CoordinateSystem {
        self.projection.coordinate_system()
    }

    pub fn config(&self) -> &FitterConfig {
        &self.config
    }

    pub fn coefficient_count(&self) -> usize {
        self.projection.coefficient_count()
    }

    /// Writes the design matrix row for `direction`.
    ///
    /// Uses the bounds of the cached pseudoinverse if there is one.
    pub fn fill_light_matrix_row(&self, row: &mut [f64], direction: &LightDirection) {
        self.active_projection().fill_row(row, direction);
    }

    fn active_projection(&self) -> &Projection {
        self.cache
            .as_ref()
            .map_or(&self.projection, |cache| &cache.projection)
    }

    /// The cached pseudoinverse.
    pub fn inverse(&self) -> Result<&Pseudoinverse, Error> {
        self.cache.as_ref().ok_or(Error::MissingInverse)
    }

    /// Builds the design matrix for the lights of `calibration` the basis accepts
    /// and computes its pseudoinverse.
    ///
    /// The cached pseudoinverse is reused when `recompute` is `false` and it was
    /// computed from an identical calibration.
    pub fn compute_inverse(
        &mut self,
        calibration: &Calibration,
        recompute: bool,
    ) -> Result<&Pseudoinverse, Error> {
        let fingerprint = calibration.fingerprint();
        let reusable = self
            .cache
            .as_ref()
            .is_some_and(|cache| cache.fingerprint == fingerprint);

        if recompute || !reusable {
            self.cache = Some(self.build_inverse(calibration, fingerprint)?);
        } else {
            debug!(fingerprint, "reusing cached pseudoinverse");
        }

        self.inverse()
    }

    fn build_inverse(
        &self,
        calibration: &Calibration,
        fingerprint: u64,
    ) -> Result<Pseudoinverse, Error> {
        let basis = self.basis();
        let usable = calibration.filtered(|_, direction| basis.accepts(direction));
        if usable.is_empty() {
            return Err(Error::EmptyCalibration {
                total: calibration.len(),
                filtered: calibration.len(),
            });
        }

        let light_ids: Vec<u32> = usable.ids().collect();
        let directions: Vec<LightDirection> = usable
            .iter()
            .map(|(_, light)| light.direction().clone())
            .collect();
        let projection = self.projection.fitted_to(directions.iter());

        let design = design_matrix(&projection, &directions);
        let inverse = design
            .clone()
            .pseudo_inverse(self.config.pinv_epsilon)
            .map_err(Error::Pseudoinverse)?;

        let pseudoinverse = Pseudoinverse {
            light_ids,
            directions,
            design,
            inverse,
            fingerprint,
            projection,
        };

        if pseudoinverse.is_underdetermined() {
            warn!(
                lights = pseudoinverse.light_ids.len(),
                coefficients = projection.coefficient_count(),
                "fewer lights than coefficients, fit is underdetermined"
            );
        }

        info!(
            basis = %basis,
            coordinate_system = %self.coordinate_system(),
            lights = pseudoinverse.light_ids.len(),
            filtered = calibration.len() - pseudoinverse.light_ids.len(),
            fingerprint,
            "computed pseudoinverse"
        );
        Ok(pseudoinverse)
    }

    /// Applies `filter` to the cached lights, computing a pseudoinverse for the
    /// subset if it removes any.
    fn plan(&self, filter: Option<LightFilter>) -> Result<Plan, Error> {
        let cache = self.inverse()?;
        let Some(filter) = filter else {
            return Ok(Plan {
                light_ids: cache.light_ids.clone(),
                inverse: cache.inverse.clone(),
            });
        };

        let kept: Vec<usize> = cache
            .light_ids
            .iter()
            .zip(&cache.directions)
            .enumerate()
            .filter(|(_, (id, direction))| filter(**id, *direction))
            .map(|(row, _)| row)
            .collect();

        if kept.len() == cache.light_ids.len() {
            return Ok(Plan {
                light_ids: cache.light_ids.clone(),
                inverse: cache.inverse.clone(),
            });
        }
        if kept.is_empty() {
            return Err(Error::EmptyCalibration {
                total: cache.light_ids.len(),
                filtered: cache.light_ids.len(),
            });
        }

        debug!(
            kept = kept.len(),
            total = cache.light_ids.len(),
            "computing pseudoinverse for filtered lights"
        );
        let inverse = cache
            .design
            .select_rows(kept.iter())
            .pseudo_inverse(self.config.pinv_epsilon)
            .map_err(Error::Pseudoinverse)?;

        Ok(Plan {
            light_ids: kept.iter().map(|row| cache.light_ids[*row]).collect(),
            inverse,
        })
    }

    fn output_channels(&self, stack: &ImageStack) -> usize {
        match self.config.grayscale {
            true => 1,
            false => stack.channels(),
        }
    }

    /// Fits the rows `rows` of `stack`.
    ///
    /// Returns `rows.len() * width * channels * coefficient_count` values in the
    /// layout of [`CoefficientField`]. Fitting slice by slice gives the same values
    /// as a single call over the whole image. Rows past the bottom of `stack` are
    /// [`Error::RowsOutOfRange`].
    pub fn compute_slice(
        &self,
        stack: &ImageStack,
        rows: Range<u32>,
        filter: Option<LightFilter>,
    ) -> Result<Vec<f32>, Error> {
        if rows.start > rows.end || rows.end > stack.height() {
            return Err(Error::RowsOutOfRange {
                start: rows.start,
                end: rows.end,
                height: stack.height(),
            });
        }

        let plan = self.plan(filter)?;
        let images = self.images(stack, &plan)?;
        Ok(self.fit_rows(stack, &plan, &images, rows))
    }

    fn images<'a>(&self, stack: &'a ImageStack, plan: &Plan) -> Result<Vec<&'a [f32]>, Error> {
        plan.light_ids
            .iter()
            .map(|id| {
                stack
                    .get(*id)
                    .map(|image| image.pixels())
                    .ok_or(Error::MissingImage { id: *id })
            })
            .collect()
    }

    fn fit_rows(
        &self,
        stack: &ImageStack,
        plan: &Plan,
        images: &[&[f32]],
        rows: Range<u32>,
    ) -> Vec<f32> {
        let width = stack.width() as usize;
        let input_channels = stack.channels();
        let channels = self.output_channels(stack);
        let count = plan.inverse.nrows();
        let grayscale = channels == 1 && input_channels == 3;

        let row_len = width * channels * count;
        let mut out = vec![0.0f32; rows.len() * row_len];
        out.par_chunks_mut(row_len.max(1))
            .enumerate()
            .for_each(|(offset, row)| {
                let y = rows.start as usize + offset;
                let mut samples = vec![0.0f64; images.len()];
                for x in 0..width {
                    let pixel = (y * width + x) * input_channels;
                    for channel in 0..channels {
                        for (sample, image) in samples.iter_mut().zip(images) {
                            *sample = match grayscale {
                                true => LUMINANCE
                                    .iter()
                                    .enumerate()
                                    .map(|(c, weight)| weight * image[pixel + c] as f64)
                                    .sum(),
                                false => image[pixel + channel] as f64,
                            };
                        }

                        let base = (x * channels + channel) * count;
                        for (k, coefficient) in row[base..base + count].iter_mut().enumerate() {
                            *coefficient = plan
                                .inverse
                                .row(k)
                                .iter()
                                .zip(&samples)
                                .map(|(weight, sample)| weight * sample)
                                .sum::<f64>() as f32;
                        }
                    }
                }
            });
        out
    }

    /// Fits every pixel of `stack` using the cached pseudoinverse.
    ///
    /// `filter` removes further lights. Every light that is used must have an image
    /// in `stack`.
    pub fn compute_coefficients(
        &self,
        stack: &ImageStack,
        filter: Option<LightFilter>,
    ) -> Result<(CoefficientField, FitSummary), Error> {
        let plan = self.plan(filter)?;
        let images = self.images(stack, &plan)?;
        let projection = *self.active_projection();

        let (width, height) = (stack.width(), stack.height());
        let channels = self.output_channels(stack);
        let count = projection.coefficient_count();
        let slice_rows = self.config.slice_rows.max(1);

        let mut data = Vec::with_capacity(width as usize * height as usize * channels * count);
        let mut slices = 0;
        for start in (0..height).step_by(slice_rows as usize) {
            let rows = start..(start + slice_rows).min(height);
            debug!(start = rows.start, end = rows.end, "fitting slice");
            data.extend(self.fit_rows(stack, &plan, &images, rows));
            slices += 1;
        }

        let summary = FitSummary {
            lights_used: plan.light_ids.len(),
            coefficient_count: count,
            underdetermined: plan.light_ids.len() < count,
            slices,
        };
        if summary.underdetermined {
            warn!(
                lights = summary.lights_used,
                coefficients = count,
                "fit is underdetermined, using the minimum norm solution"
            );
        }
        info!(
            width,
            height,
            channels,
            lights = summary.lights_used,
            slices,
            "computed coefficients"
        );

        let metadata = FieldMetadata::new(&projection, channels);
        Ok((
            CoefficientField::new(width, height, metadata, data)?,
            summary,
        ))
    }

    /// The cached pseudoinverse in a form that can be stored with the calibration.
    #[cfg(feature = "serde")]
    pub fn export_inverse(&self) -> Result<InverseRecord, Error> {
        let cache = self.inverse()?;
        Ok(InverseRecord {
            basis: self.basis(),
            coordinate_system: self.coordinate_system(),
            light_ids: cache.light_ids.clone(),
            fingerprint: cache.fingerprint,
            bounds: cache.projection.bounds(),
            inverse: cache
                .inverse
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
        })
    }

    /// Restores a pseudoinverse stored by [`Fitter::export_inverse`].
    ///
    /// Returns `false`, leaving the session untouched, when the record belongs to a
    /// different basis or calibration. A record whose shape does not match its own
    /// light ids is corrupt.
    #[cfg(feature = "serde")]
    pub fn import_inverse(
        &mut self,
        record: &InverseRecord,
        calibration: &Calibration,
    ) -> Result<bool, Error> {
        let fingerprint = calibration.fingerprint();
        if record.basis != self.basis()
            || record.coordinate_system != self.coordinate_system()
            || record.fingerprint != fingerprint
        {
            warn!(
                basis = %record.basis,
                coordinate_system = %record.coordinate_system,
                fingerprint = record.fingerprint,
                expected = fingerprint,
                "stored pseudoinverse is stale"
            );
            return Ok(false);
        }

        let count = self.coefficient_count();
        let lights = record.light_ids.len();
        if record.inverse.len() != count {
            return Err(Error::DataMismatch {
                expected: count,
                found: record.inverse.len(),
            });
        }
        if let Some(row) = record.inverse.iter().find(|row| row.len() != lights) {
            return Err(Error::DataMismatch {
                expected: lights,
                found: row.len(),
            });
        }

        let directions = record
            .light_ids
            .iter()
            .map(|id| {
                calibration
                    .get(*id)
                    .map(|light| light.direction().clone())
                    .ok_or(Error::DataMismatch {
                        expected: lights,
                        found: calibration.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let projection = self.projection.with_bounds(record.bounds);
        self.cache = Some(Pseudoinverse {
            light_ids: record.light_ids.clone(),
            design: design_matrix(&projection, &directions),
            directions,
            inverse: DMatrix::from_row_iterator(
                count,
                lights,
                record.inverse.iter().flatten().copied(),
            ),
            fingerprint,
            projection,
        });
        debug!(lights, fingerprint, "restored pseudoinverse");
        Ok(true)
    }
}

fn design_matrix(projection: &Projection, directions: &[LightDirection]) -> DMatrix<f64> {
    let count = projection.coefficient_count();
    let mut row = vec![0.0; count];
    let mut design = DMatrix::zeros(directions.len(), count);
    for (i, direction) in directions.iter().enumerate() {
        projection.fill_row(&mut row, direction);
        for (k, value) in row.iter().enumerate() {
            design[(i, k)] = *value;
        }
    }
    design
}

/// A pseudoinverse stored in the `fitter` entry of a calibration file.
#[cfg(feature = "serde")]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InverseRecord {
    pub basis: Basis,
    pub coordinate_system: CoordinateSystem,
    pub light_ids: Vec<u32>,
    pub fingerprint: u64,
    pub bounds: crate::basis::Bounds,
    /// Rows of the `coefficient_count x lights` matrix.
    pub inverse: Vec<Vec<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ColorDomain;
    use approx::assert_abs_diff_eq;
    use rstest::rstest;

    fn calibration() -> Calibration {
        [
            [0.0, 0.0, -1.0],
            [0.5, 0.5, -1.0],
            [-0.5, 0.5, -1.0],
            [0.5, -0.5, -1.0],
            [-0.5, -0.5, -1.0],
            [0.0, 0.8, -0.6],
            [0.8, 0.0, -0.6],
        ]
        .into_iter()
        .enumerate()
        .map(|(id, xyz)| (id as u32, LightDirection::try_from(xyz).unwrap()))
        .collect()
    }

    fn polynomial() -> Fitter {
        Fitter::new(
            Basis::Polynomial { degree: 2 },
            CoordinateSystem::LatLong,
            FitterConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn inverse_required_before_fitting() {
        let stack = ImageStack::new(2, 2, 1).unwrap();
        assert!(matches!(
            polynomial().compute_coefficients(&stack, None),
            Err(Error::MissingInverse)
        ));
    }

    #[test]
    fn inverse_has_transposed_shape() {
        let mut fitter = polynomial();
        let inverse = fitter.compute_inverse(&calibration(), false).unwrap();
        assert_eq!(inverse.design().shape(), (7, 6));
        assert_eq!(inverse.inverse().shape(), (6, 7));
        assert!(!inverse.is_underdetermined());

        let identity = inverse.inverse() * inverse.design();
        assert_abs_diff_eq!(identity, DMatrix::identity(6, 6), epsilon = 1e-8);
    }

    #[test]
    fn cache_follows_calibration() {
        let mut fitter = polynomial();
        let calibration = calibration();
        let first = fitter.compute_inverse(&calibration, false).unwrap().fingerprint();
        let again = fitter.compute_inverse(&calibration, false).unwrap().fingerprint();
        assert_eq!(first, again);

        let fewer = calibration.filtered(|id, _| id != 6);
        let other = fitter.compute_inverse(&fewer, false).unwrap();
        assert_ne!(other.fingerprint(), first);
        assert_eq!(other.light_ids().len(), 6);
    }

    #[test]
    fn normal_basis_drops_lights_below_horizon() {
        let mut fitter =
            Fitter::new(Basis::Normal, CoordinateSystem::Xyz, FitterConfig::default()).unwrap();
        let inverse = fitter.compute_inverse(&calibration(), false).unwrap();
        assert_eq!(inverse.light_ids(), &[1, 2, 5]);
    }

    #[test]
    fn no_usable_lights() {
        let mut fitter =
            Fitter::new(Basis::Normal, CoordinateSystem::Xyz, FitterConfig::default()).unwrap();
        let below: Calibration = [(0, LightDirection::try_from([0.0, -1.0, -1.0]).unwrap())]
            .into_iter()
            .collect();
        assert!(matches!(
            fitter.compute_inverse(&below, false),
            Err(Error::EmptyCalibration { total: 1, .. })
        ));
    }

    #[test]
    fn missing_image_is_an_error() {
        let mut fitter = polynomial();
        fitter.compute_inverse(&calibration(), false).unwrap();
        let mut stack = ImageStack::new(1, 1, 1).unwrap();
        for id in 0..6 {
            stack.insert(id, vec![1.0], ColorDomain::Linear).unwrap();
        }
        assert!(matches!(
            fitter.compute_coefficients(&stack, None),
            Err(Error::MissingImage { id: 6 })
        ));
    }

    #[rstest]
    #[case(1..5)]
    #[case(2..3)]
    #[case(Range { start: 2, end: 1 })]
    fn slice_outside_stack_is_rejected(#[case] rows: Range<u32>) {
        let mut fitter = polynomial();
        fitter.compute_inverse(&calibration(), false).unwrap();
        let mut stack = ImageStack::new(3, 2, 1).unwrap();
        for id in 0..7 {
            stack.insert(id, vec![1.0; 6], ColorDomain::Linear).unwrap();
        }

        assert!(matches!(
            fitter.compute_slice(&stack, rows, None),
            Err(Error::RowsOutOfRange { height: 2, .. })
        ));
        assert_eq!(fitter.compute_slice(&stack, 1..2, None).unwrap().len(), 3 * 6);
        assert!(fitter.compute_slice(&stack, 2..2, None).unwrap().is_empty());
    }

    #[test]
    fn grayscale_fits_luminance() {
        let mut fitter = Fitter::new(
            Basis::Polynomial { degree: 0 },
            CoordinateSystem::LatLong,
            FitterConfig {
                grayscale: true,
                ..Default::default()
            },
        )
        .unwrap();
        fitter.compute_inverse(&calibration(), false).unwrap();

        let mut stack = ImageStack::new(1, 1, 3).unwrap();
        for id in 0..7 {
            stack
                .insert(id, vec![1.0, 0.0, 0.0], ColorDomain::Linear)
                .unwrap();
        }
        let (field, summary) = fitter.compute_coefficients(&stack, None).unwrap();
        assert_eq!(field.metadata().channels, 1);
        assert_eq!(summary.coefficient_count, 1);
        assert_abs_diff_eq!(field.coefficients(0, 0, 0)[0], 0.2126, epsilon = 1e-6);
    }

    #[test]
    fn filter_uses_subset_inverse() {
        let mut fitter = polynomial();
        fitter.compute_inverse(&calibration(), false).unwrap();
        let mut stack = ImageStack::new(1, 1, 1).unwrap();
        for id in 0..7 {
            stack.insert(id, vec![1.0], ColorDomain::Linear).unwrap();
        }

        let skip_last = |id: u32, _: &LightDirection| id != 6;
        let (field, summary) = fitter
            .compute_coefficients(&stack, Some(&skip_last))
            .unwrap();
        assert_eq!(summary.lights_used, 6);
        assert!(!summary.underdetermined);
        // A constant image is fitted by the constant term alone.
        assert_abs_diff_eq!(field.coefficients(0, 0, 0)[0], 1.0, epsilon = 1e-5);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn exported_inverse_is_restored() {
        let calibration = calibration();
        let mut fitter = polynomial();
        fitter.compute_inverse(&calibration, false).unwrap();
        let record = fitter.export_inverse().unwrap();

        let mut restored = polynomial();
        assert!(restored.import_inverse(&record, &calibration).unwrap());
        assert_abs_diff_eq!(
            restored.inverse().unwrap().inverse(),
            fitter.inverse().unwrap().inverse(),
            epsilon = 1e-12
        );

        let moved = calibration.filtered(|id, _| id != 0);
        let mut stale = polynomial();
        assert!(!stale.import_inverse(&record, &moved).unwrap());
        assert!(matches!(stale.inverse(), Err(Error::MissingInverse)));
    }
}
