//! Per-pixel coefficients and their image based storage.

use crate::{
    basis::{Basis, Bounds, CoordinateSystem, Projection},
    error::Error,
    raster::GrayFrame,
};
use image::{Luma, Rgb, Rgb32FImage};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::Path,
};
#[cfg(feature = "serde")]
use tracing::debug;

/// Describes how the coefficients of a [`CoefficientField`] were fitted.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldMetadata {
    #[cfg_attr(feature = "serde", serde(rename = "fitter"))]
    pub basis: Basis,
    pub coordinate_system: CoordinateSystem,
    pub channels: usize,
    pub coefficient_count: usize,
    pub bounds: Bounds,
}

impl FieldMetadata {
    pub fn new(projection: &Projection, channels: usize) -> Self {
        Self {
            basis: projection.basis(),
            coordinate_system: projection.coordinate_system(),
            channels,
            coefficient_count: projection.coefficient_count(),
            bounds: projection.bounds(),
        }
    }

    /// The projection the coefficients have to be evaluated with.
    ///
    /// A `coefficient_count` that disagrees with the basis is [`Error::DataMismatch`].
    pub fn projection(&self) -> Result<Projection, Error> {
        let projection =
            Projection::new(self.basis, self.coordinate_system)?.with_bounds(self.bounds);
        if projection.coefficient_count() != self.coefficient_count {
            return Err(Error::DataMismatch {
                expected: projection.coefficient_count(),
                found: self.coefficient_count,
            });
        }
        Ok(projection)
    }
}

/// How coefficients are spread over images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum PackingLayout {
    /// Three coefficients per RGB image, `ceil(count / 3)` images per channel.
    /// Unused slots of the last image are zero.
    Rgb,

    /// One coefficient per single channel image, `count` images per channel.
    Luma,
}

impl PackingLayout {
    fn slots(&self) -> usize {
        match self {
            PackingLayout::Rgb => 3,
            PackingLayout::Luma => 1,
        }
    }

    /// Number of images holding `metadata`'s coefficients.
    pub fn image_count(&self, metadata: &FieldMetadata) -> usize {
        metadata.channels * metadata.coefficient_count.div_ceil(self.slots())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CoefficientImage {
    Rgb(Rgb32FImage),
    Luma(GrayFrame),
}

impl CoefficientImage {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            CoefficientImage::Rgb(image) => image.dimensions(),
            CoefficientImage::Luma(image) => image.dimensions(),
        }
    }

    fn slot(&self, x: u32, y: u32, slot: usize) -> f32 {
        match self {
            CoefficientImage::Rgb(image) => image.get_pixel(x, y).0[slot],
            CoefficientImage::Luma(image) if slot == 0 => image.get_pixel(x, y).0[0],
            CoefficientImage::Luma(_) => 0.0,
        }
    }

    /// The image as RGB, replicating a single channel.
    pub fn to_rgb(&self) -> Rgb32FImage {
        match self {
            CoefficientImage::Rgb(image) => image.clone(),
            CoefficientImage::Luma(image) => Rgb32FImage::from_fn(image.width(), image.height(), |x, y| {
                let value = image.get_pixel(x, y).0[0];
                Rgb([value, value, value])
            }),
        }
    }
}

/// Fitted coefficients for every pixel and channel.
///
/// The coefficients of pixel (`x`, `y`) and channel `c` are the `coefficient_count`
/// values starting at `((y * width + x) * channels + c) * coefficient_count`.
#[derive(Clone, Debug, PartialEq)]
pub struct CoefficientField {
    width: u32,
    height: u32,
    metadata: FieldMetadata,
    data: Vec<f32>,
}

impl CoefficientField {
    pub fn new(
        width: u32,
        height: u32,
        metadata: FieldMetadata,
        data: Vec<f32>,
    ) -> Result<Self, Error> {
        let expected = width as usize
            * height as usize
            * metadata.channels
            * metadata.coefficient_count;
        if data.len() != expected {
            return Err(Error::DataMismatch {
                expected,
                found: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            metadata,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn metadata(&self) -> &FieldMetadata {
        &self.metadata
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn projection(&self) -> Result<Projection, Error> {
        self.metadata.projection()
    }

    /// Coefficients of one pixel and channel.
    pub fn coefficients(&self, x: u32, y: u32, channel: usize) -> &[f32] {
        let count = self.metadata.coefficient_count;
        let start = ((y as usize * self.width as usize + x as usize) * self.metadata.channels
            + channel)
            * count;
        &self.data[start..start + count]
    }

    /// Spreads the coefficients over images, channel by channel.
    pub fn to_images(&self, layout: PackingLayout) -> Vec<CoefficientImage> {
        let count = self.metadata.coefficient_count;
        let slots = layout.slots();
        let per_channel = count.div_ceil(slots);

        let mut images = Vec::with_capacity(layout.image_count(&self.metadata));
        for channel in 0..self.metadata.channels {
            for index in 0..per_channel {
                let value = |x: u32, y: u32, slot: usize| {
                    let k = index * slots + slot;
                    match k < count {
                        true => self.coefficients(x, y, channel)[k],
                        false => 0.0,
                    }
                };

                images.push(match layout {
                    PackingLayout::Rgb => CoefficientImage::Rgb(Rgb32FImage::from_fn(
                        self.width,
                        self.height,
                        |x, y| Rgb([value(x, y, 0), value(x, y, 1), value(x, y, 2)]),
                    )),
                    PackingLayout::Luma => CoefficientImage::Luma(GrayFrame::from_fn(
                        self.width,
                        self.height,
                        |x, y| Luma([value(x, y, 0)]),
                    )),
                });
            }
        }
        images
    }

    /// Inverse of [`CoefficientField::to_images`].
    ///
    /// Fails with [`Error::DataMismatch`] if the number of images does not match
    /// what `metadata` and `layout` require.
    pub fn from_images(
        metadata: FieldMetadata,
        layout: PackingLayout,
        width: u32,
        height: u32,
        images: &[CoefficientImage],
    ) -> Result<Self, Error> {
        let expected = layout.image_count(&metadata);
        if images.len() != expected {
            return Err(Error::DataMismatch {
                expected,
                found: images.len(),
            });
        }

        if let Some(image) = images.iter().find(|image| image.dimensions() != (width, height)) {
            let (found_width, found_height) = image.dimensions();
            return Err(Error::DimensionMismatch {
                expected_width: width,
                expected_height: height,
                expected_channels: layout.slots(),
                width: found_width,
                height: found_height,
                channels: layout.slots(),
            });
        }

        let count = metadata.coefficient_count;
        let channels = metadata.channels;
        let slots = layout.slots();
        let per_channel = count.div_ceil(slots);

        let mut data = Vec::with_capacity(width as usize * height as usize * channels * count);
        for y in 0..height {
            for x in 0..width {
                for channel in 0..channels {
                    data.extend((0..count).map(|k| {
                        images[channel * per_channel + k / slots].slot(x, y, k % slots)
                    }));
                }
            }
        }

        Self::new(width, height, metadata, data)
    }
}

#[cfg(feature = "serde")]
const METADATA_FILE: &str = "metadata.json";

#[cfg(feature = "serde")]
#[derive(Serialize, Deserialize)]
struct MetadataFile {
    #[serde(flatten)]
    metadata: FieldMetadata,
    layout: PackingLayout,
    width: u32,
    height: u32,
}

#[cfg(feature = "serde")]
fn image_path(dir: &Path, index: usize) -> std::path::PathBuf {
    dir.join(format!("coefficients_{index:03}.exr"))
}

#[cfg(feature = "serde")]
impl CoefficientField {
    /// Writes `metadata.json` and one `coefficients_NNN.exr` per packed image into `dir`.
    ///
    /// Single channel images are stored as grey RGB. Coefficient images left in
    /// `dir` by an earlier, larger field are removed.
    pub fn save(&self, dir: impl AsRef<Path>, layout: PackingLayout) -> Result<(), Error> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let images = self.to_images(layout);
        for (index, image) in images.iter().enumerate() {
            image.to_rgb().save(image_path(dir, index))?;
        }

        let mut stale = images.len();
        while image_path(dir, stale).exists() {
            fs::remove_file(image_path(dir, stale))?;
            stale += 1;
        }
        if stale > images.len() {
            debug!(removed = stale - images.len(), "removed stale coefficient images");
        }

        let mut writer = BufWriter::new(File::create(dir.join(METADATA_FILE))?);
        serde_json::to_writer_pretty(
            &mut writer,
            &MetadataFile {
                metadata: self.metadata,
                layout,
                width: self.width,
                height: self.height,
            },
        )?;
        writer.flush()?;

        debug!(dir = %dir.display(), images = images.len(), "saved coefficients");
        Ok(())
    }

    /// Reads a field written by [`CoefficientField::save`].
    ///
    /// Exactly the images `metadata.json` calls for are read. A missing one, or
    /// metadata that contradicts its own basis, is [`Error::DataMismatch`].
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref();
        let file: MetadataFile =
            serde_json::from_reader(BufReader::new(File::open(dir.join(METADATA_FILE))?))?;
        file.metadata.projection()?;

        let expected = file.layout.image_count(&file.metadata);
        let mut images = Vec::with_capacity(expected);
        for index in 0..expected {
            let path = image_path(dir, index);
            if !path.exists() {
                return Err(Error::DataMismatch {
                    expected,
                    found: index,
                });
            }

            let rgb = image::open(path)?.into_rgb32f();
            images.push(match file.layout {
                PackingLayout::Rgb => CoefficientImage::Rgb(rgb),
                PackingLayout::Luma => CoefficientImage::Luma(GrayFrame::from_fn(
                    rgb.width(),
                    rgb.height(),
                    |x, y| Luma([rgb.get_pixel(x, y).0[0]]),
                )),
            });
        }

        debug!(dir = %dir.display(), images = images.len(), "loaded coefficients");
        Self::from_images(file.metadata, file.layout, file.width, file.height, &images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(count: usize, channels: usize) -> CoefficientField {
        let metadata = FieldMetadata {
            basis: Basis::Polynomial { degree: 2 },
            coordinate_system: CoordinateSystem::LatLong,
            channels,
            coefficient_count: count,
            bounds: Bounds::unit(),
        };
        let data = (0..3 * 2 * channels * count).map(|i| i as f32).collect();
        CoefficientField::new(3, 2, metadata, data).unwrap()
    }

    #[test]
    fn data_length_is_checked() {
        let metadata = field(6, 1).metadata;
        assert!(matches!(
            CoefficientField::new(3, 2, metadata, vec![0.0; 5]),
            Err(Error::DataMismatch {
                expected: 36,
                found: 5
            })
        ));
    }

    #[test]
    fn coefficients_are_pixel_major() {
        let field = field(6, 3);
        assert_eq!(field.coefficients(1, 0, 2), &[30.0, 31.0, 32.0, 33.0, 34.0, 35.0]);
    }

    #[test]
    fn rgb_layout_pads_last_image() {
        let field = field(4, 1);
        let images = field.to_images(PackingLayout::Rgb);
        assert_eq!(images.len(), 2);
        let CoefficientImage::Rgb(second) = &images[1] else {
            panic!("expected an rgb image");
        };
        assert_eq!(second.get_pixel(0, 0).0, [3.0, 0.0, 0.0]);
    }

    #[test]
    fn images_restore_field() {
        for layout in [PackingLayout::Rgb, PackingLayout::Luma] {
            let field = field(6, 3);
            let images = field.to_images(layout);
            assert_eq!(images.len(), layout.image_count(field.metadata()));
            let restored =
                CoefficientField::from_images(field.metadata, layout, 3, 2, &images).unwrap();
            assert_eq!(restored, field);
        }
    }

    #[test]
    fn missing_image_is_data_mismatch() {
        let field = field(6, 3);
        let mut images = field.to_images(PackingLayout::Rgb);
        images.pop();
        assert!(matches!(
            CoefficientField::from_images(field.metadata, PackingLayout::Rgb, 3, 2, &images),
            Err(Error::DataMismatch {
                expected: 6,
                found: 5
            })
        ));
    }

    #[test]
    fn count_must_match_basis() {
        let mut metadata = field(6, 1).metadata;
        assert!(metadata.projection().is_ok());

        metadata.coefficient_count = 3;
        assert!(matches!(
            metadata.projection(),
            Err(Error::DataMismatch {
                expected: 6,
                found: 3
            })
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn metadata_names_fitter() {
        let json = serde_json::to_string(field(6, 1).metadata()).unwrap();
        insta::assert_snapshot!(
            json,
            @r#"{"fitter":{"kind":"polynomial","degree":2},"coordinate_system":"lat_long","channels":1,"coefficient_count":6,"bounds":{"min":[-1.0,-1.0],"max":[1.0,1.0]}}"#
        );
    }
}
