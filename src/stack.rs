//! Decoded light frames keyed by light id.

use crate::error::Error;
use image::DynamicImage;
use std::collections::BTreeMap;
use tracing::warn;

/// Whether samples are still gamma encoded or already linear.
///
/// The fitter treats both the same way; the tag only records what the caller provided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorDomain {
    Encoded,
    Linear,
}

/// One frame of an [`ImageStack`], channel interleaved in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct LightImage {
    pixels: Vec<f32>,
    domain: ColorDomain,
}

impl LightImage {
    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn domain(&self) -> ColorDomain {
        self.domain
    }
}

/// Same resolution frames, one per light id.
#[derive(Clone, Debug)]
pub struct ImageStack {
    width: u32,
    height: u32,
    channels: usize,
    images: BTreeMap<u32, LightImage>,
}

impl ImageStack {
    pub fn new(width: u32, height: u32, channels: usize) -> Result<Self, Error> {
        if channels != 1 && channels != 3 {
            return Err(Error::InvalidChannels { channels });
        }

        Ok(Self {
            width,
            height,
            channels,
            images: BTreeMap::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Adds the frame for light `id`, replacing any previous one.
    ///
    /// `pixels` must hold `width * height * channels` samples.
    pub fn insert(&mut self, id: u32, pixels: Vec<f32>, domain: ColorDomain) -> Result<(), Error> {
        let expected = self.width as usize * self.height as usize * self.channels;
        if pixels.len() != expected {
            return Err(Error::DimensionMismatch {
                expected_width: self.width,
                expected_height: self.height,
                expected_channels: self.channels,
                width: self.width,
                height: (pixels.len() / (self.width as usize * self.channels).max(1)) as u32,
                channels: self.channels,
            });
        }

        if let Some((other, image)) = self.images.iter().find(|(_, image)| image.domain != domain) {
            warn!(
                id,
                other = *other,
                ?domain,
                other_domain = ?image.domain,
                "mixing color domains in one image stack"
            );
        }

        self.images.insert(id, LightImage { pixels, domain });
        Ok(())
    }

    /// Converts a decoded image to floating point samples on [0, 1] and adds it.
    ///
    /// 8 and 16 bit images are tagged [`ColorDomain::Encoded`], float images
    /// [`ColorDomain::Linear`].
    pub fn insert_image(&mut self, id: u32, image: &DynamicImage) -> Result<(), Error> {
        if image.width() != self.width || image.height() != self.height {
            return Err(Error::DimensionMismatch {
                expected_width: self.width,
                expected_height: self.height,
                expected_channels: self.channels,
                width: image.width(),
                height: image.height(),
                channels: image.color().channel_count() as usize,
            });
        }

        let domain = match image {
            DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => ColorDomain::Linear,
            _ => ColorDomain::Encoded,
        };

        let pixels = match self.channels {
            1 => image.to_luma32f().into_raw(),
            _ => image.to_rgb32f().into_raw(),
        };
        self.insert(id, pixels, domain)
    }

    pub fn get(&self, id: u32) -> Option<&LightImage> {
        self.images.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.images.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &LightImage)> {
        self.images.iter().map(|(id, image)| (*id, image))
    }

    /// Sample of light `id` at pixel (`x`, `y`) and channel `channel`.
    pub fn value(&self, id: u32, x: u32, y: u32, channel: usize) -> Option<f32> {
        let index = (y as usize * self.width as usize + x as usize) * self.channels + channel;
        self.images.get(&id)?.pixels.get(index).copied()
    }
}

/// Light id encoded as the trailing digits of a file stem, e.g. `dome_042` is 42.
pub fn light_id_from_stem(stem: &str) -> Option<u32> {
    let digits = stem.len() - stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    stem[stem.len() - digits..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::{Rgb, RgbImage};
    use rstest::rstest;

    #[rstest]
    #[case("dome_042", Some(42))]
    #[case("17", Some(17))]
    #[case("mask", None)]
    #[case("light3b", None)]
    fn light_ids_from_stems(#[case] stem: &str, #[case] id: Option<u32>) {
        assert_eq!(light_id_from_stem(stem), id);
    }

    #[test]
    fn rejects_unusual_channel_counts() {
        assert!(matches!(
            ImageStack::new(4, 4, 2),
            Err(Error::InvalidChannels { channels: 2 })
        ));
    }

    #[test]
    fn rejects_short_buffers() {
        let mut stack = ImageStack::new(4, 2, 3).unwrap();
        let result = stack.insert(0, vec![0.0; 12], ColorDomain::Linear);
        assert!(matches!(result, Err(Error::DimensionMismatch { .. })));
        assert!(stack.is_empty());
    }

    #[test]
    fn rejects_other_resolution() {
        let mut stack = ImageStack::new(4, 4, 3).unwrap();
        let image = DynamicImage::ImageRgb8(RgbImage::new(5, 4));
        assert!(matches!(
            stack.insert_image(1, &image),
            Err(Error::DimensionMismatch { width: 5, .. })
        ));
    }

    #[test]
    fn decoded_images_are_interleaved() {
        let mut image = RgbImage::new(2, 2);
        image.put_pixel(1, 0, Rgb([255, 0, 51]));
        let mut stack = ImageStack::new(2, 2, 3).unwrap();
        stack.insert_image(7, &DynamicImage::ImageRgb8(image)).unwrap();

        assert_eq!(stack.value(7, 1, 0, 0), Some(1.0));
        assert_eq!(stack.value(7, 1, 0, 1), Some(0.0));
        assert_abs_diff_eq!(stack.value(7, 1, 0, 2).unwrap(), 0.2, epsilon = 1e-6);
        assert_eq!(stack.get(7).unwrap().domain(), ColorDomain::Encoded);
        assert_eq!(stack.value(8, 0, 0, 0), None);
    }

    #[test]
    fn ids_are_sorted() {
        let mut stack = ImageStack::new(1, 1, 1).unwrap();
        for id in [9, 2, 5] {
            stack.insert(id, vec![id as f32], ColorDomain::Linear).unwrap();
        }
        assert_eq!(stack.ids().collect::<Vec<_>>(), vec![2, 5, 9]);
        assert_eq!(stack.value(5, 0, 0, 0), Some(5.0));
    }
}
