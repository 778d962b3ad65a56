//! Pixel access consumed by measurement tasks.
//!
//! Decoding image files is left to the caller; tasks only see [`ImageSource`].

use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("Pixel ({x}, {y}) is outside a {width}x{height} image")]
    OutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    },
    #[error("Expected {expected} pixels, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

pub type ImageResult<T> = Result<T, ImageError>;

pub trait ImageSource<T: Copy>: Send + Sync {
    fn width(&self) -> usize;

    fn height(&self) -> usize;

    fn value(&self, x: usize, y: usize) -> ImageResult<T>;

    /// Copies the `width` x `height` window starting at (`x`, `y`).
    fn tile(
        &self,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> ImageResult<VectorImage<T>> {
        check_window(x, y, width, height, self.width(), self.height())?;

        let mut pixels = Vec::with_capacity(width * height);
        for row in y..y + height {
            for col in x..x + width {
                pixels.push(self.value(col, row)?);
            }
        }
        VectorImage::from_pixels(width, height, pixels)
    }
}

fn check_window(
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    image_width: usize,
    image_height: usize,
) -> ImageResult<()> {
    let right = x.checked_add(width).filter(|&right| right <= image_width);
    let bottom = y.checked_add(height).filter(|&bottom| bottom <= image_height);
    if right.is_none() || bottom.is_none() {
        return Err(ImageError::OutOfBounds {
            x: x.saturating_add(width.saturating_sub(1)),
            y: y.saturating_add(height.saturating_sub(1)),
            width: image_width,
            height: image_height,
        });
    }
    Ok(())
}

/// Row-major in-memory image.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorImage<T> {
    pixels: Vec<T>,
    width: usize,
    height: usize,
}

impl<T> VectorImage<T> {
    pub fn from_pixels(width: usize, height: usize, pixels: Vec<T>) -> ImageResult<Self> {
        if pixels.len() != width * height {
            return Err(ImageError::SizeMismatch {
                expected: width * height,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    #[inline]
    pub fn pixels(&self) -> &[T] {
        &self.pixels
    }

    #[inline]
    fn offset(&self, x: usize, y: usize) -> ImageResult<usize> {
        if x >= self.width || y >= self.height {
            return Err(ImageError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(y * self.width + x)
    }

    pub fn set(&mut self, x: usize, y: usize, value: T) -> ImageResult<()> {
        let offset = self.offset(x, y)?;
        self.pixels[offset] = value;
        Ok(())
    }
}

impl<T: Clone> VectorImage<T> {
    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Self {
            pixels: vec![value; width * height],
            width,
            height,
        }
    }
}

impl<T: Send> VectorImage<T> {
    /// Builds the image row by row in parallel.
    pub fn from_fn<F>(width: usize, height: usize, f: F) -> Self
    where
        F: Fn(usize, usize) -> T + Sync,
    {
        let mut rows: Vec<Vec<T>> = Vec::with_capacity(height);
        (0..height)
            .into_par_iter()
            .map(|y| (0..width).map(|x| f(x, y)).collect())
            .collect_into_vec(&mut rows);

        Self {
            pixels: rows.into_iter().flatten().collect(),
            width,
            height,
        }
    }
}

impl<T: Copy + Send + Sync> ImageSource<T> for VectorImage<T> {
    #[inline]
    fn width(&self) -> usize {
        self.width
    }

    #[inline]
    fn height(&self) -> usize {
        self.height
    }

    #[inline]
    fn value(&self, x: usize, y: usize) -> ImageResult<T> {
        Ok(self.pixels[self.offset(x, y)?])
    }

    fn tile(
        &self,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> ImageResult<VectorImage<T>> {
        check_window(x, y, width, height, self.width, self.height)?;

        let pixels = self
            .pixels
            .chunks_exact(self.width.max(1))
            .skip(y)
            .take(height)
            .flat_map(|row| row[x..x + width].iter().copied())
            .collect();
        VectorImage::from_pixels(width, height, pixels)
    }
}
