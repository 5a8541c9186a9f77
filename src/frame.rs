use crate::error::{MeasureError, Result};
use image::{DynamicImage, ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

/// Linear-intensity pixel grid backing a [`Frame`].
pub type IntensityImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Fraction of full-scale pixels above which a decoded image is marked saturated.
const SATURATION_FRACTION: f64 = 0.001;

/// Clipping state reported by acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipFlags {
    pub saturated: bool,
    pub black_clipped: bool,
}

impl ClipFlags {
    pub fn any(&self) -> bool {
        self.saturated || self.black_clipped
    }
}

/// Axis-aligned pixel rectangle, `x`/`y` being the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn fits(&self, frame_width: u32, frame_height: u32) -> bool {
        (self.x as u64 + self.width as u64) <= frame_width as u64
            && (self.y as u64 + self.height as u64) <= frame_height as u64
    }
}

/// Circular band in frame coordinates used to mask a [`RoiView`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Annulus {
    pub cx: f64,
    pub cy: f64,
    pub inner: f64,
    pub outer: f64,
}

impl Annulus {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let d2 = (x - self.cx).powi(2) + (y - self.cy).powi(2);
        d2 >= self.inner * self.inner && d2 <= self.outer * self.outer
    }

    /// Smallest rectangle holding the annulus, or `None` when it leaves the frame.
    pub fn bounding_roi(&self, frame_width: u32, frame_height: u32) -> Option<Roi> {
        let x0 = (self.cx - self.outer).floor();
        let y0 = (self.cy - self.outer).floor();
        let x1 = (self.cx + self.outer).ceil();
        let y1 = (self.cy + self.outer).ceil();
        if x0 < 0.0 || y0 < 0.0 || x1 >= frame_width as f64 || y1 >= frame_height as f64 {
            return None;
        }
        Some(Roi::new(
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32 + 1,
            (y1 - y0) as u32 + 1,
        ))
    }
}

/// An immutable captured image: linear intensities plus acquisition metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: IntensityImage,
    pixel_pitch: f64,
    bit_depth: u8,
    clip: ClipFlags,
}

impl Frame {
    /// Wraps row-major linear intensities. `pixel_pitch` is the sampling
    /// distance in the caller's length unit (e.g. mm per pixel).
    pub fn new(
        width: u32,
        height: u32,
        data: Vec<f32>,
        pixel_pitch: f64,
        bit_depth: u8,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(MeasureError::InvalidFrame {
                reason: format!("empty frame {width}x{height}"),
            });
        }
        if !(pixel_pitch.is_finite() && pixel_pitch > 0.0) {
            return Err(MeasureError::InvalidFrame {
                reason: format!("pixel pitch must be positive, got {pixel_pitch}"),
            });
        }
        let len = data.len();
        let pixels = ImageBuffer::from_raw(width, height, data).ok_or_else(|| {
            MeasureError::InvalidFrame {
                reason: format!("{len} samples do not fill a {width}x{height} frame"),
            }
        })?;

        Ok(Self {
            pixels,
            pixel_pitch,
            bit_depth,
            clip: ClipFlags::default(),
        })
    }

    /// Converts a decoded image to a luma frame scaled to [0, 1].
    /// Saturation is detected from full-scale pixels; black clipping is left to
    /// the caller because dark backgrounds are legitimate in target images.
    pub fn from_image(img: &DynamicImage, pixel_pitch: f64) -> Result<Self> {
        let color = img.color();
        let bit_depth = (color.bits_per_pixel() / color.channel_count() as u16) as u8;
        let luma = img.to_luma32f();
        let (width, height) = luma.dimensions();

        let full_scale = luma.as_raw().iter().filter(|&&v| v >= 1.0).count();
        let saturated = full_scale as f64 > SATURATION_FRACTION * luma.as_raw().len() as f64;

        let frame = Self::new(width, height, luma.into_raw(), pixel_pitch, bit_depth)?;
        Ok(frame.with_clip_flags(ClipFlags {
            saturated,
            black_clipped: false,
        }))
    }

    pub fn with_clip_flags(mut self, clip: ClipFlags) -> Self {
        self.clip = clip;
        self
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixel_pitch(&self) -> f64 {
        self.pixel_pitch
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    pub fn clip_flags(&self) -> ClipFlags {
        self.clip
    }

    pub fn as_raw(&self) -> &[f32] {
        self.pixels.as_raw()
    }

    pub fn image(&self) -> &IntensityImage {
        &self.pixels
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f64 {
        self.pixels.get_pixel(x, y)[0] as f64
    }

    /// Borrows a rectangular region, failing if any part lies outside the frame.
    pub fn roi(&self, roi: Roi) -> Result<RoiView<'_>> {
        if roi.width == 0 || roi.height == 0 {
            return Err(MeasureError::degenerate(format!(
                "ROI {}x{} has no pixels",
                roi.width, roi.height
            )));
        }
        if !roi.fits(self.width(), self.height()) {
            return Err(MeasureError::GeometryOutOfBounds {
                what: "ROI".to_string(),
                min_x: roi.x as f64,
                max_x: roi.x as f64 + roi.width as f64 - 1.0,
                min_y: roi.y as f64,
                max_y: roi.y as f64 + roi.height as f64 - 1.0,
                width: self.width(),
                height: self.height(),
            });
        }
        Ok(RoiView {
            frame: self,
            roi,
            mask: None,
        })
    }

    pub fn full_view(&self) -> RoiView<'_> {
        RoiView {
            frame: self,
            roi: Roi::new(0, 0, self.width(), self.height()),
            mask: None,
        }
    }

    /// View over the bounding box of `annulus`, masked to the band itself.
    pub fn annulus_view(&self, annulus: Annulus) -> Result<RoiView<'_>> {
        let roi = annulus
            .bounding_roi(self.width(), self.height())
            .ok_or_else(|| MeasureError::GeometryOutOfBounds {
                what: "annulus".to_string(),
                min_x: annulus.cx - annulus.outer,
                max_x: annulus.cx + annulus.outer,
                min_y: annulus.cy - annulus.outer,
                max_y: annulus.cy + annulus.outer,
                width: self.width(),
                height: self.height(),
            })?;
        let mut view = self.roi(roi)?;
        view.mask = Some(annulus);
        Ok(view)
    }
}

/// Borrowed window into a [`Frame`]; coordinates are local to the window.
#[derive(Debug, Clone, Copy)]
pub struct RoiView<'a> {
    frame: &'a Frame,
    roi: Roi,
    mask: Option<Annulus>,
}

impl<'a> RoiView<'a> {
    pub fn frame(&self) -> &'a Frame {
        self.frame
    }

    pub fn roi(&self) -> Roi {
        self.roi
    }

    pub fn width(&self) -> u32 {
        self.roi.width
    }

    pub fn height(&self) -> u32 {
        self.roi.height
    }

    pub fn clip_flags(&self) -> ClipFlags {
        self.frame.clip
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f64 {
        self.frame.get(self.roi.x + x, self.roi.y + y)
    }

    /// Whether a local pixel takes part in masked statistics.
    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        match &self.mask {
            None => true,
            Some(annulus) => annulus.contains(
                (self.roi.x + x) as f64,
                (self.roi.y + y) as f64,
            ),
        }
    }

    /// Row-major copy of the window, ignoring any mask.
    pub fn to_vec(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity((self.roi.width * self.roi.height) as usize);
        for y in 0..self.roi.height {
            for x in 0..self.roi.width {
                out.push(self.get(x, y));
            }
        }
        out
    }
}
