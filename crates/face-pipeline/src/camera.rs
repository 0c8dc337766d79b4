//! Camera frame source
//!
//! `V4lCamera` negotiates RGB3, falling back to YUYV, and converts
//! whatever the driver hands back into packed RGB. Tests swap in their
//! own `FrameSource`.

use image::RgbImage;
use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::FaceError;

/// One decoded frame, packed RGB, 3 bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    pub const CHANNELS: u8 = 3;

    /// Luminance plane for the detectors.
    pub fn to_grayscale(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|px| {
                (px[0] as f32 * 0.299 + px[1] as f32 * 0.587 + px[2] as f32 * 0.114) as u8
            })
            .collect()
    }

    /// Copy out a region. `None` when the region leaves the frame.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Option<Frame> {
        if width == 0 || height == 0 || x + width > self.width || y + height > self.height {
            return None;
        }
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for row in y..y + height {
            let start = ((row * self.width + x) * 3) as usize;
            data.extend_from_slice(&self.data[start..start + (width * 3) as usize]);
        }
        Some(Frame::new(data, width, height))
    }

    /// Centered square crop with the frame's shorter side.
    pub fn center_square(&self) -> Frame {
        let side = self.width.min(self.height);
        let x = (self.width - side) / 2;
        let y = (self.height - side) / 2;
        // In bounds by construction.
        self.crop(x, y, side, side).unwrap_or_else(|| self.clone())
    }

    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    pub fn from_image(image: &RgbImage) -> Frame {
        Frame::new(image.as_raw().clone(), image.width(), image.height())
    }
}

/// Anything that can produce frames for the capture loop.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, FaceError>;
}

/// V4L2 camera. The stream holds the device open until drop.
pub struct V4lCamera {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    fourcc: FourCC,
}

impl V4lCamera {
    pub fn open(path: &str) -> Result<Self, FaceError> {
        let device = Device::with_path(path)?;
        let mut format = device.format()?;

        let rgb = Format::new(format.width, format.height, FourCC::new(b"RGB3"));
        format = device.set_format(&rgb).unwrap_or(format);
        if format.fourcc != FourCC::new(b"RGB3") {
            let yuyv = Format::new(format.width, format.height, FourCC::new(b"YUYV"));
            format = device.set_format(&yuyv).unwrap_or(format);
        }

        debug!(
            device = path,
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "camera opened"
        );

        let stream = Stream::with_buffers(&device, Type::VideoCapture, 4)?;
        Ok(Self {
            stream,
            width: format.width,
            height: format.height,
            fourcc: format.fourcc,
        })
    }
}

impl FrameSource for V4lCamera {
    fn next_frame(&mut self) -> Result<Frame, FaceError> {
        let (data, _meta) = self.stream.next()?;

        let rgb = if self.fourcc == FourCC::new(b"RGB3") {
            data.to_vec()
        } else if self.fourcc == FourCC::new(b"YUYV") {
            yuyv_to_rgb(self.width, self.height, data)?
        } else if self.fourcc == FourCC::new(b"GREY") {
            grey_to_rgb(self.width, self.height, data)?
        } else {
            warn!(fourcc = %self.fourcc, "passing through unknown pixel format");
            data.to_vec()
        };

        let expected = (self.width * self.height * 3) as usize;
        if rgb.len() < expected {
            return Err(FaceError::Camera(format!(
                "short frame: {} of {} bytes",
                rgb.len(),
                expected
            )));
        }
        Ok(Frame::new(rgb[..expected].to_vec(), self.width, self.height))
    }
}

fn yuyv_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>, FaceError> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected {
        return Err(FaceError::Camera("short YUYV buffer".to_string()));
    }

    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for chunk in data[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for &y in &[chunk[0] as f32, chunk[2] as f32] {
            out.push(clamp_u8(y + 1.402 * v));
            out.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            out.push(clamp_u8(y + 1.772 * u));
        }
    }
    Ok(out)
}

fn grey_to_rgb(width: u32, height: u32, data: &[u8]) -> Result<Vec<u8>, FaceError> {
    let expected = (width * height) as usize;
    if data.len() < expected {
        return Err(FaceError::Camera("short GREY buffer".to_string()));
    }
    let mut out = Vec::with_capacity(expected * 3);
    for &y in &data[..expected] {
        out.extend_from_slice(&[y, y, y]);
    }
    Ok(out)
}

fn clamp_u8(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}
