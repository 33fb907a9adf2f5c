//! CPU-side decoding of sequence frames into RGBA8 buffers.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Instant;

use fast_image_resize as fir;
use image::{ImageFormat, ImageReader, RgbaImage, imageops};
use jpeg_decoder::{Decoder as JpegDecoder, PixelFormat};
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::events::Tier;

/// A decoded frame, owned by the rolling buffer until evicted.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub index: usize,
    pub tier: Tier,
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8 rows.
    pub pixels: Vec<u8>,
    pub decoded_at: Instant,
}

impl DecodedFrame {
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.pixels.len() as u64
    }
}

/// What to decode for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeJob {
    pub index: usize,
    pub tier: Tier,
    pub path: PathBuf,
    /// Pre-rendered thumbnail recorded in the index, used for the thumbnail tier when readable.
    pub cached_thumbnail: Option<PathBuf>,
    /// Where to save a thumbnail generated for this job.
    pub thumbnail_cache: Option<PathBuf>,
}

/// Turns a [`DecodeJob`] into pixels. Runs on the blocking pool.
pub trait FrameDecoder: Send + Sync + 'static {
    fn decode(&self, job: &DecodeJob) -> Result<DecodedFrame, DecodeError>;
}

/// Decoder backed by the `image` crate.
#[derive(Debug, Clone)]
pub struct ImageDecoder {
    thumbnail_max_dimension: u32,
}

impl ImageDecoder {
    #[must_use]
    pub fn new(thumbnail_max_dimension: u32) -> Self {
        Self {
            thumbnail_max_dimension: thumbnail_max_dimension.max(1),
        }
    }

    /// Cheapest source first: a saved thumbnail, the one embedded in the EXIF
    /// block, a DCT-scaled JPEG decode, and only then the whole image.
    fn thumbnail(&self, job: &DecodeJob) -> Result<RgbaImage, DecodeError> {
        let max = self.thumbnail_max_dimension;
        let saved = [job.cached_thumbnail.as_deref(), job.thumbnail_cache.as_deref()];
        for cached in saved.into_iter().flatten() {
            if !cached.is_file() {
                continue;
            }
            match decode_rgba8(cached) {
                Ok(img) => return fit_within(&img, max, cached),
                Err(err) => debug!(path = %cached.display(), %err, "cached thumbnail unusable"),
            }
        }

        let path = job.path.as_path();
        let exif = read_exif(path);
        let orientation = exif.as_ref().and_then(orientation_of).unwrap_or(1);
        let img = match exif.as_ref().and_then(|exif| embedded_thumbnail(exif, path)) {
            Some(img) => img,
            None => self.render_thumbnail(path)?,
        };
        let thumb = fit_within(&apply_orientation(img, orientation), max, path)?;
        if let Some(target) = job.thumbnail_cache.as_deref() {
            save_thumbnail(&thumb, target);
        }
        Ok(thumb)
    }

    fn render_thumbnail(&self, path: &Path) -> Result<RgbaImage, DecodeError> {
        let max = self.thumbnail_max_dimension;
        if is_jpeg(path) {
            match decode_jpeg_scaled(path, max, max) {
                Ok(img) => return Ok(img),
                Err(err) => {
                    debug!(path = %path.display(), %err, "scaled JPEG decode failed; decoding full");
                }
            }
        }
        decode_rgba8(path)
    }
}

impl FrameDecoder for ImageDecoder {
    fn decode(&self, job: &DecodeJob) -> Result<DecodedFrame, DecodeError> {
        let img = match job.tier {
            Tier::Full => decode_rgba8_apply_exif(&job.path)?,
            Tier::Thumbnail => self.thumbnail(job)?,
        };
        let (width, height) = img.dimensions();
        debug!(index = job.index, tier = ?job.tier, width, height, "decoded frame");
        Ok(DecodedFrame {
            index: job.index,
            tier: job.tier,
            width,
            height,
            pixels: img.into_raw(),
            decoded_at: Instant::now(),
        })
    }
}

fn decode_rgba8(path: &Path) -> Result<RgbaImage, DecodeError> {
    let io_err = |source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    };
    let img = ImageReader::open(path)
        .map_err(io_err)?
        .with_guessed_format()
        .map_err(io_err)?
        .decode()
        .map_err(|source| DecodeError::Image {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(img.to_rgba8())
}

// Orientation is best-effort; files without EXIF keep their stored orientation.
fn decode_rgba8_apply_exif(path: &Path) -> Result<RgbaImage, DecodeError> {
    let img = decode_rgba8(path)?;
    let orientation = read_exif(path).as_ref().and_then(orientation_of).unwrap_or(1);
    Ok(apply_orientation(img, orientation))
}

fn apply_orientation(img: RgbaImage, orientation: u16) -> RgbaImage {
    match orientation {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        // transpose
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        // transverse
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => img,
    }
}

fn read_exif(path: &Path) -> Option<exif::Exif> {
    let file = File::open(path).ok()?;
    exif::Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .ok()
}

fn orientation_of(exif: &exif::Exif) -> Option<u16> {
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    let o = u16::try_from(field.value.get_uint(0)?).ok()?;
    debug!("exif orientation {}", o);
    Some(o)
}

/// The JPEG thumbnail stored in IFD1, if the file carries one.
fn embedded_thumbnail(exif: &exif::Exif, path: &Path) -> Option<RgbaImage> {
    let uint = |tag| {
        exif.get_field(tag, exif::In::THUMBNAIL)?
            .value
            .get_uint(0)
            .and_then(|v| usize::try_from(v).ok())
    };
    let offset = uint(exif::Tag::JPEGInterchangeFormat)?;
    let len = uint(exif::Tag::JPEGInterchangeFormatLength)?;
    let bytes = exif.buf().get(offset..offset.checked_add(len)?)?;
    match image::load_from_memory_with_format(bytes, ImageFormat::Jpeg) {
        Ok(img) => {
            debug!(path = %path.display(), "using embedded EXIF thumbnail");
            Some(img.to_rgba8())
        }
        Err(err) => {
            debug!(path = %path.display(), %err, "embedded thumbnail unreadable");
            None
        }
    }
}

/// Best-effort: a failed save only costs a regenerated thumbnail next time.
fn save_thumbnail(img: &RgbaImage, target: &Path) {
    let partial = target.with_extension("png.partial");
    let saved = target
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .map_err(image::ImageError::IoError)
        .and_then(|()| img.save_with_format(&partial, ImageFormat::Png))
        .and_then(|()| std::fs::rename(&partial, target).map_err(image::ImageError::IoError));
    match saved {
        Ok(()) => debug!(path = %target.display(), "thumbnail saved"),
        Err(err) => {
            warn!(path = %target.display(), %err, "failed to save thumbnail");
            let _ = std::fs::remove_file(&partial);
        }
    }
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
}

/// DCT-scaled decode: the decoder picks the smallest scale covering the request.
fn decode_jpeg_scaled(path: &Path, target_w: u32, target_h: u32) -> Result<RgbaImage, DecodeError> {
    use jpeg_decoder::Error as JpegError;

    let scale_err = |detail: String| DecodeError::Scale {
        path: path.to_path_buf(),
        detail,
    };
    let jpeg_err = |err: JpegError| match err {
        JpegError::Unsupported(feature) => scale_err(format!("unsupported JPEG feature: {feature:?}")),
        other => scale_err(other.to_string()),
    };

    let file = File::open(path).map_err(|source| DecodeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut decoder = JpegDecoder::new(BufReader::new(file));
    let request_w = u16::try_from(target_w.clamp(1, u32::from(u16::MAX))).unwrap_or(u16::MAX);
    let request_h = u16::try_from(target_h.clamp(1, u32::from(u16::MAX))).unwrap_or(u16::MAX);
    decoder.scale(request_w, request_h).map_err(jpeg_err)?;
    let pixels = decoder.decode().map_err(jpeg_err)?;
    let info = decoder
        .info()
        .ok_or_else(|| scale_err("missing image info after decode".into()))?;
    let width = u32::from(info.width);
    let height = u32::from(info.height);

    let rgba = match info.pixel_format {
        PixelFormat::RGB24 => {
            let mut rgba = Vec::with_capacity(pixels.len() / 3 * 4);
            for chunk in pixels.chunks_exact(3) {
                rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            rgba
        }
        PixelFormat::L8 => {
            let mut rgba = Vec::with_capacity(pixels.len() * 4);
            for &v in &pixels {
                rgba.extend_from_slice(&[v, v, v, 255]);
            }
            rgba
        }
        PixelFormat::CMYK32 => {
            let mut rgba = Vec::with_capacity(pixels.len());
            for chunk in pixels.chunks_exact(4) {
                let k = f32::from(chunk[3]) / 255.0;
                let channel = |v: u8| {
                    let v = f32::from(v) / 255.0;
                    let v = v * (1.0 - k) + k;
                    ((1.0 - v) * 255.0).round().clamp(0.0, 255.0) as u8
                };
                rgba.extend_from_slice(&[channel(chunk[0]), channel(chunk[1]), channel(chunk[2]), 255]);
            }
            rgba
        }
        PixelFormat::L16 => {
            return Err(scale_err(
                "16-bit grayscale JPEGs are not supported by the scaled decoder".into(),
            ));
        }
    };

    RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| scale_err("decoded buffer does not match reported size".into()))
}

/// Largest size with the same aspect ratio whose longest edge is at most `max`.
fn fit_dimensions(width: u32, height: u32, max: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max || longest == 0 {
        return (width.max(1), height.max(1));
    }
    let scale = f64::from(max) / f64::from(longest);
    let w = (f64::from(width) * scale).round().max(1.0) as u32;
    let h = (f64::from(height) * scale).round().max(1.0) as u32;
    (w.min(max), h.min(max))
}

fn fit_within(img: &RgbaImage, max: u32, path: &Path) -> Result<RgbaImage, DecodeError> {
    let (w, h) = fit_dimensions(img.width(), img.height(), max);
    resize_rgba(img, w, h).map_err(|detail| DecodeError::Scale {
        path: path.to_path_buf(),
        detail,
    })
}

fn resize_rgba(source: &RgbaImage, target_w: u32, target_h: u32) -> Result<RgbaImage, String> {
    if target_w == 0 || target_h == 0 {
        return Err("resize dimensions must be positive".into());
    }
    if source.width() == target_w && source.height() == target_h {
        return Ok(source.clone());
    }

    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| format!("invalid source view: {err}"))?;
    let mut dst_image = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .map_err(|err| format!("resize failed: {err}"))?;
    RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .ok_or_else(|| "resized buffer has unexpected length".into())
}
