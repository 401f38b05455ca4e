//! Equirectangular panoramas and spherical sampling.

extern crate cgmath;
extern crate image;

use cgmath::{InnerSpace, Vector3};
use image::{GrayImage, RgbImage};

use std::f64::consts::{FRAC_PI_2, PI};
use std::path::{Path, PathBuf};

use crate::Error;

/// Mask values at or above this level mark pixels to keep.
pub const MASK_THRESHOLD: u8 = 128;

/// An equirectangular panorama covering 360 by 180 degrees, with an optional mask of the same
/// size.
///
/// Directions are expressed in the panorama's local frame. Longitude is `atan2(x, z)` in `[0, 2pi)`
/// and runs left to right starting from the +Z axis at column 0. Latitude is `asin(y)`, +Y is the top
/// row and -Y the bottom row.
#[derive(Debug, Clone)]
pub struct ErpImage {
    pub path: PathBuf,
    pub pixels: RgbImage,
    pub mask: Option<GrayImage>,
}

impl ErpImage {
    /// Wrap decoded buffers. The mask must match the panorama's dimensions.
    pub fn new(path: PathBuf, pixels: RgbImage, mask: Option<GrayImage>) -> Result<Self, Error> {
        if let Some(m) = &mask {
            if m.dimensions() != pixels.dimensions() {
                return Err(Error::MissingSource {
                    path: path,
                    reason: format!(
                        "mask is {}x{} but panorama is {}x{}",
                        m.width(),
                        m.height(),
                        pixels.width(),
                        pixels.height()
                    ),
                });
            }
        }
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(Error::MissingSource {
                path: path,
                reason: "empty panorama".to_string(),
            });
        }
        Ok(ErpImage {
            path: path,
            pixels: pixels,
            mask: mask,
        })
    }

    /// Decode a panorama and, if given, its mask. Any failure is reported as a missing source so
    /// the caller can skip the frame.
    pub fn open(path: &Path, mask_path: Option<&Path>) -> Result<Self, Error> {
        let missing = |p: &Path, e: image::ImageError| Error::MissingSource {
            path: p.to_path_buf(),
            reason: e.to_string(),
        };
        let pixels = image::open(path).map_err(|e| missing(path, e))?.to_rgb8();
        let mask = match mask_path {
            Some(mp) => Some(image::open(mp).map_err(|e| missing(mp, e))?.to_luma8()),
            None => None,
        };
        ErpImage::new(path.to_path_buf(), pixels, mask)
    }

    /// Render a panorama by evaluating `color` at the direction through every pixel centre.
    pub fn from_fn<F>(path: PathBuf, width: u32, height: u32, color: F) -> Self
    where
        F: Fn(Vector3<f64>) -> [u8; 3],
    {
        let pixels = RgbImage::from_fn(width, height, |x, y| {
            let dir = pixel_to_direction(x as f64 + 0.5, y as f64 + 0.5, width, height);
            image::Rgb(color(dir))
        });
        ErpImage {
            path: path,
            pixels: pixels,
            mask: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Map a direction to continuous pixel coordinates `(u, v)`.
    ///
    /// The result always lies in `[0, W) x [0, H)`: longitude wraps and latitude is clamped at the
    /// poles. `dir` must be finite and non-zero.
    pub fn direction_to_pixel(&self, dir: Vector3<f64>) -> (f64, f64) {
        direction_to_pixel(dir, self.width(), self.height())
    }

    /// Bilinearly sample the panorama in direction `dir`.
    pub fn sample(&self, dir: Vector3<f64>) -> [f32; 3] {
        let (u, v) = self.direction_to_pixel(dir);
        bilinear::<3>(&self.pixels, self.width(), self.height(), u, v)
    }

    /// Bilinearly sample the mask in direction `dir`, `None` if the panorama has no mask.
    pub fn sample_mask(&self, dir: Vector3<f64>) -> Option<f32> {
        let (u, v) = self.direction_to_pixel(dir);
        self.mask
            .as_ref()
            .map(|m| bilinear::<1>(m, self.width(), self.height(), u, v)[0])
    }
}

/// Direction through continuous pixel coordinates `(u, v)` of a `width` x `height` panorama.
pub fn pixel_to_direction(u: f64, v: f64, width: u32, height: u32) -> Vector3<f64> {
    let lon = u / width as f64 * 2.0 * PI;
    let lat = FRAC_PI_2 - v / height as f64 * PI;
    Vector3::new(lat.cos() * lon.sin(), lat.sin(), lat.cos() * lon.cos())
}

/// See [ErpImage::direction_to_pixel].
pub fn direction_to_pixel(dir: Vector3<f64>, width: u32, height: u32) -> (f64, f64) {
    debug_assert!(
        dir.magnitude2() > 0.0 && dir.magnitude2().is_finite(),
        "sampling direction must be finite and non-zero, got {:?}",
        dir
    );
    let (w, h) = (width as f64, height as f64);

    let mut lon = dir.x.atan2(dir.z);
    if lon < 0.0 {
        lon += 2.0 * PI;
    }
    let lat = (dir.y / dir.magnitude()).max(-1.0).min(1.0).asin();

    let mut u = lon / (2.0 * PI) * w;
    if u >= w {
        u -= w;
    }
    let v = ((FRAC_PI_2 - lat) / PI * h).max(0.0);
    // the south pole maps to exactly `h`, keep it on the last row
    let v = if v >= h { h * (1.0 - std::f64::EPSILON) } else { v };
    (u, v)
}

/// Bilinear interpolation with pixel centres at half-integer coordinates. Columns wrap around the
/// seam, rows clamp at the poles.
fn bilinear<const C: usize>(data: &[u8], width: u32, height: u32, u: f64, v: f64) -> [f32; C] {
    let (w, h) = (width as i64, height as i64);

    let x = u - 0.5;
    let y = (v - 0.5).max(0.0).min((h - 1) as f64);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = (x - x0) as f32;
    let fy = (y - y0) as f32;

    let ix0 = (x0 as i64).rem_euclid(w);
    let ix1 = (ix0 + 1) % w;
    let iy0 = y0 as i64;
    let iy1 = (iy0 + 1).min(h - 1);

    let base = |ix: i64, iy: i64| (iy * w + ix) as usize * C;
    let (b00, b01, b10, b11) = (base(ix0, iy0), base(ix1, iy0), base(ix0, iy1), base(ix1, iy1));

    let w00 = (1.0 - fx) * (1.0 - fy);
    let w01 = fx * (1.0 - fy);
    let w10 = (1.0 - fx) * fy;
    let w11 = fx * fy;

    let mut pixel = [0.0f32; C];
    for (k, p) in pixel.iter_mut().enumerate() {
        *p = data[b00 + k] as f32 * w00
            + data[b01 + k] as f32 * w01
            + data[b10 + k] as f32 * w10
            + data[b11 + k] as f32 * w11;
    }
    pixel
}

/// Threshold a sampled mask into a hard 0/255 mask.
pub fn binarize_mask(mask: &mut GrayImage) {
    for p in mask.pixels_mut() {
        p.0[0] = if p.0[0] >= MASK_THRESHOLD { 255 } else { 0 };
    }
}

#[cfg(test)]
fn gradient_panorama(width: u32, height: u32) -> ErpImage {
    let pixels = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 255 / (width - 1)) as u8, (y * 255 / (height - 1)) as u8, 7])
    });
    ErpImage::new(PathBuf::from("gradient.png"), pixels, None).unwrap()
}

#[test]
fn test_sampling_is_pure() {
    use rand::Rng;
    let erp = gradient_panorama(64, 32);
    let mut rng = rand::thread_rng();
    for _ in 0..100 {
        let dir = Vector3::new(
            rng.gen_range(-1.0, 1.0),
            rng.gen_range(-1.0, 1.0),
            rng.gen_range(-1.0, 1.0),
        );
        if dir.magnitude() < 1e-3 {
            continue;
        }
        let dir = dir.normalize();
        assert_eq!(erp.sample(dir), erp.sample(dir));
    }
}

#[test]
fn test_direction_to_pixel_axes() {
    let (w, h) = (400, 200);
    let check = |dir: Vector3<f64>, u: f64, v: f64| {
        let (pu, pv) = direction_to_pixel(dir, w, h);
        assert!((pu - u).abs() < 1e-9 && (pv - v).abs() < 1e-9, "{:?} -> ({}, {})", dir, pu, pv);
    };
    check(Vector3::new(0.0, 0.0, 1.0), 0.0, 100.0);
    check(Vector3::new(1.0, 0.0, 0.0), 100.0, 100.0);
    check(Vector3::new(0.0, 0.0, -1.0), 200.0, 100.0);
    check(Vector3::new(-1.0, 0.0, 0.0), 300.0, 100.0);
    check(Vector3::new(0.0, 1.0, 0.0), 0.0, 0.0);
}

#[test]
fn test_pixel_direction_inverse() {
    let (w, h) = (128, 64);
    for &(u, v) in &[(0.5, 0.5), (17.25, 40.0), (127.5, 63.5), (64.0, 32.0)] {
        let dir = pixel_to_direction(u, v, w, h);
        let (pu, pv) = direction_to_pixel(dir, w, h);
        assert!((pu - u).abs() < 1e-9 && (pv - v).abs() < 1e-9);
    }
}

#[test]
fn test_pixel_coordinates_in_bounds() {
    let (w, h) = (50, 25);
    let dirs = [
        Vector3::new(0.0, -1.0, 0.0),
        Vector3::new(0.0, 1.0, 0.0),
        Vector3::new(-1e-300, 0.0, 1.0),
        Vector3::new(-1e-17, -1.0, 1e-17),
        Vector3::new(-1.0, 0.0, 1e-12),
    ];
    for d in dirs.iter() {
        let (u, v) = direction_to_pixel(*d, w, h);
        assert!(u >= 0.0 && u < w as f64, "u = {}", u);
        assert!(v >= 0.0 && v < h as f64, "v = {}", v);
    }
}

#[test]
fn test_horizontal_wrap() {
    // columns 0 and W-1 are neighbours across the seam
    let mut pixels = RgbImage::new(8, 4);
    for y in 0..4 {
        pixels.put_pixel(0, y, image::Rgb([200, 0, 0]));
        pixels.put_pixel(7, y, image::Rgb([0, 0, 200]));
    }
    let erp = ErpImage::new(PathBuf::from("seam.png"), pixels, None).unwrap();
    // u = 0 lies halfway between the centres of columns 7 and 0
    let c = erp.sample(Vector3::new(0.0, 0.0, 1.0));
    assert!((c[0] - 100.0).abs() < 1e-3);
    assert!((c[2] - 100.0).abs() < 1e-3);
}

#[test]
fn test_poles_clamp() {
    let erp = gradient_panorama(16, 8);
    let top = erp.sample(Vector3::new(0.0, 1.0, 0.0));
    let bottom = erp.sample(Vector3::new(0.0, -1.0, 0.0));
    assert_eq!(top[1], 0.0);
    assert_eq!(bottom[1], 255.0);
}

#[test]
fn test_mask_sampling() {
    let pixels = RgbImage::new(8, 4);
    let mask = GrayImage::from_fn(8, 4, |_, y| image::Luma([if y < 2 { 255 } else { 0 }]));
    let erp = ErpImage::new(PathBuf::from("m.png"), pixels, Some(mask)).unwrap();
    assert_eq!(erp.sample_mask(Vector3::new(0.0, 1.0, 0.0)), Some(255.0));
    assert_eq!(erp.sample_mask(Vector3::new(0.0, -1.0, 0.0)), Some(0.0));

    let bad = ErpImage::new(PathBuf::from("m.png"), RgbImage::new(8, 4), Some(GrayImage::new(4, 4)));
    assert!(bad.is_err());
}
