//! Pinhole cameras placed at the centre of a panorama.

extern crate cgmath;

use cgmath::prelude::*;
use cgmath::{Basis3, Matrix3, Vector3};
#[cfg(test)]
use cgmath::AbsDiffEq;

use crate::Error;

/// Directions whose normalized dot product is within this distance of 1 are treated as parallel.
pub const PARALLEL_TOLERANCE: f64 = 1e-9;

/// Pinhole intrinsics with square pixels and the principal point at the image centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    /// Horizontal field of view in degrees.
    pub fov: f64,
    pub focal: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Intrinsics for a horizontal field of view `fov` (degrees) spread over `width` pixels.
    pub fn from_fov(fov: f64, width: u32, height: u32) -> Result<Self, Error> {
        if !(fov > 0.0 && fov < 180.0) {
            return Err(Error::Configuration(format!(
                "field of view must be in (0, 180) degrees, got {}",
                fov
            )));
        }
        if width == 0 || height == 0 {
            return Err(Error::Configuration(format!(
                "output size must be positive, got {}x{}",
                width, height
            )));
        }
        let focal = (width as f64 / 2.0) / (fov.to_radians() / 2.0).tan();
        Ok(Intrinsics {
            width: width,
            height: height,
            fov: fov,
            focal: focal,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
        })
    }

    /// Camera space ray `(x, y, 1)` through continuous pixel coordinates. Image y points down.
    pub fn unproject(&self, px: f64, py: f64) -> Vector3<f64> {
        Vector3::new((px - self.cx) / self.focal, (py - self.cy) / self.focal, 1.0)
    }
}

/// Resolve the requested output size. `0` selects a square image half as tall as the panorama.
pub fn output_size(image_size: u32, erp_height: u32) -> (u32, u32) {
    if image_size > 0 {
        (image_size, image_size)
    } else {
        let s = (erp_height / 2).max(1);
        (s, s)
    }
}

/// World axis least aligned with `forward`. Ties go to Z, then X, then Y.
fn fallback_axis(forward: Vector3<f64>) -> Vector3<f64> {
    let axes = [Vector3::unit_z(), Vector3::unit_x(), Vector3::unit_y()];
    let mut best = axes[0];
    for axis in axes.iter().skip(1) {
        if forward.dot(*axis).abs() < forward.dot(best).abs() {
            best = *axis;
        }
    }
    best
}

/// Matrix taking camera space rays to the panorama frame for a camera looking along `forward`.
///
/// With `right = forward x up` and `true_up = right x forward`, the columns are
/// `[-right, -true_up, forward]`. Panorama longitude grows towards +X while +Y is the top row, so
/// seen from inside the sphere the frame is left-handed and image x has to follow `up x forward`
/// for views to keep the panorama's left and right. If `up` is (nearly) parallel to `forward` or
/// has no length it is replaced by [fallback_axis]. Fails only if `forward` itself has no
/// direction.
pub fn look_basis(forward: Vector3<f64>, up: Vector3<f64>) -> Result<Matrix3<f64>, Error> {
    let len = forward.magnitude();
    if !(len.is_finite() && len > 1e-12) {
        return Err(Error::DegenerateGeometry(format!(
            "view direction {:?} has no direction",
            forward
        )));
    }
    let f = forward / len;

    let up_len = up.magnitude();
    let usable = up_len.is_finite()
        && up_len > 1e-12
        && 1.0 - (f.dot(up) / up_len).abs() > PARALLEL_TOLERANCE;
    let up = if usable {
        up / up_len
    } else {
        fallback_axis(f)
    };

    let right = f.cross(up).normalize();
    let true_up = right.cross(f);
    Ok(Matrix3::from_cols(-right, -true_up, f))
}

/// A pinhole camera at the centre of a panorama.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerspectiveCamera {
    pub intrinsics: Intrinsics,
    /// Camera space to reference frame. Orthogonal with determinant -1, see [look_basis].
    pub rotation: Matrix3<f64>,
}

impl PerspectiveCamera {
    pub fn new(
        fov: f64,
        width: u32,
        height: u32,
        forward: Vector3<f64>,
        up: Vector3<f64>,
    ) -> Result<Self, Error> {
        PerspectiveCamera::from_intrinsics(Intrinsics::from_fov(fov, width, height)?, forward, up)
    }

    pub fn from_intrinsics(
        intrinsics: Intrinsics,
        forward: Vector3<f64>,
        up: Vector3<f64>,
    ) -> Result<Self, Error> {
        Ok(PerspectiveCamera {
            intrinsics: intrinsics,
            rotation: look_basis(forward, up)?,
        })
    }

    pub fn width(&self) -> u32 {
        self.intrinsics.width
    }

    pub fn height(&self) -> u32 {
        self.intrinsics.height
    }

    /// Optical axis in the reference frame.
    pub fn forward(&self) -> Vector3<f64> {
        self.rotation.z
    }

    /// Unit direction in the reference frame through continuous pixel coordinates.
    pub fn ray_at(&self, px: f64, py: f64) -> Vector3<f64> {
        (self.rotation * self.intrinsics.unproject(px, py)).normalize()
    }

    /// Unit direction through the centre of pixel (`col`, `row`).
    pub fn ray(&self, col: u32, row: u32) -> Vector3<f64> {
        self.ray_at(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// The same camera expressed in a frame whose orientation in the reference frame is
    /// `local_to_ref`, e.g. a world-frame camera moved into a pose's panorama frame.
    pub fn in_frame(&self, local_to_ref: Basis3<f64>) -> Self {
        PerspectiveCamera {
            intrinsics: self.intrinsics,
            rotation: *local_to_ref.invert().as_ref() * self.rotation,
        }
    }
}

#[cfg(test)]
fn assert_vec_eq(a: Vector3<f64>, b: Vector3<f64>) {
    assert!(a.abs_diff_eq(&b, 1e-9), "{:?} != {:?}", a, b);
}

#[test]
fn test_focal_length() {
    let k = Intrinsics::from_fov(90.0, 640, 480).unwrap();
    assert!((k.focal - 320.0).abs() < 1e-9);
    assert_eq!((k.cx, k.cy), (320.0, 240.0));
}

#[test]
fn test_fov_doubling_halves_focal() {
    let narrow = Intrinsics::from_fov(10.0, 512, 512).unwrap();
    let wide = Intrinsics::from_fov(20.0, 512, 512).unwrap();
    let ratio = narrow.focal / wide.focal;
    assert!((ratio - 2.0).abs() < 0.04, "ratio {}", ratio);
}

#[test]
fn test_invalid_intrinsics() {
    assert!(Intrinsics::from_fov(0.0, 10, 10).is_err());
    assert!(Intrinsics::from_fov(180.0, 10, 10).is_err());
    assert!(Intrinsics::from_fov(60.0, 0, 10).is_err());
}

#[test]
fn test_output_size() {
    assert_eq!(output_size(0, 2048), (1024, 1024));
    assert_eq!(output_size(300, 2048), (300, 300));
    assert_eq!(output_size(0, 1), (1, 1));
}

#[test]
fn test_look_basis_orthonormal() {
    let r = look_basis(Vector3::new(1.0, 0.2, -0.5), Vector3::unit_y()).unwrap();
    assert!((r.determinant() + 1.0).abs() < 1e-9);
    assert_vec_eq(r.transpose() * r * Vector3::new(1.0, 2.0, 3.0), Vector3::new(1.0, 2.0, 3.0));
    assert_vec_eq(r.z, Vector3::new(1.0, 0.2, -0.5).normalize());
    // image up has a positive world up component
    assert!((-r.y).dot(Vector3::unit_y()) > 0.0);
}

#[test]
fn test_look_basis_fallback() {
    let r = look_basis(Vector3::unit_y(), Vector3::unit_y()).unwrap();
    assert!(r.x.x.is_finite() && r.y.y.is_finite());
    assert!((r.determinant() + 1.0).abs() < 1e-9);
    // Z is the fallback reference, so image x follows Z x Y = -X
    assert_vec_eq(r.x, -Vector3::unit_x());

    let r = look_basis(Vector3::new(0.0, 0.0, -2.0), Vector3::new(0.0, 0.0, 0.0)).unwrap();
    assert!((r.determinant() + 1.0).abs() < 1e-9);

    assert!(look_basis(Vector3::new(0.0, 0.0, 0.0), Vector3::unit_y()).is_err());
}

#[test]
fn test_rays_stay_inside_panorama() {
    let camera =
        PerspectiveCamera::new(75.0, 320, 240, Vector3::unit_z(), Vector3::unit_y()).unwrap();
    let (w, h) = (1000, 500);
    let k = camera.intrinsics;
    let probes = [
        (0.0, 0.0),
        (k.width as f64, 0.0),
        (0.0, k.height as f64),
        (k.width as f64, k.height as f64),
        (k.cx, k.cy),
    ];
    for &(px, py) in probes.iter() {
        let (u, v) = crate::erp::direction_to_pixel(camera.ray_at(px, py), w, h);
        assert!(u >= 0.0 && u < w as f64 && v >= 0.0 && v < h as f64);
    }
    // the optical centre lands on the forward axis
    let (u, v) = crate::erp::direction_to_pixel(camera.ray_at(k.cx, k.cy), w, h);
    assert!(u.abs() < 1e-9 && (v - 250.0).abs() < 1e-9);
    // the top row looks upwards
    assert!(camera.ray(160, 0).y > 0.0);
}

#[test]
fn test_image_x_follows_longitude() {
    // looking along +Z, the right edge sees the columns just after the forward column
    let camera =
        PerspectiveCamera::new(60.0, 32, 32, Vector3::unit_z(), Vector3::unit_y()).unwrap();
    let (u_right, _) = crate::erp::direction_to_pixel(camera.ray(31, 16), 64, 32);
    let (u_left, _) = crate::erp::direction_to_pixel(camera.ray(0, 16), 64, 32);
    assert!(u_right > 0.0 && u_right < 8.0, "u = {}", u_right);
    assert!(u_left > 56.0 && u_left < 64.0, "u = {}", u_left);
}

#[test]
fn test_in_frame() {
    let camera =
        PerspectiveCamera::new(60.0, 64, 64, Vector3::unit_x(), Vector3::unit_y()).unwrap();
    // the panorama is turned 90 degrees about y, so its +z axis points along world +x
    let local_to_world = Basis3::from_angle_y(cgmath::Deg(90.0));
    assert_vec_eq(local_to_world.rotate_vector(Vector3::unit_z()), Vector3::unit_x());
    let local = camera.in_frame(local_to_world);
    assert_vec_eq(local.forward(), Vector3::unit_z());
    assert_vec_eq(
        local_to_world.rotate_vector(local.ray(3, 50)),
        camera.ray(3, 50),
    );
}
