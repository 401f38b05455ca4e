//! Procedural trajectories and panoramas for trying out the exporters without captured data.

extern crate cgmath;
extern crate image;
extern crate indicatif;
extern crate rand;
extern crate rayon;

use cgmath::prelude::*;
use cgmath::{Basis3, Point3, Rad, Vector3};
use image::GrayImage;
use indicatif::ParallelProgressIterator;
use rand::distributions::{Distribution, Normal};
use rayon::prelude::*;

use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::cubic::save_image;
use crate::erp::*;
use crate::job::progress_bar;
use crate::trajectory::*;
use crate::Error;

fn frame_name(i: usize) -> String {
    format!("frame_{:05}.png", i)
}

fn jittered(p: Point3<f64>, dist: &Normal) -> Point3<f64> {
    let mut rng = rand::thread_rng();
    p + Vector3::new(
        dist.sample(&mut rng),
        dist.sample(&mut rng),
        dist.sample(&mut rng),
    )
}

/// `n` poses `spacing` meters apart along world +Z, all facing +Z. Positions get Gaussian noise
/// with standard deviation `jitter`.
pub fn line_trajectory(n: usize, spacing: f64, jitter: f64) -> Trajectory {
    let dist = Normal::new(0.0, jitter);
    Trajectory::new(
        (0..n)
            .map(|i| {
                let p = Point3::new(0.0, 0.0, i as f64 * spacing);
                TrajectoryPose::new(
                    i as u32 + 1,
                    &frame_name(i),
                    if jitter > 0.0 { jittered(p, &dist) } else { p },
                    Basis3::one(),
                )
            })
            .collect(),
    )
}

/// `n` poses on a horizontal circle of `radius` meters around the origin, each facing along the
/// direction of travel.
pub fn circle_trajectory(n: usize, radius: f64, jitter: f64) -> Trajectory {
    let dist = Normal::new(0.0, jitter);
    Trajectory::new(
        (0..n)
            .map(|i| {
                let a = 2.0 * PI * i as f64 / n as f64;
                let p = Point3::new(radius * a.cos(), 0.0, radius * a.sin());
                TrajectoryPose::new(
                    i as u32 + 1,
                    &frame_name(i),
                    if jitter > 0.0 { jittered(p, &dist) } else { p },
                    // local +z turns to the tangent (-sin a, 0, cos a)
                    Basis3::from_angle_y(Rad(-a)),
                )
            })
            .collect(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyntheticPath {
    Line,
    Circle,
}

impl FromStr for SyntheticPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "line" => Ok(SyntheticPath::Line),
            "circle" => Ok(SyntheticPath::Circle),
            _ => Err(Error::Configuration(format!(
                "unknown path {}, expected line or circle",
                s
            ))),
        }
    }
}

impl SyntheticPath {
    /// `size` is the spacing between poses for lines and the radius for circles.
    pub fn trajectory(self, n: usize, size: f64, jitter: f64) -> Trajectory {
        match self {
            SyntheticPath::Line => line_trajectory(n, size, jitter),
            SyntheticPath::Circle => circle_trajectory(n, size, jitter),
        }
    }
}

/// Colour of the surrounding environment seen along world direction `dir`. Smooth in the
/// direction, with a checkerboard of 15 degree cells for texture.
pub fn environment_color(dir: Vector3<f64>) -> [u8; 3] {
    let d = dir.normalize();
    let lon = d.x.atan2(d.z).to_degrees();
    let lat = d.y.asin().to_degrees();
    let cell = ((lon / 15.0).floor() + (lat / 15.0).floor()) as i64;
    let shade = if cell.rem_euclid(2) == 0 { 1.0 } else { 0.6 };
    let channel = |x: f64| ((x * 0.5 + 0.5) * 255.0 * shade).round() as u8;
    [channel(d.x), channel(d.y), channel(d.z)]
}

/// Panorama seen from `pose`.
pub fn render_panorama(pose: &TrajectoryPose, width: u32, height: u32) -> ErpImage {
    ErpImage::from_fn(PathBuf::from(&pose.name), width, height, |local| {
        environment_color(pose.rotation.rotate_vector(local))
    })
}

/// Mask blocking everything within `cap` degrees of the panorama's lower pole, as a capture rig
/// below the camera would.
pub fn render_mask(width: u32, height: u32, cap: f64) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        let dir = pixel_to_direction(x as f64 + 0.5, y as f64 + 0.5, width, height);
        let blocked = dir.y.asin().to_degrees() < cap - 90.0;
        image::Luma([if blocked { 0 } else { 255 }])
    })
}

/// Write a complete dataset into `out`: panoramas in `images/`, masks in `masks/` when `mask_cap`
/// is given, and the trajectory as `trajectory_file` (`images.txt` or `images.bin`).
pub fn write_dataset(
    trajectory: &Trajectory,
    out: &Path,
    width: u32,
    height: u32,
    mask_cap: Option<f64>,
    trajectory_file: &str,
    verbose: bool,
) -> Result<(), Error> {
    if width == 0 || height == 0 {
        return Err(Error::Configuration(format!(
            "panorama size must be positive, got {}x{}",
            width, height
        )));
    }
    let image_dir = out.join("images");
    let mask_dir = out.join("masks");
    std::fs::create_dir_all(&image_dir)?;

    let mask = mask_cap.map(|cap| render_mask(width, height, cap));

    trajectory
        .poses
        .par_iter()
        .progress_with(progress_bar(
            trajectory.len() as u64,
            "Rendering panoramas",
            verbose,
        ))
        .map(|pose| {
            let erp = render_panorama(pose, width, height);
            save_image(&erp.pixels, &image_dir.join(&pose.name))?;
            if let Some(m) = &mask {
                let name = Path::new(&pose.name).with_extension("png");
                save_image(m, &mask_dir.join(name))?;
            }
            Ok(())
        })
        .collect::<Result<Vec<()>, Error>>()?;

    trajectory
        .write(&out.join(trajectory_file))
        .map_err(Error::from)
}

#[test]
fn test_line_trajectory() {
    let t = line_trajectory(4, 0.25, 0.0);
    assert_eq!(t.len(), 4);
    assert_eq!(t.poses[2].name, "frame_00002.png");
    assert_eq!(t.poses[2].image_id, 3);
    assert!((t.length() - 0.75).abs() < 1e-12);

    let noisy = line_trajectory(4, 0.25, 0.01);
    assert!(noisy.poses.iter().all(|p| p.position.x.abs() < 0.2));
}

#[test]
fn test_circle_faces_forward() {
    let t = circle_trajectory(8, 2.0, 0.0);
    for (a, b) in t.poses.iter().zip(t.poses.iter().skip(1)) {
        let travel = (b.position - a.position).normalize();
        let forward = a.rotation.rotate_vector(Vector3::unit_z());
        assert!(travel.dot(forward) > 0.9);
    }
    assert_eq!("circle".parse::<SyntheticPath>().unwrap(), SyntheticPath::Circle);
    assert!("spiral".parse::<SyntheticPath>().is_err());
}

#[test]
fn test_panoramas_share_environment() {
    // a turned pose sees the same world colour in the same world direction
    let t = circle_trajectory(4, 1.0, 0.0);
    let (a, b) = (render_panorama(&t.poses[0], 64, 32), render_panorama(&t.poses[1], 64, 32));
    // centre of a checkerboard cell
    let (lon, lat) = (157.5f64.to_radians(), 7.5f64.to_radians());
    let world = Vector3::new(lat.cos() * lon.sin(), lat.sin(), lat.cos() * lon.cos());
    let ca = a.sample(t.poses[0].world_to_local(world));
    let cb = b.sample(t.poses[1].world_to_local(world));
    for k in 0..3 {
        assert!((ca[k] - cb[k]).abs() < 40.0);
    }
}

#[test]
fn test_render_mask_blocks_lower_cap() {
    let m = render_mask(32, 16, 30.0);
    assert_eq!(m.get_pixel(0, 0).0[0], 255);
    assert_eq!(m.get_pixel(5, 15).0[0], 0);
    assert_eq!(m.get_pixel(5, 8).0[0], 255);
}

#[test]
fn test_write_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let t = line_trajectory(3, 0.1, 0.0);
    write_dataset(&t, dir.path(), 32, 16, Some(20.0), "images.bin", false).unwrap();
    assert!(dir.path().join("images").join("frame_00001.png").is_file());
    assert!(dir.path().join("masks").join("frame_00001.png").is_file());
    let read = Trajectory::from_path(dir.path()).unwrap();
    assert_eq!(read.len(), 3);
}
