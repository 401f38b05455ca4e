//! Synthetic stereo pairs from frames along a trajectory.
//!
//! Two poses `k` frames apart form a pair. Both panoramas are reprojected through the same
//! world-frame pinhole camera, pointing at some angle on a ring perpendicular to the motion between
//! the poses. The camera's image x axis is the motion direction, so the resulting pair is rectified
//! with a horizontal baseline.

extern crate cgmath;
extern crate itertools;

use cgmath::prelude::*;
use cgmath::{Basis3, Deg, Vector3};
use itertools::Itertools;
use log::debug;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::camera::*;
use crate::cubic::write_view;
use crate::erp::ErpImage;
use crate::trajectory::*;
use crate::Error;

/// Motion directions within this distance of parallel to world up (on `1 - |m . up|`) are
/// rejected.
pub const MOTION_TOLERANCE: f64 = 1e-6;

/// Ring of view directions perpendicular to a motion direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingGeometry {
    pub up: Vector3<f64>,
    pub motion: Vector3<f64>,
    /// World up projected onto the plane orthogonal to `motion`.
    pub zero: Vector3<f64>,
}

impl RingGeometry {
    pub fn new(up: Vector3<f64>, motion: Vector3<f64>) -> Result<Self, Error> {
        let (up_len, motion_len) = (up.magnitude(), motion.magnitude());
        if !(up_len.is_finite() && up_len > 1e-12) {
            return Err(Error::DegenerateGeometry(format!(
                "world up {:?} has no direction",
                up
            )));
        }
        if !(motion_len.is_finite() && motion_len > 1e-12) {
            return Err(Error::DegenerateGeometry(
                "poses share a position, motion direction is undefined".to_string(),
            ));
        }
        let up = up / up_len;
        let m = motion / motion_len;
        if 1.0 - m.dot(up).abs() <= MOTION_TOLERANCE {
            return Err(Error::DegenerateGeometry(format!(
                "motion direction {:?} is parallel to world up {:?}",
                m, up
            )));
        }
        Ok(RingGeometry {
            up: up,
            motion: m,
            zero: (up - m * up.dot(m)).normalize(),
        })
    }

    /// View direction at `angle` degrees around the ring, rotating about the motion direction.
    pub fn direction(&self, angle: f64) -> Vector3<f64> {
        Basis3::from_axis_angle(self.motion, Deg(angle)).rotate_vector(self.zero)
    }

    /// World-frame camera looking along the ring at `angle` degrees with its image x axis along
    /// the motion direction.
    pub fn camera(&self, angle: f64, intrinsics: Intrinsics) -> Result<PerspectiveCamera, Error> {
        let forward = self.direction(angle);
        // image x follows up x forward, which is the motion direction for this up reference
        PerspectiveCamera::from_intrinsics(intrinsics, forward, forward.cross(self.motion))
    }
}

/// Two poses `interval` frames apart. `first` and `second` index into the trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct PosePair {
    pub first: usize,
    pub second: usize,
    pub interval: usize,
    pub baseline: f64,
    pub ring: RingGeometry,
}

/// A candidate pair that was rejected, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSkip {
    pub first: usize,
    pub second: usize,
    pub interval: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PairPlan {
    pub pairs: Vec<PosePair>,
    pub skipped: Vec<PairSkip>,
}

/// Pair every pose with the one `interval` frames later. Pairs with a baseline below
/// `min_baseline` or a motion direction parallel to `up` are skipped.
pub fn plan_pairs(
    trajectory: &Trajectory,
    interval: usize,
    up: Vector3<f64>,
    min_baseline: f64,
) -> PairPlan {
    let mut plan = PairPlan::default();
    if interval == 0 {
        return plan;
    }
    for i in 0..trajectory.len().saturating_sub(interval) {
        let j = i + interval;
        let d = trajectory.poses[j].position - trajectory.poses[i].position;
        let baseline = d.magnitude();
        let skip = |reason: String| PairSkip {
            first: i,
            second: j,
            interval: interval,
            reason: reason,
        };
        if baseline < min_baseline {
            plan.skipped.push(skip(format!(
                "baseline {:.4} m below minimum {:.4} m",
                baseline, min_baseline
            )));
            continue;
        }
        match RingGeometry::new(up, d) {
            Ok(ring) => plan.pairs.push(PosePair {
                first: i,
                second: j,
                interval: interval,
                baseline: baseline,
                ring: ring,
            }),
            Err(e) => plan.skipped.push(skip(e.to_string())),
        }
    }
    plan
}

/// One rendered stereo view pair.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoPairRecord {
    pub first_id: u32,
    pub first_name: String,
    pub second_id: u32,
    pub second_name: String,
    pub interval: usize,
    pub ring_angle: f64,
    pub baseline: f64,
    pub first_output: PathBuf,
    pub second_output: PathBuf,
}

/// Directory holding the pair for `first` at `angle`: `<out>/k<interval>/<stem>/ring_<angle>`.
pub fn pair_directory(out_root: &Path, interval: usize, first: &TrajectoryPose, angle: f64) -> PathBuf {
    out_root
        .join(format!("k{}", interval))
        .join(first.stem())
        .join(format!("ring_{}", angle))
}

/// Render both panoramas of `pair` through the ring camera at `angle` and write them (with masks,
/// when present) under `out_root`.
pub fn render_pair(
    trajectory: &Trajectory,
    pair: &PosePair,
    images: (&ErpImage, &ErpImage),
    angle: f64,
    image_size: u32,
    fov: f64,
    out_root: &Path,
) -> Result<StereoPairRecord, Error> {
    let (a, b) = (&trajectory.poses[pair.first], &trajectory.poses[pair.second]);
    let (w, h) = output_size(image_size, images.0.height());
    let camera = pair.ring.camera(angle, Intrinsics::from_fov(fov, w, h)?)?;

    let dir = pair_directory(out_root, pair.interval, a, angle);
    let first = write_view(images.0, &camera.in_frame(a.rotation), &dir, &a.stem(), &a.extension())?;
    let second = write_view(images.1, &camera.in_frame(b.rotation), &dir, &b.stem(), &b.extension())?;
    debug!(
        "pair {} -> {} (k = {}, ring {}) written to {}",
        a.image_id,
        b.image_id,
        pair.interval,
        angle,
        dir.display()
    );

    Ok(StereoPairRecord {
        first_id: a.image_id,
        first_name: a.name.clone(),
        second_id: b.image_id,
        second_name: b.name.clone(),
        interval: pair.interval,
        ring_angle: angle,
        baseline: pair.baseline,
        first_output: first.image,
        second_output: second.image,
    })
}

/// Write one line per record to `path`, ordered by interval, first pose and ring angle.
///
/// ```txt
/// # INTERVAL RING_ANGLE BASELINE FIRST_ID SECOND_ID FIRST_OUTPUT SECOND_OUTPUT
/// ```
pub fn write_pair_index(records: &[StereoPairRecord], path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(
        &mut file,
        "# INTERVAL RING_ANGLE BASELINE FIRST_ID SECOND_ID FIRST_OUTPUT SECOND_OUTPUT"
    )?;
    let sorted = records.iter().sorted_by(|a, b| {
        (a.interval, &a.first_name)
            .cmp(&(b.interval, &b.first_name))
            .then(a.ring_angle.partial_cmp(&b.ring_angle).unwrap_or(std::cmp::Ordering::Equal))
    });
    for r in sorted {
        writeln!(
            &mut file,
            "{} {} {:.6} {} {} {} {}",
            r.interval,
            r.ring_angle,
            r.baseline,
            r.first_id,
            r.second_id,
            r.first_output.display(),
            r.second_output.display()
        )?;
    }
    Ok(())
}

#[cfg(test)]
fn line(n: usize, step: Vector3<f64>) -> Trajectory {
    Trajectory::new(
        (0..n)
            .map(|i| {
                TrajectoryPose::new(
                    i as u32 + 1,
                    &format!("frame_{:03}.png", i),
                    cgmath::Point3::from_vec(step * i as f64),
                    Basis3::one(),
                )
            })
            .collect(),
    )
}

#[test]
fn test_ring_orthogonality() {
    let ring = RingGeometry::new(Vector3::unit_y(), Vector3::new(1.0, 0.0, 0.3)).unwrap();
    let angles = [0.0, 90.0, 180.0, 270.0];
    for a in angles.iter() {
        let va = ring.direction(*a);
        assert!((va.magnitude() - 1.0).abs() < 1e-12);
        assert!(va.dot(ring.motion).abs() < 1e-12);
        for b in angles.iter() {
            let expected = (a - b).to_radians().cos();
            assert!((va.dot(ring.direction(*b)) - expected).abs() < 1e-9);
        }
    }
    // ring zero leans towards world up
    assert!(ring.direction(0.0).dot(Vector3::unit_y()) > 0.99);
}

#[test]
fn test_ring_camera_is_rectified() {
    let ring = RingGeometry::new(Vector3::unit_y(), Vector3::unit_z()).unwrap();
    let camera = ring
        .camera(120.0, Intrinsics::from_fov(75.0, 32, 32).unwrap())
        .unwrap();
    // image x follows the motion direction
    assert!((camera.rotation.x - Vector3::unit_z()).magnitude() < 1e-9);
    assert!((camera.forward() - ring.direction(120.0)).magnitude() < 1e-9);
}

#[test]
fn test_minimum_baseline() {
    let t = line(10, Vector3::new(0.04, 0.0, 0.0));
    let plan = plan_pairs(&t, 1, Vector3::unit_y(), 0.05);
    assert_eq!(plan.pairs.len(), 0);
    assert_eq!(plan.skipped.len(), 9);

    let plan = plan_pairs(&t, 2, Vector3::unit_y(), 0.05);
    assert_eq!(plan.pairs.len(), 8);
    for p in plan.pairs.iter() {
        assert_eq!(p.second, p.first + 2);
        assert!((p.baseline - 0.08).abs() < 1e-9);
    }

    // intervals past the end produce nothing
    assert!(plan_pairs(&t, 10, Vector3::unit_y(), 0.0).pairs.is_empty());
}

#[test]
fn test_vertical_motion_is_skipped() {
    let t = line(4, Vector3::new(0.0, 0.5, 0.0));
    let plan = plan_pairs(&t, 1, Vector3::unit_y(), 0.05);
    assert!(plan.pairs.is_empty());
    assert_eq!(plan.skipped.len(), 3);
    assert!(plan.skipped[0].reason.contains("parallel"));

    // same position twice with no minimum baseline
    let t = line(2, Vector3::new(0.0, 0.0, 0.0));
    let plan = plan_pairs(&t, 1, Vector3::unit_y(), 0.0);
    assert_eq!(plan.skipped.len(), 1);
}

#[test]
fn test_render_pair_layout() {
    let dir = tempfile::tempdir().unwrap();
    let t = line(3, Vector3::new(0.0, 0.0, 0.5));
    let plan = plan_pairs(&t, 2, Vector3::unit_y(), 0.05);
    assert_eq!(plan.pairs.len(), 1);
    let erp = ErpImage::from_fn(PathBuf::from("x.png"), 32, 16, |d| {
        [(d.y.abs() * 255.0) as u8, 20, 20]
    });
    let record =
        render_pair(&t, &plan.pairs[0], (&erp, &erp), 60.0, 8, 75.0, dir.path()).unwrap();
    let pair_dir = dir.path().join("k2").join("frame_000").join("ring_60");
    assert_eq!(record.first_output, pair_dir.join("frame_000.png"));
    assert_eq!(record.second_output, pair_dir.join("frame_002.png"));
    assert!(record.first_output.is_file() && record.second_output.is_file());
    assert_eq!((record.first_id, record.second_id), (1, 3));

    let index = dir.path().join("pairs.txt");
    write_pair_index(&[record], &index).unwrap();
    let contents = std::fs::read_to_string(&index).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(contents.lines().nth(1).unwrap().starts_with("2 60 1.000000 1 3 "));
}
