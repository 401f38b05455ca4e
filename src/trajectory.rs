//! Camera trajectories read from (and written to) COLMAP image files.

extern crate byteorder;
extern crate cgmath;
extern crate itertools;
extern crate nom;

use byteorder::*;
use cgmath::prelude::*;
use cgmath::{Basis3, Point3, Quaternion, Vector3};
#[cfg(test)]
use cgmath::AbsDiffEq;
use itertools::Itertools;
use nom::bytes::complete::{tag, take, take_until};
use nom::character::complete::*;
use nom::combinator::{map_res, rest};
use nom::error::VerboseError;
use nom::multi::count;
use nom::number::complete::*;
use nom::sequence::*;
use nom::IResult;

use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::Error;

/// Pose of one panorama on the trajectory.
///
/// `rotation` takes directions from the panorama's local frame to world, `position` is the
/// panorama centre in world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryPose {
    pub image_id: u32,
    pub camera_id: u32,
    /// Image file name, relative to the image root.
    pub name: String,
    pub position: Point3<f64>,
    pub rotation: Basis3<f64>,
}

impl TrajectoryPose {
    pub fn new(image_id: u32, name: &str, position: Point3<f64>, rotation: Basis3<f64>) -> Self {
        TrajectoryPose {
            image_id: image_id,
            camera_id: 1,
            name: name.to_string(),
            position: position,
            rotation: rotation,
        }
    }

    /// Build a pose from COLMAP's world to camera quaternion `q = (w, x, y, z)` and translation
    /// `t`.
    pub fn from_colmap(image_id: u32, camera_id: u32, name: &str, q: &[f64], t: &[f64]) -> Self {
        let world_to_local = Basis3::from(Quaternion::new(q[0], q[1], q[2], q[3]).normalize());
        let rotation = world_to_local.invert();
        let t = Vector3::new(t[0], t[1], t[2]);
        TrajectoryPose {
            image_id: image_id,
            camera_id: camera_id,
            name: name.to_string(),
            position: Point3::from_vec(-rotation.rotate_vector(t)),
            rotation: rotation,
        }
    }

    /// COLMAP parameters `(q, t)` of this pose. Inverse of [TrajectoryPose::from_colmap].
    pub fn to_colmap(&self) -> ([f64; 4], [f64; 3]) {
        let world_to_local = self.rotation.invert();
        let q = Quaternion::from(world_to_local);
        let t = -world_to_local.rotate_vector(self.position.to_vec());
        ([q.s, q.v.x, q.v.y, q.v.z], [t.x, t.y, t.z])
    }

    /// Express a world direction in the panorama's local frame.
    pub fn world_to_local(&self, v: Vector3<f64>) -> Vector3<f64> {
        self.rotation.invert().rotate_vector(v)
    }

    /// Name without extension, usable as a single path component.
    pub fn stem(&self) -> String {
        let path = Path::new(&self.name);
        let stem = match (path.parent(), path.file_stem()) {
            (Some(parent), Some(stem)) => parent.join(stem),
            _ => path.to_path_buf(),
        };
        stem.to_string_lossy().replace(|c: char| c == '/' || c == '\\', "_")
    }

    /// Extension of the source image, `png` if it has none.
    pub fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "png".to_string())
    }
}

/// Poses ordered by capture sequence.
///
/// COLMAP image ids do not follow capture order, so poses are sorted by image name, which does for
/// frame-numbered captures.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    pub poses: Vec<TrajectoryPose>,
}

impl Trajectory {
    pub fn new(mut poses: Vec<TrajectoryPose>) -> Self {
        poses.sort_by(|a, b| a.name.cmp(&b.name));
        Trajectory { poses: poses }
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Stems used by more than one pose, with the names of those poses.
    pub fn shared_stems(&self) -> Vec<(String, Vec<String>)> {
        self.poses
            .iter()
            .map(|p| (p.stem(), p.name.clone()))
            .into_group_map()
            .into_iter()
            .filter(|(_, names)| names.len() > 1)
            .sorted()
            .collect()
    }

    /// Summed distance between consecutive poses.
    pub fn length(&self) -> f64 {
        self.poses
            .iter()
            .tuple_windows()
            .map(|(a, b)| (b.position - a.position).magnitude())
            .sum()
    }

    /// Parse COLMAP's `images.txt`.
    ///
    /// ```txt
    /// # comment lines
    /// IMAGE_ID QW QX QY QZ TX TY TZ CAMERA_ID NAME
    /// POINTS2D[] as (X, Y, POINT3D_ID)
    /// ...
    /// ```
    /// The 2D point line is ignored and may be empty.
    pub fn from_file_text(filepath: &Path) -> Result<Self, Error> {
        fn unsigned(input: &str) -> IResult<&str, u32, VerboseError<&str>> {
            map_res(digit1, u32::from_str)(input)
        }

        fn image_line(input: &str) -> IResult<&str, TrajectoryPose, VerboseError<&str>> {
            let (input, image_id) = preceded(space0, unsigned)(input)?;
            let (input, q) = count(preceded(space1, double), 4)(input)?;
            let (input, t) = count(preceded(space1, double), 3)(input)?;
            let (input, camera_id) = preceded(space1, unsigned)(input)?;
            let (input, name) = preceded(space1, rest)(input)?;
            Ok((
                input,
                TrajectoryPose::from_colmap(image_id, camera_id, name.trim(), &q, &t),
            ))
        }

        let mut file = File::open(filepath)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let mut poses = Vec::new();
        let mut lines = contents
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim_start().starts_with('#'));
        while let Some((lineno, line)) = lines.next() {
            if line.trim().is_empty() {
                continue;
            }
            let (_, pose) = image_line(line).map_err(|x| match x {
                nom::Err::Error(e) | nom::Err::Failure(e) => Error::ParseError(format!(
                    "{}:{}: {}",
                    filepath.display(),
                    lineno + 1,
                    nom::error::convert_error(line, e)
                )),
                nom::Err::Incomplete(x) => Error::ParseError(format!("{:?}", x)),
            })?;
            poses.push(pose);
            // 2D observations are not needed
            lines.next();
        }

        Ok(Trajectory::new(poses))
    }

    /// Parse COLMAP's `images.bin`.
    pub fn from_file_binary(filepath: &Path) -> Result<Self, Error> {
        fn parse_internal(input: &[u8]) -> IResult<&[u8], Vec<TrajectoryPose>, VerboseError<&[u8]>> {
            let (input, num_images) = le_u64(input)?;
            count(
                |input| {
                    let (input, image_id) = le_u32(input)?;
                    let (input, q) = count(le_f64, 4)(input)?;
                    let (input, t) = count(le_f64, 3)(input)?;
                    let (input, camera_id) = le_u32(input)?;
                    let (input, name) = terminated(take_until("\0"), tag("\0"))(input)?;
                    let (input, num_points) = le_u64(input)?;
                    // each observation is x: f64, y: f64, point3D_id: i64
                    let (input, _) = take(num_points as usize * 24)(input)?;
                    let name = String::from_utf8_lossy(name);
                    Ok((
                        input,
                        TrajectoryPose::from_colmap(image_id, camera_id, &name, &q, &t),
                    ))
                },
                num_images as usize,
            )(input)
        }

        let mut file = File::open(filepath)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        parse_internal(contents.as_slice())
            .map(|x| Trajectory::new(x.1))
            .map_err(|x| match x {
                nom::Err::Error(_) | nom::Err::Failure(_) => Error::ParseError(format!(
                    "{}: binary parse error",
                    filepath.display()
                )),
                nom::Err::Incomplete(x) => Error::ParseError(format!("{:?}", x)),
            })
    }

    /// Read a trajectory from `images.txt`, `images.bin`, or a directory containing either
    /// (binary preferred).
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        if path.is_dir() {
            let bin = path.join("images.bin");
            if bin.is_file() {
                return Self::from_file_binary(&bin);
            }
            return Self::from_file_text(&path.join("images.txt"));
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("txt") => Self::from_file_text(path),
            Some("bin") => Self::from_file_binary(path),
            ext => Err(Error::Configuration(format!(
                "unknown trajectory file extension {:?} for {}",
                ext,
                path.display()
            ))),
        }
    }

    /// Write the trajectory as COLMAP `images.txt` with empty observation lines.
    pub fn write_text(&self, path: &Path) -> Result<(), std::io::Error> {
        let mut file = BufWriter::new(File::create(path)?);
        writeln!(&mut file, "# Image list with two lines of data per image:")?;
        writeln!(
            &mut file,
            "#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME"
        )?;
        writeln!(&mut file, "#   POINTS2D[] as (X, Y, POINT3D_ID)")?;
        writeln!(
            &mut file,
            "# Number of images: {}, mean observations per image: 0",
            self.len()
        )?;
        for pose in &self.poses {
            let (q, t) = pose.to_colmap();
            writeln!(
                &mut file,
                "{} {} {} {} {}",
                pose.image_id,
                q.iter().join(" "),
                t.iter().join(" "),
                pose.camera_id,
                pose.name
            )?;
            writeln!(&mut file)?;
        }
        Ok(())
    }

    /// Write the trajectory as COLMAP `images.bin` without observations.
    pub fn write_binary(&self, path: &Path) -> Result<(), std::io::Error> {
        let mut file = BufWriter::new(File::create(path)?);
        file.write_u64::<LittleEndian>(self.len() as u64)?;
        for pose in &self.poses {
            let (q, t) = pose.to_colmap();
            file.write_u32::<LittleEndian>(pose.image_id)?;
            for x in q.iter().chain(t.iter()) {
                file.write_f64::<LittleEndian>(*x)?;
            }
            file.write_u32::<LittleEndian>(pose.camera_id)?;
            file.write_all(pose.name.as_bytes())?;
            file.write_u8(0)?;
            file.write_u64::<LittleEndian>(0)?;
        }
        Ok(())
    }

    /// Write in COLMAP format, text or binary chosen from the extension. `.txt` -> text, `.bin` ->
    /// binary.
    pub fn write(&self, path: &Path) -> Result<(), std::io::Error> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("txt") => self.write_text(path),
            Some("bin") => self.write_binary(path),
            ext => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown file extension {:?}", ext),
            )),
        }
    }
}

impl std::fmt::Display for Trajectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Trajectory with {} poses spanning {:.3} m",
            self.len(),
            self.length()
        )
    }
}

#[cfg(test)]
fn assert_pose_eq(a: &TrajectoryPose, b: &TrajectoryPose) {
    assert_eq!(a.image_id, b.image_id);
    assert_eq!(a.camera_id, b.camera_id);
    assert_eq!(a.name, b.name);
    assert!(a.position.abs_diff_eq(&b.position, 1e-9));
    let v = Vector3::new(0.3, -0.2, 0.9);
    assert!(a
        .rotation
        .rotate_vector(v)
        .abs_diff_eq(&b.rotation.rotate_vector(v), 1e-9));
}

#[cfg(test)]
fn example_trajectory() -> Trajectory {
    Trajectory::new(vec![
        TrajectoryPose::new(
            7,
            "seq/frame_0002.jpg",
            Point3::new(1.0, 0.5, -2.0),
            Basis3::from_angle_y(cgmath::Deg(30.0)),
        ),
        TrajectoryPose::new(3, "seq/frame_0001.jpg", Point3::new(0.0, 0.5, -2.0), Basis3::one()),
    ])
}

#[test]
fn test_from_colmap_center() {
    // identity rotation, camera 1m in front of the origin along +z
    let pose = TrajectoryPose::from_colmap(1, 1, "a.png", &[1.0, 0.0, 0.0, 0.0], &[0.0, 0.0, -1.0]);
    assert!(pose.position.abs_diff_eq(&Point3::new(0.0, 0.0, 1.0), 1e-12));

    let pose = example_trajectory().poses[1].clone();
    let (q, t) = pose.to_colmap();
    assert_pose_eq(&TrajectoryPose::from_colmap(7, 1, &pose.name, &q, &t), &pose);
}

#[test]
fn test_sorted_by_name() {
    let t = example_trajectory();
    assert_eq!(t.poses[0].name, "seq/frame_0001.jpg");
    assert!((t.length() - 1.0).abs() < 1e-12);
    assert_eq!(t.poses[0].stem(), "seq_frame_0001");
    assert_eq!(t.poses[0].extension(), "jpg");
}

#[test]
fn test_shared_stems() {
    let t = Trajectory::new(vec![
        TrajectoryPose::new(1, "a/b_c.jpg", Point3::new(0.0, 0.0, 0.0), Basis3::one()),
        TrajectoryPose::new(2, "a_b/c.jpg", Point3::new(0.0, 0.0, 1.0), Basis3::one()),
        TrajectoryPose::new(3, "a/d.jpg", Point3::new(0.0, 0.0, 2.0), Basis3::one()),
    ]);
    let shared = t.shared_stems();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].0, "a_b_c");
    assert_eq!(shared[0].1, vec!["a/b_c.jpg".to_string(), "a_b/c.jpg".to_string()]);
    assert!(example_trajectory().shared_stems().is_empty());
}

#[test]
fn test_parse_text() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("images.txt");
    std::fs::write(
        &path,
        "# Image list with two lines of data per image:\n\
         #   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME\n\
         #   POINTS2D[] as (X, Y, POINT3D_ID)\n\
         # Number of images: 2, mean observations per image: 1\n\
         2 1 0 0 0 0 0 -2.5 1 pano_b.jpg\n\
         10.5 3.25 -1\n\
         1 1 0 0 0 0 0 -1 1 pano_a.jpg\n\
         \n",
    )
    .unwrap();
    let t = Trajectory::from_path(&path).unwrap();
    assert_eq!(t.len(), 2);
    assert_eq!(t.poses[0].name, "pano_a.jpg");
    assert_eq!(t.poses[1].image_id, 2);
    assert!(t.poses[1]
        .position
        .abs_diff_eq(&Point3::new(0.0, 0.0, 2.5), 1e-12));
}

#[test]
fn test_parse_text_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("images.txt");
    std::fs::write(&path, "1 1 0 0 zero 0 0 0 1 a.jpg\n\n").unwrap();
    match Trajectory::from_path(&path) {
        Err(Error::ParseError(msg)) => assert!(msg.contains("images.txt:1")),
        x => panic!("expected a parse error, got {:?}", x),
    }
}

#[test]
fn test_write_read() {
    let dir = tempfile::tempdir().unwrap();
    let t = example_trajectory();
    for name in ["images.txt", "images.bin"].iter() {
        let path = dir.path().join(name);
        t.write(&path).unwrap();
        let read = Trajectory::from_path(&path).unwrap();
        assert_eq!(read.len(), t.len());
        for (a, b) in read.poses.iter().zip(t.poses.iter()) {
            assert_pose_eq(a, b);
        }
    }
    // directories prefer the binary file
    assert_eq!(Trajectory::from_path(dir.path()).unwrap().len(), 2);
}
