extern crate cgmath;
extern crate ctrlc;
extern crate env_logger;
extern crate log;
extern crate pano2persp;
extern crate structopt;

use cgmath::Vector3;
use log::warn;
use pano2persp::cubic::ViewRequest;
use pano2persp::synthetic::*;
use pano2persp::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use structopt::StructOpt;

// helper to parse labelled view directions like `front=0,0,1`
fn parse_direction(s: &str) -> Result<(String, Vector3<f64>), String> {
    let mut parts = s.splitn(2, '=');
    let label = parts.next().unwrap_or("").trim();
    let components = parts
        .next()
        .ok_or_else(|| format!("expected <label>=<x>,<y>,<z>, got {}", s))?;
    let v = components
        .split(',')
        .map(|x| f64::from_str(x.trim()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    if label.is_empty() || v.len() != 3 {
        return Err(format!("expected <label>=<x>,<y>,<z>, got {}", s));
    }
    Ok((label.to_string(), Vector3::new(v[0], v[1], v[2])))
}

#[derive(StructOpt, Debug)]
struct RenderOpt {
    /// Size in pixels of the square output images. 0 uses half the panorama height.
    #[structopt(long = "image-size", default_value = "0")]
    image_size: u32,

    /// World up vector as three comma separated components.
    #[structopt(
        long = "up",
        default_value = "0,1,0",
        use_delimiter = true,
        allow_hyphen_values = true
    )]
    up: Vec<f64>,

    /// Number of worker threads. 0 uses one per core.
    #[structopt(long = "threads", default_value = "0")]
    num_threads: usize,

    /// Hide progress bars.
    #[structopt(long = "quiet")]
    quiet: bool,
}

impl RenderOpt {
    fn options(&self, fov: f64) -> Result<RenderOptions, Error> {
        Ok(RenderOptions {
            image_size: self.image_size,
            fov: fov,
            up: parse_up_vector(&self.up)?,
            num_threads: self.num_threads,
            verbose: !self.quiet,
        })
    }
}

#[derive(StructOpt, Debug)]
struct CubicOpt {
    /// Trajectory in COLMAP format: images.txt, images.bin or a directory holding one of them.
    #[structopt(name = "TRAJECTORY", parse(from_os_str))]
    input: PathBuf,

    /// Output directory. Views are written to <OUT>/<image>/<view>.<ext>.
    #[structopt(name = "OUT", parse(from_os_str))]
    output: PathBuf,

    /// Directory of equirectangular panoramas, looked up by image name.
    #[structopt(long = "image-path", parse(from_os_str))]
    image_path: PathBuf,

    /// Optional directory of panorama masks, looked up by image name or the same name as .png.
    #[structopt(long = "mask-path", parse(from_os_str))]
    mask_path: Option<PathBuf>,

    /// Cube faces to export: 0 +X, 1 -X, 2 +Y, 3 -Y, 4 +Z, 5 -Z.
    #[structopt(
        long = "views",
        default_value = "0,1,2,3,4,5",
        use_delimiter = true,
        allow_hyphen_values = true
    )]
    views: Vec<i64>,

    /// Additional view directions as <label>=<x>,<y>,<z> in the panorama frame. May be repeated.
    #[structopt(
        long = "direction",
        number_of_values = 1,
        allow_hyphen_values = true,
        parse(try_from_str = parse_direction)
    )]
    directions: Vec<(String, Vector3<f64>)>,

    /// Horizontal field of view of the output views in degrees.
    #[structopt(long = "fov", default_value = "45")]
    fov: f64,

    #[structopt(flatten)]
    render: RenderOpt,
}

#[derive(StructOpt, Debug)]
struct StereoOpt {
    /// Trajectory in COLMAP format: images.txt, images.bin or a directory holding one of them.
    #[structopt(name = "TRAJECTORY", parse(from_os_str))]
    input: PathBuf,

    /// Output directory. Pairs are written to <OUT>/k<interval>/<image>/ring_<angle>/.
    #[structopt(name = "OUT", parse(from_os_str))]
    output: PathBuf,

    /// Directory of equirectangular panoramas, looked up by image name.
    #[structopt(long = "image-path", parse(from_os_str))]
    image_path: PathBuf,

    /// Optional directory of panorama masks, looked up by image name or the same name as .png.
    #[structopt(long = "mask-path", parse(from_os_str))]
    mask_path: Option<PathBuf>,

    /// Frame offsets between the two images of a pair. Non-positive values are skipped.
    #[structopt(
        long = "intervals",
        default_value = "10",
        use_delimiter = true,
        allow_hyphen_values = true
    )]
    intervals: Vec<i64>,

    /// Angles in degrees around the ring perpendicular to the direction of motion.
    #[structopt(
        long = "ring-angles",
        default_value = "0,60,120,180,240,300",
        use_delimiter = true,
        allow_hyphen_values = true
    )]
    ring_angles: Vec<f64>,

    /// Pairs closer than this many meters are skipped.
    #[structopt(long = "min-baseline", default_value = "0.05")]
    min_baseline: f64,

    /// Horizontal field of view of the output views in degrees.
    #[structopt(long = "fov", default_value = "75")]
    fov: f64,

    #[structopt(flatten)]
    render: RenderOpt,
}

#[derive(StructOpt, Debug)]
struct SyntheticOpt {
    /// Shape of the trajectory: line or circle.
    #[structopt(long = "path", default_value = "line")]
    path: SyntheticPath,

    /// Number of panoramas.
    #[structopt(long = "frames", default_value = "20")]
    num_frames: usize,

    /// Distance between frames for lines, radius for circles, in meters.
    #[structopt(long = "size", default_value = "0.1")]
    size: f64,

    /// Standard deviation of Gaussian noise added to positions.
    #[structopt(long = "jitter", default_value = "0")]
    jitter: f64,

    /// Panorama width in pixels. The height is half of it.
    #[structopt(long = "width", default_value = "512")]
    width: u32,

    /// Also write masks blocking this many degrees around the lower pole.
    #[structopt(long = "mask-cap")]
    mask_cap: Option<f64>,

    /// Write the trajectory as images.bin instead of images.txt.
    #[structopt(long = "binary")]
    binary: bool,

    /// Hide progress bars.
    #[structopt(long = "quiet")]
    quiet: bool,

    /// Output directory.
    #[structopt(name = "OUT", parse(from_os_str))]
    output: PathBuf,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "pano2persp",
    about = "Reproject equirectangular panoramas into perspective views and stereo pairs."
)]
enum Opt {
    /// Export perspective views (cube faces by default) of every panorama.
    Cubic(CubicOpt),
    /// Export rectified stereo pairs from panoramas along the trajectory.
    Stereo(StereoOpt),
    /// Generate a synthetic trajectory with procedural panoramas.
    Synthetic(SyntheticOpt),
}

fn cancel_flag() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let result = ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            warn!("Received Ctrl-C, finishing running views");
            cancel.store(true, Ordering::SeqCst);
        }
    });
    if let Err(e) = result {
        warn!("could not install Ctrl-C handler: {}", e);
    }
    cancel
}

fn run_cubic_cmd(opt: CubicOpt) -> Result<(), Error> {
    let mut views = opt
        .views
        .iter()
        .map(|&id| ViewRequest::Face(id))
        .collect::<Vec<_>>();
    views.extend(
        opt.directions
            .into_iter()
            .map(|(label, direction)| ViewRequest::Direction {
                label: label,
                direction: direction,
            }),
    );
    let job = CubicJob {
        out_root: opt.output,
        views: views,
        options: opt.render.options(opt.fov)?,
    };
    job.validate()?;
    let store = DirectoryStore::new(&opt.image_path, opt.mask_path.as_deref())?;
    let trajectory = Trajectory::from_path(&opt.input)?;
    println!("{}", trajectory);

    let report = run_cubic(&trajectory, &store, &job, &cancel_flag())?;
    println!("{}", report);
    Ok(())
}

fn run_stereo_cmd(opt: StereoOpt) -> Result<(), Error> {
    let job = StereoJob {
        out_root: opt.output,
        intervals: opt.intervals,
        ring_angles: opt.ring_angles,
        min_baseline: opt.min_baseline,
        options: opt.render.options(opt.fov)?,
    };
    job.validate()?;
    let store = DirectoryStore::new(&opt.image_path, opt.mask_path.as_deref())?;
    let trajectory = Trajectory::from_path(&opt.input)?;
    println!("{}", trajectory);

    let report = run_stereo(&trajectory, &store, &job, &cancel_flag())?;
    println!("{}", report);
    Ok(())
}

fn run_synthetic_cmd(opt: SyntheticOpt) -> Result<(), Error> {
    if !(opt.jitter.is_finite() && opt.jitter >= 0.0) {
        return Err(Error::Configuration(format!(
            "jitter must be non-negative, got {}",
            opt.jitter
        )));
    }
    let trajectory = opt.path.trajectory(opt.num_frames, opt.size, opt.jitter);
    println!("{}", trajectory);
    let file = if opt.binary {
        "images.bin"
    } else {
        "images.txt"
    };
    write_dataset(
        &trajectory,
        &opt.output,
        opt.width,
        opt.width / 2,
        opt.mask_cap,
        file,
        !opt.quiet,
    )
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match Opt::from_args() {
        Opt::Cubic(opt) => run_cubic_cmd(opt),
        Opt::Stereo(opt) => run_stereo_cmd(opt),
        Opt::Synthetic(opt) => run_synthetic_cmd(opt),
    }
}
