//! Export jobs: validation, work items and the worker pool that runs them.

extern crate cgmath;
extern crate indicatif;
extern crate rayon;

use cgmath::{InnerSpace, Vector3};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::camera::Intrinsics;
use crate::cubic::*;
use crate::erp::ErpImage;
use crate::stereo::*;
use crate::trajectory::*;
use crate::Error;

pub(crate) fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40}] {percent}% ({eta})")
            .progress_chars("#-"),
    );
    pb.set_message(message);
    pb
}

/// Parse a world up vector from its components. It must have exactly three finite components and
/// a non-zero length. The result is normalized.
pub fn parse_up_vector(components: &[f64]) -> Result<Vector3<f64>, Error> {
    if components.len() != 3 {
        return Err(Error::Configuration(format!(
            "up vector needs 3 components, got {}",
            components.len()
        )));
    }
    let up = Vector3::new(components[0], components[1], components[2]);
    let len = up.magnitude();
    if !(len.is_finite() && len > 1e-12) {
        return Err(Error::Configuration(format!(
            "up vector {:?} has no direction",
            components
        )));
    }
    Ok(up / len)
}

/// Options shared by every rendered view.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    /// Square output size in pixels, 0 for half the panorama height.
    pub image_size: u32,
    /// Horizontal field of view in degrees.
    pub fov: f64,
    pub up: Vector3<f64>,
    /// Worker threads, 0 for one per core.
    pub num_threads: usize,
    /// Show progress bars.
    pub verbose: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            image_size: 0,
            fov: 45.0,
            up: Vector3::unit_y(),
            num_threads: 0,
            verbose: false,
        }
    }
}

impl RenderOptions {
    pub fn validate(&self) -> Result<(), Error> {
        Intrinsics::from_fov(self.fov, 1, 1)?;
        parse_up_vector(&[self.up.x, self.up.y, self.up.z])?;
        Ok(())
    }
}

/// Source of decoded panoramas for trajectory poses.
pub trait ImageStore: Sync {
    fn load(&self, pose: &TrajectoryPose) -> Result<Arc<ErpImage>, Error>;
}

/// Panoramas read from disk, `<image_root>/<name>`, with optional masks under `mask_root`.
///
/// A mask is looked up under the image's name first and then under the same name with a `.png`
/// extension. Images without a mask file are exported without one.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    pub image_root: PathBuf,
    pub mask_root: Option<PathBuf>,
}

impl DirectoryStore {
    pub fn new(image_root: &Path, mask_root: Option<&Path>) -> Result<Self, Error> {
        if !image_root.is_dir() {
            return Err(Error::Configuration(format!(
                "image directory {} does not exist",
                image_root.display()
            )));
        }
        if let Some(m) = mask_root {
            if !m.is_dir() {
                return Err(Error::Configuration(format!(
                    "mask directory {} does not exist",
                    m.display()
                )));
            }
        }
        Ok(DirectoryStore {
            image_root: image_root.to_path_buf(),
            mask_root: mask_root.map(|m| m.to_path_buf()),
        })
    }

    pub fn mask_path(&self, pose: &TrajectoryPose) -> Option<PathBuf> {
        let root = self.mask_root.as_ref()?;
        let same = root.join(&pose.name);
        if same.is_file() {
            return Some(same);
        }
        let png = same.with_extension("png");
        if png.is_file() {
            Some(png)
        } else {
            None
        }
    }
}

impl ImageStore for DirectoryStore {
    fn load(&self, pose: &TrajectoryPose) -> Result<Arc<ErpImage>, Error> {
        let mask = self.mask_path(pose);
        if mask.is_none() && self.mask_root.is_some() {
            warn!("no mask for image {} ({})", pose.image_id, pose.name);
        }
        ErpImage::open(&self.image_root.join(&pose.name), mask.as_deref()).map(Arc::new)
    }
}

/// Panoramas held in memory, keyed by image name.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    pub images: HashMap<String, Arc<ErpImage>>,
}

impl MemoryStore {
    pub fn insert(&mut self, name: &str, image: ErpImage) {
        self.images.insert(name.to_string(), Arc::new(image));
    }
}

impl ImageStore for MemoryStore {
    fn load(&self, pose: &TrajectoryPose) -> Result<Arc<ErpImage>, Error> {
        self.images
            .get(&pose.name)
            .cloned()
            .ok_or_else(|| Error::MissingSource {
                path: PathBuf::from(&pose.name),
                reason: "not in memory store".to_string(),
            })
    }
}

/// Perspective views of every panorama on a trajectory.
#[derive(Debug, Clone)]
pub struct CubicJob {
    pub out_root: PathBuf,
    pub views: Vec<ViewRequest>,
    pub options: RenderOptions,
}

impl CubicJob {
    pub fn validate(&self) -> Result<(), Error> {
        self.options.validate()?;
        if self.views.is_empty() {
            return Err(Error::Configuration("no views requested".to_string()));
        }
        Ok(())
    }
}

/// Ring stereo pairs for a set of frame intervals.
#[derive(Debug, Clone)]
pub struct StereoJob {
    pub out_root: PathBuf,
    /// Frame offsets between the two poses of a pair. Non-positive entries are dropped.
    pub intervals: Vec<i64>,
    /// Ring angles in degrees.
    pub ring_angles: Vec<f64>,
    /// Minimum distance in meters between the two poses of a pair.
    pub min_baseline: f64,
    pub options: RenderOptions,
}

impl StereoJob {
    pub fn validate(&self) -> Result<(), Error> {
        self.options.validate()?;
        if self.ring_angles.is_empty() {
            return Err(Error::Configuration("no ring angles given".to_string()));
        }
        if let Some(a) = self.ring_angles.iter().find(|a| !a.is_finite()) {
            return Err(Error::Configuration(format!("invalid ring angle {}", a)));
        }
        if !(self.min_baseline.is_finite() && self.min_baseline >= 0.0) {
            return Err(Error::Configuration(format!(
                "minimum baseline must be a non-negative distance, got {}",
                self.min_baseline
            )));
        }
        Ok(())
    }

    /// Positive intervals without repeats, in the order given. Each rejected interval is reported
    /// once.
    pub fn valid_intervals(&self) -> Vec<usize> {
        let mut intervals = Vec::new();
        for &k in self.intervals.iter() {
            if k <= 0 {
                warn!("skipping invalid baseline interval {}", k);
            } else if intervals.contains(&(k as usize)) {
                warn!("skipping repeated baseline interval {}", k);
            } else {
                intervals.push(k as usize);
            }
        }
        intervals
    }

    /// Ring angles without repeats, in the order given.
    pub fn unique_ring_angles(&self) -> Vec<f64> {
        let mut angles: Vec<f64> = Vec::new();
        for &a in self.ring_angles.iter() {
            if angles.contains(&a) {
                warn!("skipping repeated ring angle {}", a);
            } else {
                angles.push(a);
            }
        }
        angles
    }
}

/// One source panorama and the views requested from it.
#[derive(Debug, Clone)]
pub struct FaceExportItem {
    pub pose: usize,
    pub views: Vec<ViewRequest>,
}

/// One pose pair and the ring angles to render it at.
#[derive(Debug, Clone)]
pub struct StereoPairItem {
    pub pair: PosePair,
    pub angles: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum WorkItem {
    Faces(FaceExportItem),
    Stereo(StereoPairItem),
}

/// Read-only state shared by every work item of a job.
pub struct ExportContext<'a> {
    pub trajectory: &'a Trajectory,
    pub store: &'a dyn ImageStore,
    pub options: &'a RenderOptions,
    pub out_root: &'a Path,
    pub cancel: &'a AtomicBool,
}

/// Counts of written, skipped and cancelled views.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub records: Vec<StereoPairRecord>,
}

impl ExportReport {
    pub fn merge(mut self, other: ExportReport) -> Self {
        self.succeeded += other.succeeded;
        self.skipped += other.skipped;
        self.cancelled += other.cancelled;
        self.records.extend(other.records);
        self
    }

    fn single(succeeded: usize, skipped: usize, cancelled: usize) -> Self {
        ExportReport {
            succeeded: succeeded,
            skipped: skipped,
            cancelled: cancelled,
            records: Vec::new(),
        }
    }
}

impl std::fmt::Display for ExportReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Exported {} views ({} skipped, {} cancelled)",
            self.succeeded, self.skipped, self.cancelled
        )
    }
}

impl WorkItem {
    /// Number of views this item writes when everything succeeds.
    pub fn num_views(&self) -> usize {
        match self {
            WorkItem::Faces(item) => item.views.len(),
            WorkItem::Stereo(item) => 2 * item.angles.len(),
        }
    }

    fn run(&self, ctx: &ExportContext) -> ExportReport {
        match self {
            WorkItem::Faces(item) => item.run(ctx),
            WorkItem::Stereo(item) => item.run(ctx),
        }
    }
}

impl FaceExportItem {
    fn run(&self, ctx: &ExportContext) -> ExportReport {
        if ctx.cancel.load(Ordering::Relaxed) {
            return ExportReport::single(0, 0, self.views.len());
        }
        let pose = &ctx.trajectory.poses[self.pose];
        let erp = match ctx.store.load(pose) {
            Ok(erp) => erp,
            Err(e) => {
                warn!("skipping image {} ({}): {}", pose.image_id, pose.name, e);
                return ExportReport::single(0, self.views.len(), 0);
            }
        };
        let dir = ctx.out_root.join(pose.stem());
        let ext = pose.extension();

        self.views
            .par_iter()
            .map(|view| {
                if ctx.cancel.load(Ordering::Relaxed) {
                    return ExportReport::single(0, 0, 1);
                }
                if view.resolve().is_none() {
                    warn!(
                        "skipping unknown view {} for image {} ({})",
                        view.label(),
                        pose.image_id,
                        pose.name
                    );
                    return ExportReport::single(0, 1, 0);
                }
                match export_view(
                    &erp,
                    view,
                    ctx.options.image_size,
                    ctx.options.fov,
                    ctx.options.up,
                    &dir,
                    &ext,
                ) {
                    Ok(_) => ExportReport::single(1, 0, 0),
                    Err(e) => {
                        warn!(
                            "failed view {} for image {} ({}): {}",
                            view.label(),
                            pose.image_id,
                            pose.name,
                            e
                        );
                        ExportReport::single(0, 1, 0)
                    }
                }
            })
            .reduce(ExportReport::default, ExportReport::merge)
    }
}

impl StereoPairItem {
    fn run(&self, ctx: &ExportContext) -> ExportReport {
        if ctx.cancel.load(Ordering::Relaxed) {
            return ExportReport::single(0, 0, 2 * self.angles.len());
        }
        let pair = &self.pair;
        let (a, b) = (
            &ctx.trajectory.poses[pair.first],
            &ctx.trajectory.poses[pair.second],
        );
        let images = ctx
            .store
            .load(a)
            .and_then(|first| ctx.store.load(b).map(|second| (first, second)));
        let (first, second) = match images {
            Ok(images) => images,
            Err(e) => {
                warn!(
                    "skipping pair {} -> {} (k = {}): {}",
                    a.image_id, b.image_id, pair.interval, e
                );
                return ExportReport::single(0, 2 * self.angles.len(), 0);
            }
        };

        self.angles
            .par_iter()
            .map(|&angle| {
                if ctx.cancel.load(Ordering::Relaxed) {
                    return ExportReport::single(0, 0, 2);
                }
                match render_pair(
                    ctx.trajectory,
                    pair,
                    (&*first, &*second),
                    angle,
                    ctx.options.image_size,
                    ctx.options.fov,
                    ctx.out_root,
                ) {
                    Ok(record) => {
                        let mut report = ExportReport::single(2, 0, 0);
                        report.records.push(record);
                        report
                    }
                    Err(e) => {
                        warn!(
                            "failed pair {} -> {} (k = {}, ring {}): {}",
                            a.image_id, b.image_id, pair.interval, angle, e
                        );
                        ExportReport::single(0, 2, 0)
                    }
                }
            })
            .reduce(ExportReport::default, ExportReport::merge)
    }
}

/// Images whose names flatten to the same stem write into the same output directory.
fn warn_shared_stems(trajectory: &Trajectory) {
    for (stem, names) in trajectory.shared_stems() {
        warn!(
            "images {} share the output name {}, their views overwrite each other",
            names.join(", "),
            stem
        );
    }
}

/// Run `items` on a pool of `ctx.options.num_threads` workers. Failures are logged and counted,
/// never propagated. Once `ctx.cancel` is set, remaining views are counted as cancelled.
pub fn run_work_items(
    items: &[WorkItem],
    ctx: &ExportContext,
    message: &str,
) -> Result<ExportReport, Error> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.options.num_threads)
        .build()
        .map_err(|e| Error::Configuration(format!("could not start worker pool: {}", e)))?;

    Ok(pool.install(|| {
        items
            .par_iter()
            .progress_with(progress_bar(items.len() as u64, message, ctx.options.verbose))
            .map(|item| item.run(ctx))
            .reduce(ExportReport::default, ExportReport::merge)
    }))
}

/// Export the requested views of every panorama on `trajectory` into
/// `<out_root>/<image stem>/<view label>.<ext>`.
pub fn run_cubic(
    trajectory: &Trajectory,
    store: &dyn ImageStore,
    job: &CubicJob,
    cancel: &AtomicBool,
) -> Result<ExportReport, Error> {
    job.validate()?;
    info!(
        "exporting {} views for each of {} images to {}",
        job.views.len(),
        trajectory.len(),
        job.out_root.display()
    );
    std::fs::create_dir_all(&job.out_root)?;
    warn_shared_stems(trajectory);

    let items = (0..trajectory.len())
        .map(|i| {
            WorkItem::Faces(FaceExportItem {
                pose: i,
                views: job.views.clone(),
            })
        })
        .collect::<Vec<_>>();
    let ctx = ExportContext {
        trajectory: trajectory,
        store: store,
        options: &job.options,
        out_root: &job.out_root,
        cancel: cancel,
    };
    let report = run_work_items(&items, &ctx, "Exporting views")?;
    info!("{}", report);
    Ok(report)
}

/// Export ring stereo pairs for every valid interval of `job` into
/// `<out_root>/k<interval>/<first stem>/ring_<angle>/`, with an index of all pairs in
/// `<out_root>/pairs.txt`.
pub fn run_stereo(
    trajectory: &Trajectory,
    store: &dyn ImageStore,
    job: &StereoJob,
    cancel: &AtomicBool,
) -> Result<ExportReport, Error> {
    job.validate()?;
    let intervals = job.valid_intervals();
    if intervals.is_empty() {
        warn!("no valid baseline intervals, nothing to export");
        return Ok(ExportReport::default());
    }

    let angles = job.unique_ring_angles();
    warn_shared_stems(trajectory);

    let mut report = ExportReport::default();
    let mut items = Vec::new();
    for &k in intervals.iter() {
        let plan = plan_pairs(trajectory, k, job.options.up, job.min_baseline);
        info!(
            "interval {}: {} pairs, {} skipped",
            k,
            plan.pairs.len(),
            plan.skipped.len()
        );
        for skip in plan.skipped.iter() {
            warn!(
                "skipping pair {} -> {} (k = {}): {}",
                trajectory.poses[skip.first].image_id,
                trajectory.poses[skip.second].image_id,
                skip.interval,
                skip.reason
            );
        }
        report.skipped += 2 * angles.len() * plan.skipped.len();
        items.extend(plan.pairs.into_iter().map(|pair| {
            WorkItem::Stereo(StereoPairItem {
                pair: pair,
                angles: angles.clone(),
            })
        }));
    }

    if !items.is_empty() {
        std::fs::create_dir_all(&job.out_root)?;
    }
    let ctx = ExportContext {
        trajectory: trajectory,
        store: store,
        options: &job.options,
        out_root: &job.out_root,
        cancel: cancel,
    };
    let report = report.merge(run_work_items(&items, &ctx, "Exporting stereo pairs")?);
    if !report.records.is_empty() {
        write_pair_index(&report.records, &job.out_root.join("pairs.txt"))?;
    }
    info!("{}", report);
    Ok(report)
}

#[cfg(test)]
fn test_store(trajectory: &Trajectory) -> MemoryStore {
    let mut store = MemoryStore::default();
    for pose in trajectory.poses.iter() {
        store.insert(
            &pose.name,
            ErpImage::from_fn(PathBuf::from(&pose.name), 32, 16, |d| {
                [(d.x.abs() * 255.0) as u8, (d.y.abs() * 255.0) as u8, 50]
            }),
        );
    }
    store
}

#[cfg(test)]
fn stereo_job(out_root: &Path, intervals: Vec<i64>) -> StereoJob {
    StereoJob {
        out_root: out_root.to_path_buf(),
        intervals: intervals,
        ring_angles: vec![0.0, 90.0],
        min_baseline: 0.05,
        options: RenderOptions {
            image_size: 8,
            fov: 75.0,
            ..RenderOptions::default()
        },
    }
}

#[test]
fn test_parse_up_vector() {
    let up = parse_up_vector(&[0.0, 2.0, 0.0]).unwrap();
    assert_eq!(up, Vector3::unit_y());
    assert!(parse_up_vector(&[0.0, 1.0]).is_err());
    assert!(parse_up_vector(&[0.0, 0.0, 0.0]).is_err());
    assert!(parse_up_vector(&[std::f64::NAN, 1.0, 0.0]).is_err());
}

#[test]
fn test_invalid_intervals_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let trajectory = crate::synthetic::line_trajectory(5, 0.1, 0.0);
    let store = test_store(&trajectory);
    let job = stereo_job(&out, vec![0, -3]);
    assert!(job.valid_intervals().is_empty());
    let report = run_stereo(&trajectory, &store, &job, &AtomicBool::new(false)).unwrap();
    assert_eq!(report, ExportReport::default());
    assert!(!out.exists());
}

#[test]
fn test_run_stereo() {
    let dir = tempfile::tempdir().unwrap();
    let trajectory = crate::synthetic::line_trajectory(5, 0.04, 0.0);
    let store = test_store(&trajectory);
    let job = stereo_job(dir.path(), vec![-1, 1, 2]);
    assert_eq!(job.valid_intervals(), vec![1, 2]);
    let report = run_stereo(&trajectory, &store, &job, &AtomicBool::new(false)).unwrap();
    // k = 1 is below the minimum baseline, k = 2 gives three pairs
    assert_eq!(report.records.len(), 6);
    assert_eq!(report.succeeded, 12);
    assert_eq!(report.skipped, 16);
    for r in report.records.iter() {
        assert_eq!(r.interval, 2);
        assert!(r.first_output.is_file() && r.second_output.is_file());
    }
    assert!(dir.path().join("pairs.txt").is_file());
    assert!(!dir.path().join("k1").exists());
}

#[test]
fn test_run_stereo_skips_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let trajectory = crate::synthetic::line_trajectory(4, 0.1, 0.0);
    let store = test_store(&trajectory);
    let mut job = stereo_job(dir.path(), vec![2, 2, -1]);
    job.ring_angles = vec![0.0, 0.0, 90.0];
    assert_eq!(job.valid_intervals(), vec![2]);
    assert_eq!(job.unique_ring_angles(), vec![0.0, 90.0]);
    let report = run_stereo(&trajectory, &store, &job, &AtomicBool::new(false)).unwrap();
    // two pairs at two angles
    assert_eq!(report.records.len(), 4);
    assert_eq!(report.succeeded, 8);
    assert_eq!(report.skipped, 0);
    let outputs: std::collections::HashSet<_> =
        report.records.iter().map(|r| r.first_output.clone()).collect();
    assert_eq!(outputs.len(), 4);
}

#[test]
fn test_run_cubic_isolates_failures() {
    let dir = tempfile::tempdir().unwrap();
    let trajectory = crate::synthetic::line_trajectory(3, 0.1, 0.0);
    let mut store = test_store(&trajectory);
    store.images.remove(&trajectory.poses[1].name);
    let job = CubicJob {
        out_root: dir.path().to_path_buf(),
        views: vec![ViewRequest::Face(0), ViewRequest::Face(7)],
        options: RenderOptions {
            num_threads: 2,
            ..RenderOptions::default()
        },
    };
    let report = run_cubic(&trajectory, &store, &job, &AtomicBool::new(false)).unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.skipped, 4);
    assert_eq!(report.to_string(), "Exported 2 views (4 skipped, 0 cancelled)");
    let first = dir.path().join(trajectory.poses[0].stem());
    assert!(first.join("0.png").is_file());
    assert!(!first.join("7.png").exists());
}

#[cfg(test)]
struct CountingStore {
    inner: MemoryStore,
    loads: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ImageStore for CountingStore {
    fn load(&self, pose: &TrajectoryPose) -> Result<Arc<ErpImage>, Error> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(pose)
    }
}

#[test]
fn test_cancelled_job_loads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let trajectory = crate::synthetic::line_trajectory(3, 0.1, 0.0);
    let store = CountingStore {
        inner: test_store(&trajectory),
        loads: std::sync::atomic::AtomicUsize::new(0),
    };
    let job = CubicJob {
        out_root: dir.path().to_path_buf(),
        views: default_views(),
        options: RenderOptions::default(),
    };
    let report = run_cubic(&trajectory, &store, &job, &AtomicBool::new(true)).unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.cancelled, 18);

    let stereo = stereo_job(dir.path(), vec![1]);
    let report = run_stereo(&trajectory, &store, &stereo, &AtomicBool::new(true)).unwrap();
    assert_eq!(report.cancelled, 8);
    assert_eq!(store.loads.load(Ordering::SeqCst), 0);
}

#[test]
fn test_invalid_options() {
    let job = CubicJob {
        out_root: PathBuf::from("unused"),
        views: default_views(),
        options: RenderOptions {
            fov: 0.0,
            ..RenderOptions::default()
        },
    };
    assert!(job.validate().is_err());
    let mut stereo = stereo_job(Path::new("unused"), vec![1]);
    stereo.min_baseline = -1.0;
    assert!(stereo.validate().is_err());
}
