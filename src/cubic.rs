//! Perspective views of a single panorama along fixed or caller supplied directions.

extern crate cgmath;
extern crate image;
extern crate rayon;

use cgmath::prelude::*;
use cgmath::Vector3;
use image::{GrayImage, RgbImage};
use log::debug;
use rayon::prelude::*;

use std::path::{Path, PathBuf};

use crate::camera::*;
use crate::erp::*;
use crate::Error;

/// The six canonical cube faces. Ids follow the usual cube map order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubeFace {
    PosX = 0,
    NegX = 1,
    PosY = 2,
    NegY = 3,
    PosZ = 4,
    NegZ = 5,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PosX,
        CubeFace::NegX,
        CubeFace::PosY,
        CubeFace::NegY,
        CubeFace::PosZ,
        CubeFace::NegZ,
    ];

    pub fn from_id(id: i64) -> Option<Self> {
        if id >= 0 && (id as usize) < CubeFace::ALL.len() {
            Some(CubeFace::ALL[id as usize])
        } else {
            None
        }
    }

    pub fn id(self) -> usize {
        self as usize
    }

    pub fn direction(self) -> Vector3<f64> {
        match self {
            CubeFace::PosX => Vector3::unit_x(),
            CubeFace::NegX => -Vector3::unit_x(),
            CubeFace::PosY => Vector3::unit_y(),
            CubeFace::NegY => -Vector3::unit_y(),
            CubeFace::PosZ => Vector3::unit_z(),
            CubeFace::NegZ => -Vector3::unit_z(),
        }
    }
}

/// A requested view: a cube face by id, or an explicit direction in the panorama frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewRequest {
    Face(i64),
    Direction {
        label: String,
        direction: Vector3<f64>,
    },
}

impl ViewRequest {
    /// Name of the output file (without extension).
    pub fn label(&self) -> String {
        match self {
            ViewRequest::Face(id) => id.to_string(),
            ViewRequest::Direction { label, .. } => label.clone(),
        }
    }

    /// View direction, `None` for unknown face ids or directions without length.
    pub fn resolve(&self) -> Option<Vector3<f64>> {
        match self {
            ViewRequest::Face(id) => CubeFace::from_id(*id).map(|f| f.direction()),
            ViewRequest::Direction { direction, .. } => {
                let len = direction.magnitude();
                if len.is_finite() && len > 1e-12 {
                    Some(direction / len)
                } else {
                    None
                }
            }
        }
    }
}

/// All six cube faces.
pub fn default_views() -> Vec<ViewRequest> {
    CubeFace::ALL
        .iter()
        .map(|f| ViewRequest::Face(f.id() as i64))
        .collect()
}

/// Resample `erp` through `camera`. Rows are rendered in parallel.
pub fn render_view(erp: &ErpImage, camera: &PerspectiveCamera) -> RgbImage {
    let (w, h) = (camera.width(), camera.height());
    let mut out = RgbImage::new(w, h);
    out.par_chunks_mut(w as usize * 3)
        .enumerate()
        .for_each(|(row, line)| {
            for (col, px) in line.chunks_mut(3).enumerate() {
                let c = erp.sample(camera.ray(col as u32, row as u32));
                for (dst, src) in px.iter_mut().zip(c.iter()) {
                    *dst = src.round().max(0.0).min(255.0) as u8;
                }
            }
        });
    out
}

/// Resample the mask of `erp` through `camera` into a hard 0/255 mask. `None` without a mask.
pub fn render_mask(erp: &ErpImage, camera: &PerspectiveCamera) -> Option<GrayImage> {
    erp.mask.as_ref()?;
    let (w, h) = (camera.width(), camera.height());
    let mut out = GrayImage::new(w, h);
    out.par_chunks_mut(w as usize)
        .enumerate()
        .for_each(|(row, line)| {
            for (col, px) in line.iter_mut().enumerate() {
                let m = erp
                    .sample_mask(camera.ray(col as u32, row as u32))
                    .unwrap_or(0.0);
                *px = m.round().max(0.0).min(255.0) as u8;
            }
        });
    binarize_mask(&mut out);
    Some(out)
}

/// Files written for one view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewOutput {
    pub image: PathBuf,
    pub mask: Option<PathBuf>,
}

/// Write an image, creating parent directories as needed.
pub fn save_image<P>(image: &image::ImageBuffer<P, Vec<u8>>, path: &Path) -> Result<(), Error>
where
    P: image::Pixel<Subpixel = u8> + image::PixelWithColorType,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path)?;
    debug!("wrote {}", path.display());
    Ok(())
}

/// Render `camera` from `erp` and write it as `<dir>/<name>.<ext>`, plus `<dir>/<name>_mask.png`
/// when the panorama carries a mask.
pub fn write_view(
    erp: &ErpImage,
    camera: &PerspectiveCamera,
    dir: &Path,
    name: &str,
    ext: &str,
) -> Result<ViewOutput, Error> {
    let image_path = dir.join(format!("{}.{}", name, ext));
    save_image(&render_view(erp, camera), &image_path)?;
    let mask = match render_mask(erp, camera) {
        Some(m) => {
            let mask_path = dir.join(format!("{}_mask.png", name));
            save_image(&m, &mask_path)?;
            Some(mask_path)
        }
        None => None,
    };
    Ok(ViewOutput {
        image: image_path,
        mask: mask,
    })
}

/// Export one requested view of a panorama into `dir`.
///
/// The output is square with `image_size` pixels (0 picks half the panorama height) and a
/// horizontal field of view of `fov` degrees. `up` is the up reference in the panorama frame.
pub fn export_view(
    erp: &ErpImage,
    request: &ViewRequest,
    image_size: u32,
    fov: f64,
    up: Vector3<f64>,
    dir: &Path,
    ext: &str,
) -> Result<ViewOutput, Error> {
    let direction = request.resolve().ok_or_else(|| {
        Error::Configuration(format!("unknown view {:?}", request))
    })?;
    let (w, h) = output_size(image_size, erp.height());
    let camera = PerspectiveCamera::new(fov, w, h, direction, up)?;
    write_view(erp, &camera, dir, &request.label(), ext)
}

#[cfg(test)]
fn average_color(image: &RgbImage) -> [f64; 3] {
    let n = (image.width() * image.height()) as f64;
    let mut sum = [0.0; 3];
    for p in image.pixels() {
        for k in 0..3 {
            sum[k] += p.0[k] as f64 / n;
        }
    }
    sum
}

#[test]
fn test_uniform_faces() {
    let erp = ErpImage::from_fn(PathBuf::from("uniform.png"), 64, 32, |_| [40, 120, 210]);
    let averages = default_views()
        .iter()
        .map(|v| {
            let camera =
                PerspectiveCamera::new(90.0, 16, 16, v.resolve().unwrap(), Vector3::unit_y())
                    .unwrap();
            average_color(&render_view(&erp, &camera))
        })
        .collect::<Vec<_>>();
    assert_eq!(averages.len(), 6);
    for a in averages.iter() {
        assert!((a[0] - 40.0).abs() < 1e-9);
        assert!((a[1] - 120.0).abs() < 1e-9);
        assert!((a[2] - 210.0).abs() < 1e-9);
    }
}

#[test]
fn test_faces_see_their_axis() {
    // colour each direction by its dominant axis
    let color = |d: Vector3<f64>| {
        let a = [d.x.abs(), d.y.abs(), d.z.abs()];
        let i = (0..3).max_by(|x, y| a[*x].partial_cmp(&a[*y]).unwrap()).unwrap();
        let positive = [d.x, d.y, d.z][i] > 0.0;
        let mut c = [0u8; 3];
        c[i] = if positive { 250 } else { 100 };
        c
    };
    let erp = ErpImage::from_fn(PathBuf::from("axes.png"), 512, 256, color);
    for face in CubeFace::ALL.iter() {
        let camera =
            PerspectiveCamera::new(60.0, 9, 9, face.direction(), Vector3::unit_y()).unwrap();
        let centre = render_view(&erp, &camera).get_pixel(4, 4).0;
        assert_eq!(centre, color(face.direction()), "face {:?}", face);
    }
}

#[test]
fn test_unknown_views() {
    assert_eq!(ViewRequest::Face(6).resolve(), None);
    assert_eq!(ViewRequest::Face(-1).resolve(), None);
    assert_eq!(
        ViewRequest::Direction {
            label: "none".to_string(),
            direction: Vector3::new(0.0, 0.0, 0.0)
        }
        .resolve(),
        None
    );
    assert_eq!(ViewRequest::Face(3).resolve(), Some(-Vector3::unit_y()));
    assert_eq!(ViewRequest::Face(3).label(), "3");
}

#[test]
fn test_export_view_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut erp = ErpImage::from_fn(PathBuf::from("p.png"), 64, 32, |d| {
        [(d.x.abs() * 255.0) as u8, 0, 0]
    });
    erp.mask = Some(GrayImage::from_pixel(64, 32, image::Luma([255])));
    let out = export_view(
        &erp,
        &ViewRequest::Face(4),
        0,
        45.0,
        Vector3::unit_y(),
        &dir.path().join("p"),
        "png",
    )
    .unwrap();
    assert_eq!(out.image, dir.path().join("p").join("4.png"));
    let written = image::open(&out.image).unwrap();
    assert_eq!((written.width(), written.height()), (16, 16));
    let mask = image::open(out.mask.unwrap()).unwrap().to_luma8();
    assert!(mask.pixels().all(|p| p.0[0] == 255));

    assert!(export_view(
        &erp,
        &ViewRequest::Face(9),
        0,
        45.0,
        Vector3::unit_y(),
        dir.path(),
        "png"
    )
    .is_err());
}

#[test]
fn test_views_keep_left_and_right() {
    // red just after the forward column, blue just before it
    let pixels = RgbImage::from_fn(64, 32, |x, _| {
        if x < 8 {
            image::Rgb([255, 0, 0])
        } else if x >= 56 {
            image::Rgb([0, 0, 255])
        } else {
            image::Rgb([0, 0, 0])
        }
    });
    let erp = ErpImage::new(PathBuf::from("sides.png"), pixels, None).unwrap();
    let camera =
        PerspectiveCamera::new(60.0, 32, 32, Vector3::unit_z(), Vector3::unit_y()).unwrap();
    let view = render_view(&erp, &camera);
    assert_eq!(view.get_pixel(31, 16).0, [255, 0, 0]);
    assert_eq!(view.get_pixel(0, 16).0, [0, 0, 255]);
}
