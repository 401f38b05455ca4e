use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::*;
use std::process::Command;
use tempfile::tempdir;

fn synthetic_dataset(dir: &Path, extra: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("pano2persp")?;
    cmd.arg("synthetic")
        .arg("--frames")
        .arg("6")
        .arg("--size")
        .arg("0.04")
        .arg("--width")
        .arg("64")
        .arg("--quiet")
        .args(extra)
        .arg(dir);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Trajectory with 6 poses"));
    Ok(())
}

#[test]
fn synthetic_dataset_files() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    synthetic_dataset(dir.path(), &["--mask-cap", "20", "--binary"])?;
    assert!(dir.path().join("images.bin").is_file());
    assert!(dir.path().join("images/frame_00005.png").is_file());
    assert!(dir.path().join("masks/frame_00005.png").is_file());
    Ok(())
}

#[test]
fn cubic_faces() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    let out = dir.path().join("faces");
    synthetic_dataset(&data, &[])?;

    let mut cmd = Command::cargo_bin("pano2persp")?;
    cmd.arg("cubic")
        .arg(data.join("images.txt"))
        .arg(&out)
        .arg("--image-path")
        .arg(data.join("images"))
        .arg("--views")
        .arg("0,4,9")
        .arg("--direction")
        .arg("down=0,-1,0.2")
        .arg("--quiet");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "Exported 18 views (6 skipped, 0 cancelled)",
        ));
    assert!(out.join("frame_00000/0.png").is_file());
    assert!(out.join("frame_00003/down.png").is_file());
    assert!(!out.join("frame_00000/9.png").exists());
    Ok(())
}

#[test]
fn stereo_pairs() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    let out = dir.path().join("pairs");
    synthetic_dataset(&data, &["--mask-cap", "30"])?;

    let mut cmd = Command::cargo_bin("pano2persp")?;
    cmd.arg("stereo")
        .arg(&data)
        .arg(&out)
        .arg("--image-path")
        .arg(data.join("images"))
        .arg("--mask-path")
        .arg(data.join("masks"))
        .arg("--intervals")
        .arg("1,2")
        .arg("--ring-angles")
        .arg("0,180")
        .arg("--image-size")
        .arg("16")
        .arg("--quiet");
    // k = 1 is 4cm, below the 5cm minimum; k = 2 yields four pairs
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            "Exported 16 views (20 skipped, 0 cancelled)",
        ));
    let ring = out.join("k2/frame_00000/ring_180");
    assert!(ring.join("frame_00000.png").is_file());
    assert!(ring.join("frame_00002.png").is_file());
    assert!(ring.join("frame_00002_mask.png").is_file());
    assert!(!out.join("k1").exists());
    assert!(out.join("pairs.txt").is_file());
    Ok(())
}

#[test]
fn stereo_invalid_intervals() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    let out = dir.path().join("pairs");
    synthetic_dataset(&data, &[])?;

    let mut cmd = Command::cargo_bin("pano2persp")?;
    cmd.arg("stereo")
        .arg(&data)
        .arg(&out)
        .arg("--image-path")
        .arg(data.join("images"))
        .arg("--intervals")
        .arg("0,-3")
        .arg("--quiet");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Exported 0 views"));
    assert!(!out.exists());
    Ok(())
}

#[test]
fn bad_up_vector() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    synthetic_dataset(&data, &[])?;

    let mut cmd = Command::cargo_bin("pano2persp")?;
    cmd.arg("cubic")
        .arg(&data)
        .arg(dir.path().join("faces"))
        .arg("--image-path")
        .arg(data.join("images"))
        .arg("--up")
        .arg("0,1");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("up vector needs 3 components"));
    Ok(())
}

#[test]
fn missing_image_directory() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let data = dir.path().join("data");
    synthetic_dataset(&data, &[])?;

    let mut cmd = Command::cargo_bin("pano2persp")?;
    cmd.arg("cubic")
        .arg(&data)
        .arg(dir.path().join("faces"))
        .arg("--image-path")
        .arg(dir.path().join("nowhere"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
    Ok(())
}
