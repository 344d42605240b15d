//! Synthetic Chessboard Calibration
//!
//! Renders a chessboard through a known pinhole camera from a ring of poses,
//! feeds the corners to the calibration pipeline and compares the estimate
//! with the ground truth.
//!
//! Usage:
//! ```bash
//! cargo run --example calibrate_synthetic -- \
//!   -w 9 -H 6 -s 0.025 --views 8 --noise 0.2 --zt --op --oe \
//!   -o output/synthetic_camera.yml
//! ```

use clap::Parser;
use log::info;
use nalgebra::{Vector2, Vector3};
use pinhole_calib::camera::project_point;
use pinhole_calib::reprojection::point_statistics;
use pinhole_calib::{
    run_calibration, BoardSpec, CalibrationSettings, Detection, Distortion, FeatureExtractor,
    Intrinsics, Resolution, ViewPose,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Synthetic planar-target calibration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Inner corners per board row
    #[arg(short = 'w', long, default_value = "9")]
    board_width: u32,

    /// Inner corners per board column
    #[arg(short = 'H', long, default_value = "6")]
    board_height: u32,

    /// Side of one square in world units
    #[arg(short = 's', long, default_value = "0.025")]
    square_size: f64,

    /// Number of simulated views
    #[arg(short = 'n', long, default_value = "8")]
    views: usize,

    /// Amplitude of the corner jitter in pixels
    #[arg(long, default_value = "0.0")]
    noise: f64,

    /// Fix fx / fy to this ratio
    #[arg(short = 'a', long)]
    aspect_ratio: Option<f64>,

    /// Assume zero tangential distortion
    #[arg(long = "zt")]
    zero_tangent_dist: bool,

    /// Keep the principal point at the image centre
    #[arg(short = 'p', long)]
    fix_principal_point: bool,

    /// Write the per-view extrinsics
    #[arg(long = "oe")]
    write_extrinsics: bool,

    /// Write the detected corners
    #[arg(long = "op")]
    write_points: bool,

    /// Output record (.yml or .json)
    #[arg(short = 'o', long, default_value = "output/synthetic_camera.yml")]
    output: PathBuf,
}

/// Serves corners rendered from a known camera instead of detecting them.
struct RenderedBoard {
    intrinsics: Intrinsics,
    distortion: Distortion,
    resolution: Resolution,
    poses: HashMap<PathBuf, ViewPose>,
    noise: f64,
}

impl FeatureExtractor for RenderedBoard {
    type Error = String;

    fn detect(&mut self, path: &Path, board: &BoardSpec) -> Result<Option<Detection>, String> {
        let pose = self
            .poses
            .get(path)
            .ok_or_else(|| format!("no pose for {}", path.display()))?;
        let model = pinhole_calib::generate_model_points(board).map_err(|e| e.to_string())?;

        let mut image_points = Vec::with_capacity(model.len());
        for (i, p) in model.points().iter().enumerate() {
            let jitter = Vector2::new((i as f64 * 12.9898).sin(), (i as f64 * 78.233).cos());
            let uv =
                project_point(&self.intrinsics, &self.distortion, pose, p) + jitter * self.noise;
            let (w, h) = (self.resolution.width as f64, self.resolution.height as f64);
            if uv.x < 0.0 || uv.y < 0.0 || uv.x >= w || uv.y >= h {
                return Ok(None);
            }
            image_points.push(uv);
        }

        Ok(Some(Detection {
            image_points,
            resolution: self.resolution,
        }))
    }
}

/// Poses on a ring in front of the camera, each tilted towards the axis.
fn ring_poses(board: &BoardSpec, count: usize) -> Vec<ViewPose> {
    let half_w = (board.width - 1) as f64 * board.square_size / 2.0;
    let half_h = (board.height - 1) as f64 * board.square_size / 2.0;
    let distance = 12.0 * half_w.max(half_h);

    (0..count)
        .map(|i| {
            let phi = 2.0 * std::f64::consts::PI * i as f64 / count as f64;
            let tilt = 0.35;
            let rotation = Vector3::new(tilt * phi.sin(), -tilt * phi.cos(), 0.1 * phi.cos());
            let translation = Vector3::new(-half_w, -half_h, distance);
            ViewPose::new(rotation, translation)
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = CalibrationSettings::new(cli.board_width, cli.board_height, cli.square_size);
    settings.aspect_ratio = cli.aspect_ratio;
    settings.zero_tangent_dist = cli.zero_tangent_dist;
    settings.fix_principal_point = cli.fix_principal_point;
    settings.write_extrinsics = cli.write_extrinsics;
    settings.write_points = cli.write_points;
    settings.output = cli.output.clone();
    settings.validate()?;

    if let Some(parent) = cli.output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let truth = Intrinsics {
        fx: 820.0,
        fy: 815.0,
        cx: 635.0,
        cy: 362.0,
    };
    let distortion = if cli.zero_tangent_dist {
        Distortion::from_rad_tan(-0.12, 0.05, 0.0, 0.0, 0.0)
    } else {
        Distortion::from_rad_tan(-0.12, 0.05, 0.0008, -0.0005, 0.0)
    };

    let board = settings.board()?;
    let files: Vec<PathBuf> = (0..cli.views)
        .map(|i| PathBuf::from(format!("view_{i:02}.png")))
        .collect();
    let poses = files
        .iter()
        .cloned()
        .zip(ring_poses(&board, cli.views))
        .collect();

    let mut extractor = RenderedBoard {
        intrinsics: truth,
        distortion,
        resolution: Resolution::new(1280, 720),
        poses,
        noise: cli.noise,
    };

    println!("Synthetic Calibration");
    println!("=====================");
    info!(
        "Board {}x{} ({} units), {} views, noise {} px, flags: {}",
        board.width,
        board.height,
        board.square_size,
        cli.views,
        cli.noise,
        settings.flags().description()
    );

    let (result, summary) = run_calibration(&settings, &files, &mut extractor)?;
    println!(
        "Used {}/{} views ({} without corners)",
        summary.accepted.len(),
        summary.attempted(),
        summary.not_found.len()
    );

    let estimate = result.camera.intrinsics;
    println!("\n{:<4} {:>12} {:>12}", "", "truth", "estimate");
    for (name, t, e) in [
        ("fx", truth.fx, estimate.fx),
        ("fy", truth.fy, estimate.fy),
        ("cx", truth.cx, estimate.cx),
        ("cy", truth.cy, estimate.cy),
    ] {
        println!("{name:<4} {t:>12.4} {e:>12.4}");
    }
    println!("distortion: {:?}", result.camera.distortion.coefficients);

    println!("\nPer-view RMS (px):");
    for (path, error) in summary.accepted.iter().zip(result.per_view_errors.iter()) {
        println!("  {}: {error:.6}", path.display());
    }
    println!("Average reprojection error: {:.6}", result.aggregate_error);

    let model_points = pinhole_calib::generate_model_points(&board)?;
    if let Some(stats) = point_statistics(&result.observations, &model_points, &result.camera) {
        info!(
            "Corner errors: mean {:.6}, median {:.6}, max {:.6}, stddev {:.6}",
            stats.mean, stats.median, stats.max, stats.stddev
        );
    }

    println!("Record written to {}", settings.output.display());
    Ok(())
}
