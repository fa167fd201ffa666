use clap::Parser;
use lightdome::{
    calibration::{Calibration, file::CalibrationFile, solver::SolverConfig},
    prelude::*,
    raster,
    stack::light_id_from_stem,
};
use std::{fs, path::PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Photo of the mirror ball used to locate it.
    #[arg(long)]
    mask: PathBuf,

    /// Directory of light frames named with a trailing light id, e.g. `light_007.png`.
    #[arg(long)]
    frames: PathBuf,

    /// Path of the calibration file to write.
    #[arg(short, long)]
    output: PathBuf,

    /// JSON file with solver settings. Missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the half viewing angle of the config, in degrees.
    #[arg(long)]
    viewing_angle_half: Option<f64>,

    /// Calibrations from earlier sessions to merge with this one.
    #[arg(long)]
    merge: Vec<PathBuf>,
}

fn main() {
    // Register an event subscriber that prints events to STDOUT.
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let args = Args::parse();

    let mut config: SolverConfig = match &args.config {
        Some(path) => serde_json::from_str(
            &fs::read_to_string(path).expect("failed to read solver config"),
        )
        .expect("failed to parse solver config"),
        None => SolverConfig::default(),
    };
    if let Some(angle) = args.viewing_angle_half {
        config.viewing_angle_half_deg = angle;
    }

    let mask = raster::gray_frame(&image::open(&args.mask).expect("failed to read mask frame"));
    info!(path = %args.mask.display(), "decoded mask frame");

    let mut paths: Vec<PathBuf> = fs::read_dir(&args.frames)
        .expect("failed to list frame directory")
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(light_id_from_stem)
        else {
            warn!(path = %path.display(), "skipping file without a light id");
            continue;
        };

        match image::open(&path) {
            Ok(image) => frames.push((id, raster::gray_frame(&image))),
            Err(error) => warn!(path = %path.display(), %error, "skipping unreadable frame"),
        }
    }
    info!(frames = frames.len(), "decoded light frames");

    let report = CalibrationSolver::new(config)
        .solve(&mask, frames.iter().map(|(id, frame)| (*id, frame)))
        .expect("failed to calibrate");

    for rejection in &report.rejections {
        println!("light {}: rejected ({:?})", rejection.id, rejection.reason);
    }

    let mut calibration = report.calibration;
    if !args.merge.is_empty() {
        let mut sessions = vec![calibration];
        for path in &args.merge {
            let session = CalibrationFile::read(path)
                .and_then(|file| file.calibration())
                .expect("failed to read calibration to merge");
            sessions.push(session);
        }
        calibration = Calibration::merge(&sessions);
        info!(sessions = sessions.len(), lights = calibration.len(), "merged calibrations");
    }

    CalibrationFile::new(&calibration, None)
        .write(&args.output)
        .expect("failed to write calibration");

    println!(
        "calibrated {} lights ({} rejected), written to {}",
        calibration.len(),
        report.rejections.len(),
        args.output.display()
    );
}
