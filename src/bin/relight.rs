use clap::{Parser, Subcommand, ValueEnum};
use lightdome::{
    basis::{Basis, CoordinateSystem},
    calibration::file::CalibrationFile,
    direction::LatLong,
    prelude::*,
    render::RenderedImage,
    stack::light_id_from_stem,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};
use uom::si::{angle::degree, f64::Angle};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum BasisKind {
    Polynomial,
    SphericalHarmonics,
    Normal,
}

#[derive(Clone, Copy, ValueEnum)]
enum Coordinates {
    LatLong,
    ZenithVector,
    Xyz,
}

#[derive(Clone, Copy, ValueEnum)]
enum Layout {
    Rgb,
    Luma,
}

#[derive(Subcommand)]
enum Command {
    /// Fit a coefficient field to a directory of light frames.
    Fit {
        #[arg(long)]
        calibration: PathBuf,

        /// Directory of object frames named with a trailing light id.
        #[arg(long)]
        frames: PathBuf,

        /// Directory the coefficient images are written to.
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, value_enum, default_value_t = BasisKind::Polynomial)]
        basis: BasisKind,

        #[arg(long, default_value_t = 2)]
        degree: usize,

        #[arg(long, value_enum, default_value_t = Coordinates::LatLong)]
        coordinates: Coordinates,

        #[arg(long, value_enum, default_value_t = Layout::Rgb)]
        layout: Layout,

        #[arg(long)]
        grayscale: bool,

        #[arg(long, default_value_t = 64)]
        slice_rows: u32,

        /// Store the pseudoinverse in the calibration file for later fits.
        #[arg(long)]
        cache_inverse: bool,
    },

    /// Render a fitted coefficient field.
    Render {
        /// Directory written by `fit`.
        #[arg(long)]
        coefficients: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Light latitude in degrees.
        #[arg(long, default_value_t = 45.0)]
        latitude: f64,

        /// Light longitude in degrees.
        #[arg(long, default_value_t = 0.0)]
        longitude: f64,

        /// Equirectangular environment map to light the object with instead.
        #[arg(long)]
        hdri: Option<PathBuf>,

        /// Rotation of the environment about the vertical axis in degrees.
        #[arg(long, default_value_t = 0.0)]
        rotation: f64,

        #[arg(long, default_value_t = 16)]
        grid: usize,

        /// Write the normal map of a field fitted with the normal basis.
        #[arg(long)]
        normals: bool,
    },
}

fn main() {
    // Register an event subscriber that prints events to STDOUT.
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    match Args::parse().command {
        Command::Fit {
            calibration,
            frames,
            output,
            basis,
            degree,
            coordinates,
            layout,
            grayscale,
            slice_rows,
            cache_inverse,
        } => {
            let basis = match basis {
                BasisKind::Polynomial => Basis::Polynomial { degree },
                BasisKind::SphericalHarmonics => Basis::SphericalHarmonics { degree },
                BasisKind::Normal => Basis::Normal,
            };
            let coordinate_system = match coordinates {
                Coordinates::LatLong => CoordinateSystem::LatLong,
                Coordinates::ZenithVector => CoordinateSystem::ZenithVector,
                Coordinates::Xyz => CoordinateSystem::Xyz,
            };
            let layout = match layout {
                Layout::Rgb => PackingLayout::Rgb,
                Layout::Luma => PackingLayout::Luma,
            };

            let file = CalibrationFile::read(&calibration).expect("failed to read calibration");
            let lights = file.calibration().expect("invalid calibration");

            let mut fitter = Fitter::new(
                basis,
                coordinate_system,
                FitterConfig {
                    grayscale,
                    slice_rows,
                    ..Default::default()
                },
            )
            .expect("unsupported basis");

            let restored = match &file.fitter {
                Some(record) => fitter
                    .import_inverse(record, &lights)
                    .expect("corrupt pseudoinverse in calibration"),
                None => false,
            };
            if !restored {
                fitter
                    .compute_inverse(&lights, false)
                    .expect("failed to compute pseudoinverse");
            }

            let stack = read_stack(&frames);
            let (field, summary) = fitter
                .compute_coefficients(&stack, None)
                .expect("failed to fit coefficients");
            if summary.underdetermined {
                println!(
                    "warning: {} lights for {} coefficients",
                    summary.lights_used, summary.coefficient_count
                );
            }

            field
                .save(&output, layout)
                .expect("failed to write coefficients");

            if cache_inverse && !restored {
                let record = fitter.export_inverse().expect("no pseudoinverse");
                CalibrationFile::new(&lights, Some(record))
                    .write(&calibration)
                    .expect("failed to update calibration");
                info!(path = %calibration.display(), "stored pseudoinverse");
            }

            println!(
                "fitted {} coefficients from {} lights, written to {}",
                summary.coefficient_count,
                summary.lights_used,
                output.display()
            );
        }
        Command::Render {
            coefficients,
            output,
            latitude,
            longitude,
            hdri,
            rotation,
            grid,
            normals,
        } => {
            let field = CoefficientField::load(&coefficients).expect("failed to read coefficients");
            let reconstructor = Reconstructor::new(&field).expect("invalid coefficient metadata");

            if normals {
                let map = reconstructor.normal_map().expect("failed to extract normals");
                let degenerate = map.degenerate.iter().filter(|d| **d).count();
                if degenerate > 0 {
                    warn!(degenerate, "pixels without a reliable normal");
                }
                image::DynamicImage::ImageRgb32F(map.to_image())
                    .into_rgb8()
                    .save(&output)
                    .expect("failed to write normal map");
                return;
            }

            let rendered: RenderedImage = match hdri {
                Some(path) => {
                    let environment = EnvironmentMap::from_image(
                        &image::open(&path).expect("failed to read environment map"),
                    );
                    reconstructor.render_hdri(
                        &environment,
                        Angle::new::<degree>(rotation),
                        &HdriConfig { grid },
                    )
                }
                None => reconstructor.render_light(&LightDirection::from_lat_long(LatLong::new(
                    Angle::new::<degree>(latitude),
                    Angle::new::<degree>(longitude),
                ))),
            };

            let image = rendered.to_dynamic();
            let saved = match output.extension().and_then(|ext| ext.to_str()) {
                Some("exr") => image.save(&output),
                _ => image.into_rgb8().save(&output),
            };
            saved.expect("failed to write rendered image");
            println!("rendered {}", output.display());
        }
    }
}

fn read_stack(dir: &Path) -> ImageStack {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .expect("failed to list frame directory")
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut stack: Option<ImageStack> = None;
    for path in paths {
        let Some(id) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(light_id_from_stem)
        else {
            warn!(path = %path.display(), "skipping file without a light id");
            continue;
        };

        let image = image::open(&path).expect("failed to read frame");
        let stack = stack.get_or_insert_with(|| {
            let channels = match image.color().has_color() {
                true => 3,
                false => 1,
            };
            ImageStack::new(image.width(), image.height(), channels).expect("invalid channels")
        });
        stack
            .insert_image(id, &image)
            .expect("frame does not match the stack");
    }

    let stack = stack.expect("no frames found");
    info!(frames = stack.len(), "decoded light frames");
    stack
}
