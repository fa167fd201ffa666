use lightdome::{calibration::file::CalibrationFile, prelude::*};
use nalgebra::Vector2;
use rstest::rstest;
use std::fs;
use uom::si::{angle::radian, f64::Angle};

fn calibration() -> Calibration {
    let zero = Angle::new::<radian>(0.0);
    let mut calibration = Calibration::new();
    for (id, uv) in [(0.0, 0.0), (0.4, 0.3), (-0.4, 0.3), (0.3, -0.4), (-0.3, -0.4), (0.0, 0.6)]
        .into_iter()
        .enumerate()
    {
        let uv = Vector2::new(uv.0, uv.1);
        calibration.add_light(
            id as u32,
            LightDirection::from_mirror_reflection(uv, zero),
            Some(uv),
        );
    }
    calibration
}

fn fitted(channels: usize, basis: Basis) -> CoefficientField {
    let calibration = calibration();
    let mut stack = ImageStack::new(4, 3, channels).unwrap();
    for (id, light) in calibration.iter() {
        let pixels = (0..4 * 3 * channels)
            .map(|i| i as f32 * 0.1 + light.direction().y() as f32)
            .collect();
        stack.insert(id, pixels, ColorDomain::Linear).unwrap();
    }

    let mut fitter =
        Fitter::new(basis, CoordinateSystem::LatLong, FitterConfig::default()).unwrap();
    fitter.compute_inverse(&calibration, false).unwrap();
    fitter.compute_coefficients(&stack, None).unwrap().0
}

#[rstest]
#[case(3, PackingLayout::Rgb, 6)]
#[case(3, PackingLayout::Luma, 18)]
#[case(1, PackingLayout::Rgb, 2)]
#[case(1, PackingLayout::Luma, 6)]
fn coefficients_survive_disk(
    #[case] channels: usize,
    #[case] layout: PackingLayout,
    #[case] images: usize,
) {
    let field = fitted(channels, Basis::Polynomial { degree: 2 });
    let dir = tempfile::tempdir().unwrap();
    field.save(dir.path(), layout).unwrap();

    let written = fs::read_dir(dir.path())
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .is_ok_and(|entry| entry.path().extension().is_some_and(|ext| ext == "exr"))
        })
        .count();
    assert_eq!(written, images);

    let loaded = CoefficientField::load(dir.path()).unwrap();
    assert_eq!(loaded, field);
}

#[test]
fn missing_coefficient_image_is_fatal() {
    let field = fitted(3, Basis::Polynomial { degree: 3 });
    let dir = tempfile::tempdir().unwrap();
    field.save(dir.path(), PackingLayout::Rgb).unwrap();
    fs::remove_file(dir.path().join("coefficients_011.exr")).unwrap();

    assert!(matches!(
        CoefficientField::load(dir.path()),
        Err(Error::DataMismatch {
            expected: 12,
            found: 11
        })
    ));
}

#[test]
fn smaller_field_replaces_larger_one() {
    let dir = tempfile::tempdir().unwrap();
    fitted(3, Basis::Polynomial { degree: 4 })
        .save(dir.path(), PackingLayout::Rgb)
        .unwrap();

    let field = fitted(3, Basis::Polynomial { degree: 2 });
    field.save(dir.path(), PackingLayout::Rgb).unwrap();
    assert!(!dir.path().join("coefficients_006.exr").exists());
    assert_eq!(CoefficientField::load(dir.path()).unwrap(), field);
}

#[test]
fn unread_extra_images_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let field = fitted(1, Basis::Polynomial { degree: 2 });
    field.save(dir.path(), PackingLayout::Rgb).unwrap();
    fs::copy(
        dir.path().join("coefficients_000.exr"),
        dir.path().join("coefficients_002.exr"),
    )
    .unwrap();

    assert_eq!(CoefficientField::load(dir.path()).unwrap(), field);
}

#[test]
fn count_contradicting_basis_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    fitted(1, Basis::Polynomial { degree: 2 })
        .save(dir.path(), PackingLayout::Luma)
        .unwrap();

    let path = dir.path().join("metadata.json");
    let mut metadata: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    metadata["coefficient_count"] = 3.into();
    fs::write(&path, metadata.to_string()).unwrap();
    for index in 3..6 {
        fs::remove_file(dir.path().join(format!("coefficients_{index:03}.exr"))).unwrap();
    }

    assert!(matches!(
        CoefficientField::load(dir.path()),
        Err(Error::DataMismatch {
            expected: 6,
            found: 3
        })
    ));
}

#[test]
fn loaded_field_renders_like_original() {
    let field = fitted(1, Basis::SphericalHarmonics { degree: 1 });
    let dir = tempfile::tempdir().unwrap();
    field.save(dir.path(), PackingLayout::Luma).unwrap();
    let loaded = CoefficientField::load(dir.path()).unwrap();

    let light = LightDirection::try_from([0.2, 0.4, -0.9]).unwrap();
    assert_eq!(
        Reconstructor::new(&loaded).unwrap().render_light(&light),
        Reconstructor::new(&field).unwrap().render_light(&light)
    );
}

#[test]
fn calibration_file_carries_pseudoinverse() {
    let calibration = calibration();
    let mut fitter = Fitter::new(
        Basis::Polynomial { degree: 2 },
        CoordinateSystem::ZenithVector,
        FitterConfig::default(),
    )
    .unwrap();
    fitter.compute_inverse(&calibration, false).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    CalibrationFile::new(&calibration, Some(fitter.export_inverse().unwrap()))
        .write(&path)
        .unwrap();

    let file = CalibrationFile::read(&path).unwrap();
    let restored = file.calibration().unwrap();
    assert_eq!(restored.ids().collect::<Vec<_>>(), calibration.ids().collect::<Vec<_>>());
    assert_eq!(restored.get(1).unwrap().uv(), Some(Vector2::new(0.4, 0.3)));

    let mut session = Fitter::new(
        Basis::Polynomial { degree: 2 },
        CoordinateSystem::ZenithVector,
        FitterConfig::default(),
    )
    .unwrap();
    let record = file.fitter.as_ref().unwrap();
    assert!(session.import_inverse(record, &restored).unwrap());
    assert_eq!(
        session.inverse().unwrap().light_ids(),
        fitter.inverse().unwrap().light_ids()
    );

    // A different basis cannot use the stored matrix.
    let mut other = Fitter::new(
        Basis::Polynomial { degree: 3 },
        CoordinateSystem::ZenithVector,
        FitterConfig::default(),
    )
    .unwrap();
    assert!(!other.import_inverse(record, &restored).unwrap());
}

/// Lights with arbitrary, unnormalized directions.
fn scattered(seed: u32, count: u32) -> Calibration {
    (0..count)
        .map(|id| {
            let t = (seed * 97 + id) as f64;
            let xyz = [
                1.7 * (0.37 * t).sin(),
                0.6 * (0.91 * t).cos() + 0.1,
                -1.3 - (0.13 * t).sin(),
            ];
            (id, LightDirection::try_from(xyz).unwrap())
        })
        .collect()
}

#[rstest]
fn stored_pseudoinverse_survives_json(#[values(1, 2, 3, 4, 5, 6, 7, 8)] seed: u32) {
    let calibration = scattered(seed, 30);
    let mut fitter = Fitter::new(
        Basis::Polynomial { degree: 2 },
        CoordinateSystem::LatLong,
        FitterConfig::default(),
    )
    .unwrap();
    fitter.compute_inverse(&calibration, false).unwrap();

    let json = CalibrationFile::new(&calibration, Some(fitter.export_inverse().unwrap()))
        .to_json()
        .unwrap();
    let file = CalibrationFile::from_json(&json).unwrap();
    let restored = file.calibration().unwrap();
    assert_eq!(restored, calibration);
    assert_eq!(restored.fingerprint(), calibration.fingerprint());

    let mut session = Fitter::new(
        Basis::Polynomial { degree: 2 },
        CoordinateSystem::LatLong,
        FitterConfig::default(),
    )
    .unwrap();
    assert!(session.import_inverse(file.fitter.as_ref().unwrap(), &restored).unwrap());
    assert_eq!(
        session.inverse().unwrap().inverse(),
        fitter.inverse().unwrap().inverse()
    );
}

#[test]
fn calibration_file_without_fitter_record() {
    let json = r#"{
        "version": 1,
        "lights": [
            { "id": 4, "xyz": [0.0, 0.0, -1.0] },
            { "id": 9, "uv": [0.1, 0.2], "xyz": [0.2, 0.4, -0.9] }
        ]
    }"#;
    let file = CalibrationFile::from_json(json).unwrap();
    let calibration = file.calibration().unwrap();

    assert!(file.fitter.is_none());
    assert_eq!(calibration.id_bounds(), Some((4, 9)));
    assert_eq!(calibration.get(4).unwrap().uv(), None);
    assert_eq!(calibration.get(9).unwrap().uv(), Some(Vector2::new(0.1, 0.2)));
}
