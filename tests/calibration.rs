use approx::assert_abs_diff_eq;
use image::Luma;
use lightdome::{
    calibration::solver::RejectionReason,
    prelude::*,
};
use nalgebra::Vector2;
use rstest::rstest;

const WIDTH: u32 = 1920;
const HEIGHT: u32 = 1080;
const CENTER: (f64, f64) = (960.0, 540.0);
const RADIUS: f64 = 200.0;

fn disk(center: (f64, f64), radius: f64) -> GrayFrame {
    GrayFrame::from_fn(WIDTH, HEIGHT, |x, y| {
        let (dx, dy) = (x as f64 - center.0, y as f64 - center.1);
        match dx * dx + dy * dy <= radius * radius {
            true => Luma([1.0]),
            false => Luma([0.0]),
        }
    })
}

fn reflection(offset: (f64, f64)) -> GrayFrame {
    disk((CENTER.0 + offset.0, CENTER.1 + offset.1), 6.0)
}

#[test]
fn locates_mirror_ball() {
    let sphere = CalibrationSolver::default()
        .locate_sphere(&disk(CENTER, RADIUS))
        .unwrap();

    assert_abs_diff_eq!(sphere.center().x, CENTER.0, epsilon = 1.0);
    assert_abs_diff_eq!(sphere.center().y, CENTER.1, epsilon = 1.0);
    assert_abs_diff_eq!(sphere.radius(), RADIUS, epsilon = 2.0);
}

#[test]
fn reflection_offset_gives_uv() {
    let mask = disk(CENTER, RADIUS);
    let frame = reflection((100.0, -50.0));
    let report = CalibrationSolver::default()
        .solve(&mask, [(3, &frame)])
        .unwrap();

    assert_eq!(report.accepted(), 1);
    let light = report.calibration.get(3).unwrap();
    let uv = light.uv().unwrap();
    assert_abs_diff_eq!(uv, Vector2::new(0.5, 0.25), epsilon = 0.01);
    assert!(light.direction().y() >= 0.0);
    assert!(light.direction().x() > 0.0);
}

#[rstest]
#[case((0.0, 0.0), [0.0, 0.0, -1.0])]
#[case((0.0, -141.42), [0.0, 1.0, 0.0])]
#[case((-141.42, 0.0), [-1.0, 0.0, 0.0])]
fn reflections_map_to_directions(#[case] offset: (f64, f64), #[case] expected: [f64; 3]) {
    let mask = disk(CENTER, RADIUS);
    let frame = reflection(offset);
    let report = CalibrationSolver::default()
        .solve(&mask, [(0, &frame)])
        .unwrap();

    let direction = report.calibration.get(0).unwrap().direction();
    for (component, expected) in direction.xyz().iter().zip(expected) {
        assert_abs_diff_eq!(*component, expected, epsilon = 0.03);
    }
}

#[test]
fn black_frames_give_empty_calibration() {
    let mask = disk(CENTER, RADIUS);
    let black = GrayFrame::new(WIDTH, HEIGHT);
    let report = CalibrationSolver::default()
        .solve(&mask, (0..4).map(|id| (id, &black)))
        .unwrap();

    assert!(report.calibration.is_empty());
    assert_eq!(report.rejected(), 4);
    assert!(
        report
            .rejections
            .iter()
            .all(|rejection| matches!(rejection.reason, RejectionReason::BlackFrame { .. }))
    );
}

#[test]
fn rejected_and_accepted_frames_are_reported() {
    let mask = disk(CENTER, RADIUS);
    let black = GrayFrame::new(WIDTH, HEIGHT);
    let lit = reflection((40.0, 30.0));
    let report = CalibrationSolver::default()
        .solve(&mask, [(1, &black), (2, &lit), (3, &black)])
        .unwrap();

    assert_eq!(report.calibration.ids().collect::<Vec<_>>(), vec![2]);
    assert_eq!(
        report.rejections.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![1, 3]
    );
}

#[test]
fn frame_size_must_match_mask() {
    let mask = disk(CENTER, RADIUS);
    let small = GrayFrame::new(640, 480);
    assert!(matches!(
        CalibrationSolver::default().solve(&mask, [(0, &small)]),
        Err(Error::DimensionMismatch { width: 640, .. })
    ));
}

#[test]
fn solving_is_deterministic() {
    let mask = disk(CENTER, RADIUS);
    let frames: Vec<(u32, GrayFrame)> = [(10.0, -20.0), (-80.0, 60.0), (150.0, 5.0)]
        .into_iter()
        .enumerate()
        .map(|(id, offset)| (id as u32, reflection(offset)))
        .collect();

    let solver = CalibrationSolver::default();
    let first = solver
        .solve(&mask, frames.iter().map(|(id, frame)| (*id, frame)))
        .unwrap();
    let second = solver
        .solve(&mask, frames.iter().map(|(id, frame)| (*id, frame)))
        .unwrap();

    assert_eq!(first.sphere, second.sphere);
    assert_eq!(first.calibration, second.calibration);
    assert_eq!(first.calibration.fingerprint(), second.calibration.fingerprint());
}
