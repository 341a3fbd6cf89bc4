use camera_calibration_capture::solver::homography_to_focal;
use camera_calibration_capture::*;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use glam::Vec2;
use image::{GrayImage, Luma};
use nalgebra as na;

fn bench_publish(c: &mut Criterion) {
    let buffer = ResultBuffer::new(1280, 720);
    let frame = GrayImage::from_pixel(1280, 720, Luma([128]));
    let corners = vec![Vec2::new(10.0, 20.0); 144];

    c.bench_function("result_buffer_publish_720p", |b| {
        b.iter(|| buffer.publish(true, black_box(&corners), black_box(&frame), 1))
    });
}

fn bench_homography_to_focal(c: &mut Criterion) {
    let f = 1000.0;
    let k = na::Matrix3::new(f, 0.0, 0.0, 0.0, f, 0.0, 0.0, 0.0, 1.0);
    let r = na::Rotation3::from_euler_angles(0.2, -0.3, 0.1).into_inner();
    let rt = na::Matrix3::from_columns(&[
        r.column(0).into_owned(),
        r.column(1).into_owned(),
        na::Vector3::new(0.1, -0.1, 1.5),
    ]);
    let h = k * rt;

    c.bench_function("homography_to_focal", |b| {
        b.iter(|| homography_to_focal(black_box(&h)))
    });
}

fn bench_solve(c: &mut Criterion) {
    let pattern = PatternSpec::default_for(PatternType::AprilGrid);
    let object = pattern.object_points();
    let sets: Vec<CapturedSet> = [(0.3, 0.2), (-0.2, 0.3), (0.25, -0.3), (-0.3, -0.2)]
        .iter()
        .map(|(rx, ry)| {
            let rot = na::Rotation3::from_euler_angles(*rx, *ry, 0.0);
            let t = na::Vector3::new(-0.4, 0.4, 1.5);
            let corners = object
                .iter()
                .map(|p| {
                    let pc = rot * na::Vector3::new(p.x as f64, p.y as f64, 0.0) + t;
                    Vec2::new(
                        (600.0 * pc.x / pc.z + 320.0) as f32,
                        (600.0 * pc.y / pc.z + 240.0) as f32,
                    )
                })
                .collect();
            CapturedSet { time_ns: 0, corners }
        })
        .collect();

    c.bench_function("homography_solver_4_views", |b| {
        b.iter(|| HomographySolver.solve(black_box(&sets), &pattern, (640, 480)))
    });
}

criterion_group!(benches, bench_publish, bench_homography_to_focal, bench_solve);
criterion_main!(benches);
