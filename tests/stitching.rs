// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

use libstitcher::opencv::core::{self, CV_8UC1, KeyPoint, Mat, Point2d, Rect, Scalar, Vector};
use libstitcher::opencv::prelude::*;
use libstitcher::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const WIDTH: i32 = 200;
const HEIGHT: i32 = 150;

struct WorldPoint {
    x: f32,
    y: f32,
    descriptor: [u8; 32],
}

/// Pretends to detect features in a strip of a flat world: image `i` sees the
/// world window starting at `i * step` and is filled with the grey value
/// `10 * (i + 1)`, which is how the detector tells the images apart.
struct SyntheticDetector {
    points: Vec<WorldPoint>,
    step: f32,
    images: usize,
}

impl SyntheticDetector {
    fn new(images: usize, step: i32, points: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let world_width = (step * (images as i32 - 1) + WIDTH) as f32;
        let points = (0..points)
            .map(|_| WorldPoint {
                x: rng.gen_range(0.0..world_width),
                y: rng.gen_range(0.0..HEIGHT as f32),
                descriptor: rng.r#gen(),
            })
            .collect();
        Self {
            points,
            step: step as f32,
            images,
        }
    }

    fn images(&self) -> Vec<Mat> {
        (0..self.images)
            .map(|i| {
                let value = Scalar::all(10.0 * (i + 1) as f64);
                Mat::new_rows_cols_with_default(HEIGHT, WIDTH, CV_8UC1, value).unwrap()
            })
            .collect()
    }
}

impl FeatureDetector for SyntheticDetector {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn detect(&self, grey: &Mat) -> Result<Vector<KeyPoint>, StitcherError> {
        let index = (*grey.at_2d::<u8>(0, 0)? / 10) as usize - 1;
        // the pipeline may hand us a scaled-down image
        let sx = grey.cols() as f32 / WIDTH as f32;
        let sy = grey.rows() as f32 / HEIGHT as f32;
        let x0 = index as f32 * self.step;
        let mut keypoints = Vector::<KeyPoint>::new();
        for (id, p) in self.points.iter().enumerate() {
            if p.x >= x0 && p.x < x0 + WIDTH as f32 {
                let (x, y) = ((p.x - x0) * sx, p.y * sy);
                keypoints.push(KeyPoint::new_coords(x, y, 7.0, -1.0, 1.0, 0, id as i32)?);
            }
        }
        Ok(keypoints)
    }

    fn extract(&self, _grey: &Mat, keypoints: &mut Vector<KeyPoint>) -> Result<Mat, StitcherError> {
        let rows: Vec<[u8; 32]> = keypoints
            .iter()
            .map(|kp| self.points[kp.class_id() as usize].descriptor)
            .collect();
        Ok(Mat::from_slice_2d(&rows)?)
    }
}

#[test]
fn translation_chain_is_recovered() {
    let detector = SyntheticDetector::new(3, 120, 900, 11);
    let images = detector.images();
    let panorama = stitch_images_with(&images, &detector, &StitchParameters::default()).unwrap();

    assert_eq!(panorama.transforms.len(), 3);
    assert_eq!(panorama.stats.len(), 2);
    assert_eq!(panorama.anchor, 1);
    for pair in panorama.stats.pairs() {
        assert!(pair.inlier_count.unwrap() >= 50, "{pair:?}");
    }
    for (i, t) in panorama.transforms.iter().enumerate() {
        let (tx, ty) = t.translation_components();
        let expected = 120.0 * (i as f64 - 1.0);
        assert!((tx - expected).abs() <= 1.0, "image {i}: {t}");
        assert!(ty.abs() <= 1.0, "image {i}: {t}");
    }
    assert!(panorama.transforms[1].is_identity(1e-9));

    assert_eq!((panorama.canvas.width, panorama.canvas.height), (440, 150));
    assert_eq!(panorama.image.typ(), CV_8UC1);
    // image 0 alone, image 1 over image 0, image 2 over image 1
    assert_eq!(*panorama.image.at_2d::<u8>(75, 50).unwrap(), 10);
    assert_eq!(*panorama.image.at_2d::<u8>(75, 150).unwrap(), 20);
    assert_eq!(*panorama.image.at_2d::<u8>(75, 300).unwrap(), 30);
}

#[test]
fn translation_chain_is_recovered_from_scaled_features() {
    let detector = SyntheticDetector::new(3, 120, 900, 12);
    let images = detector.images();
    let params = StitchParameters {
        feature_scale_width: Some(100.0),
        ..Default::default()
    };
    let panorama = stitch_images_with(&images, &detector, &params).unwrap();
    for (i, t) in panorama.transforms.iter().enumerate() {
        let (tx, ty) = t.translation_components();
        assert!((tx - 120.0 * (i as f64 - 1.0)).abs() <= 1.0, "image {i}: {t}");
        assert!(ty.abs() <= 1.0, "image {i}: {t}");
    }
}

#[test]
fn direct_estimation_recovers_translation() {
    let detector = SyntheticDetector::new(3, 100, 900, 13);
    let images = detector.images();
    let params = StitchParameters {
        method: EstimationMethod::Direct,
        ..Default::default()
    };
    let panorama = stitch_images_with(&images, &detector, &params).unwrap();
    for pair in panorama.stats.pairs() {
        assert_eq!(pair.model, Some(ModelKind::Affine));
        assert_eq!(pair.inlier_count, Some(pair.match_count));
        assert!(pair.transform.approx_eq(&Transform::translation(100.0, 0.0), 1e-6));
    }
}

#[test]
fn images_without_correspondences_overlap_in_place() {
    // no overlap between the windows, so no shared points
    let detector = SyntheticDetector::new(2, WIDTH, 400, 14);
    let images = detector.images();
    let panorama = stitch_images_with(&images, &detector, &StitchParameters::default()).unwrap();

    assert_eq!(panorama.stats.len(), 1);
    let pair = &panorama.stats.pairs()[0];
    assert_eq!(pair.match_count, 0);
    assert_eq!(pair.inlier_count, None);
    assert!(pair.transform.is_identity(0.0));
    assert!(panorama.transforms[0].approx_eq(&panorama.transforms[1], 1e-12));

    assert_eq!((panorama.canvas.width, panorama.canvas.height), (WIDTH, HEIGHT));
    // the second image wins everywhere
    for (y, x) in [(0, 0), (75, 100), (149, 199)] {
        assert_eq!(*panorama.image.at_2d::<u8>(y, x).unwrap(), 20);
    }
}

#[test]
fn one_stats_entry_per_pair_and_bounded_canvas() {
    let detector = SyntheticDetector::new(5, 90, 1500, 15);
    let images = detector.images();
    let panorama = stitch_images_with(&images, &detector, &StitchParameters::default()).unwrap();
    assert_eq!(panorama.transforms.len(), 5);
    assert_eq!(panorama.stats.len(), 4);
    assert!(panorama.stats.total_matches() > 0);
    // 4 * 90 + 200 = 560 is within the 3 x 200 guard band
    assert!(panorama.canvas.width >= 1 && panorama.canvas.width <= 3 * WIDTH);
    assert!(panorama.canvas.height >= 1 && panorama.canvas.height <= 3 * HEIGHT);
    assert_eq!(panorama.anchor, 2);
}

#[test]
fn long_chain_is_clamped_to_the_guard_band() {
    let detector = SyntheticDetector::new(8, 150, 3000, 16);
    let images = detector.images();
    let panorama = stitch_images_with(&images, &detector, &StitchParameters::default()).unwrap();
    assert_eq!(panorama.stats.len(), 7);
    assert_eq!(panorama.canvas.width, 3 * WIDTH);
    assert!(panorama.canvas.height <= 3 * HEIGHT);
    assert_eq!(panorama.image.cols(), 3 * WIDTH);
}

#[test]
fn orb_on_textured_crops_produces_a_panorama() {
    let mut texture = Mat::new_rows_cols_with_default(240, 420, CV_8UC1, Scalar::all(0.0)).unwrap();
    core::randu(&mut texture, &Scalar::all(0.0), &Scalar::all(255.0)).unwrap();
    let mut blurred = Mat::default();
    libstitcher::opencv::imgproc::gaussian_blur_def(
        &texture,
        &mut blurred,
        core::Size::new(5, 5),
        1.5,
    )
    .unwrap();
    let images: Vec<Mat> = [0, 110, 220]
        .iter()
        .map(|x| Mat::roi(&blurred, Rect::new(*x, 0, 200, 240)).unwrap().try_clone().unwrap())
        .collect();

    let panorama = stitch_images(&images, &StitchParameters::default()).unwrap();
    assert_eq!(panorama.stats.len(), 2);
    assert_eq!(panorama.transforms.len(), 3);
    assert_eq!(panorama.image.typ(), CV_8UC1);
    assert!(panorama.canvas.width >= 1 && panorama.canvas.width <= 600);
    assert!(panorama.canvas.height >= 1 && panorama.canvas.height <= 720);
}

#[test]
fn stitched_run_is_described_by_metadata() {
    let detector = SyntheticDetector::new(3, 120, 900, 17);
    let images = detector.images();
    let params = StitchParameters::default();
    let panorama = stitch_images_with(&images, &detector, &params).unwrap();
    let files = ["a.png", "b.png", "c.png"];
    let meta = StitchMetadata::new(&files, detector.name(), &params, &panorama);
    assert_eq!(meta.pairs.len(), 2);
    assert_eq!(meta.anchor, 1);
    let json = meta.to_json().unwrap();
    assert!(json.contains("\"detector\": \"synthetic\""));
    assert_eq!(StitchMetadata::from_json(&json).unwrap(), meta);
}

#[test]
fn point_level_fallback_is_visible_to_callers() {
    let src = [Point2d::new(0.0, 0.0), Point2d::new(30.0, 0.0), Point2d::new(0.0, 20.0)];
    let dst: Vec<Point2d> = src
        .iter()
        .map(|p| Point2d::new(p.x * 1.1 + 3.0, p.y * 0.9 - 1.0))
        .collect();
    let params = RansacParameters::default();
    let strict = estimate_robust(&src, &dst, ModelKind::Projective, &params).unwrap();
    assert!(strict.transform.is_none());
    let est = estimate_robust_with_fallback(&src, &dst, ModelKind::Projective, &params).unwrap();
    assert_eq!(est.model, Some(ModelKind::Affine));
    let t = est.transform.unwrap();
    assert!(t.approx_eq(&Transform::affine([1.1, 0.0, 3.0, 0.0, 0.9, -1.0]), 1e-9));
}
