// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! Putative correspondences between two descriptor sets.

use super::{MatchParameters, StitcherError};
use opencv::core::{self, Mat};
use opencv::features2d;
use opencv::prelude::*;
use ordered_float::OrderedFloat;
use std::collections::HashMap;

/// A match between descriptor row `a` of the first set and row `b` of the second.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Correspondence {
    pub a: usize,
    pub b: usize,
    pub distance: f32,
}

/// Hamming for binary descriptors, L2 for everything else.
fn norm_for(descriptors: &Mat) -> i32 {
    if descriptors.depth() == core::CV_8U {
        core::NORM_HAMMING
    } else {
        core::NORM_L2
    }
}

/// Matches every descriptor of `descriptors_a` against `descriptors_b`.
///
/// A candidate survives when
/// 1. its best distance does not exceed `ratio` times the second best (Lowe's ratio test),
/// 2. its best distance does not exceed `max_distance`, and
/// 3. no other descriptor of `a` picked the same descriptor of `b`.
///
/// Finding no matches is a valid result. The output is ordered by index into
/// `descriptors_a` and only depends on the inputs and `params`.
pub fn match_descriptors(
    descriptors_a: &Mat,
    descriptors_b: &Mat,
    params: &MatchParameters,
) -> Result<Vec<Correspondence>, StitcherError> {
    if descriptors_a.empty() || descriptors_b.empty() {
        return Ok(Vec::new());
    }
    if descriptors_a.typ() != descriptors_b.typ() || descriptors_a.cols() != descriptors_b.cols() {
        return Err(StitcherError::InvalidParams(
            "Descriptor sets have different layouts".to_string(),
        ));
    }

    // cross check off, knn_match does its own filtering
    let mut matcher = features2d::BFMatcher::create(norm_for(descriptors_a), false)?;
    matcher.add(descriptors_b)?;
    let mut knn_matches = core::Vector::<core::Vector<core::DMatch>>::new();
    matcher.knn_match(
        descriptors_a,   // query descriptors
        &mut knn_matches, // output matches
        2,               // k (2 best matches per descriptor)
        &Mat::default(), // mask (no filtering here)
        false,           // compact_result
    )?;

    let mut filtered_matches = Vec::with_capacity(knn_matches.len());
    for m in knn_matches.iter() {
        let best = match m.len() {
            0 => continue,
            1 => m.get(0)?,
            _ => {
                let (best, second) = (m.get(0)?, m.get(1)?);
                if best.distance > params.ratio * second.distance {
                    continue;
                }
                best
            }
        };
        if params.max_distance.is_some_and(|d| best.distance > d) {
            continue;
        }
        filtered_matches.push(Correspondence {
            a: best.query_idx as usize,
            b: best.train_idx as usize,
            distance: best.distance,
        });
    }

    // uniqueness: drop every match whose `b` was claimed more than once
    let mut claims: HashMap<usize, usize> = HashMap::with_capacity(filtered_matches.len());
    for m in filtered_matches.iter() {
        *claims.entry(m.b).or_default() += 1;
    }
    filtered_matches.retain(|m| claims.get(&m.b) == Some(&1));

    if params.keep_ratio < 1.0 {
        filtered_matches.sort_by_key(|m| (OrderedFloat(m.distance), m.a));
        let num_to_keep = (filtered_matches.len() as f32 * params.keep_ratio).round() as usize;
        filtered_matches.truncate(num_to_keep);
    }
    filtered_matches.sort_by_key(|m| m.a);

    log::trace!(
        "{} of {} descriptors matched",
        filtered_matches.len(),
        descriptors_a.rows()
    );
    Ok(filtered_matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_descriptors(n: usize, seed: u64) -> Vec<[u8; 32]> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.r#gen::<[u8; 32]>()).collect()
    }

    fn to_mat(rows: &[[u8; 32]]) -> Mat {
        Mat::from_slice_2d(rows).unwrap()
    }

    #[test]
    fn identical_descriptors_match_one_to_one() {
        let a = random_descriptors(40, 1);
        let mut b = a.clone();
        b.reverse();
        let params = MatchParameters::default();
        let matches = match_descriptors(&to_mat(&a), &to_mat(&b), &params).unwrap();
        assert_eq!(matches.len(), 40);
        for m in matches {
            assert_eq!(m.b, 39 - m.a);
            assert_eq!(m.distance, 0.0);
        }
    }

    #[test]
    fn unrelated_descriptors_do_not_match() {
        let a = random_descriptors(30, 2);
        let b = random_descriptors(30, 3);
        let params = MatchParameters::default();
        let matches = match_descriptors(&to_mat(&a), &to_mat(&b), &params).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn ambiguous_matches_are_dropped() {
        let base = random_descriptors(3, 4);
        // two copies of base[0] in `a` compete for the same row of `b`
        let a = vec![base[0], base[0], base[1]];
        let b = vec![base[0], base[1], base[2]];
        let params = MatchParameters::default();
        let matches = match_descriptors(&to_mat(&a), &to_mat(&b), &params).unwrap();
        assert_eq!(
            matches,
            vec![Correspondence {
                a: 2,
                b: 1,
                distance: 0.0
            }]
        );
    }

    #[test]
    fn ratio_test_rejects_ambiguous_neighbours() {
        let base = random_descriptors(2, 5);
        let mut near_1 = base[0];
        near_1[0] ^= 0b1;
        let mut near_2 = base[0];
        near_2[1] ^= 0b1;
        let a = to_mat(&[base[0]]);
        let params = MatchParameters::default();

        // a single close neighbour passes: 1 < 0.7 * ~128
        let b = to_mat(&[near_1, base[1]]);
        assert_eq!(match_descriptors(&a, &b, &params).unwrap().len(), 1);

        // two equally close neighbours do not: 1 > 0.7 * 1
        let b = to_mat(&[near_1, near_2, base[1]]);
        assert!(match_descriptors(&a, &b, &params).unwrap().is_empty());
    }

    #[test]
    fn ratio_exactly_at_the_threshold_passes() {
        let a = random_descriptors(1, 9);
        let mut near = a[0];
        near[0] ^= 0x0f;
        let mut far = a[0];
        far[1] = !far[1];
        let b = to_mat(&[near, far]);
        // distances 4 and 8
        let mut params = MatchParameters {
            ratio: 0.5,
            ..Default::default()
        };
        let matches = match_descriptors(&to_mat(&a), &b, &params).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!((matches[0].b, matches[0].distance), (0, 4.0));

        params.ratio = 0.45;
        assert!(match_descriptors(&to_mat(&a), &b, &params).unwrap().is_empty());
    }

    #[test]
    fn distance_threshold_applies() {
        let a = random_descriptors(1, 6);
        let mut b = a.clone();
        // flip 64 bits
        for byte in b[0].iter_mut().take(8) {
            *byte = !*byte;
        }
        b.push(random_descriptors(1, 7)[0]);
        let mut params = MatchParameters::default();
        assert!(match_descriptors(&to_mat(&a), &to_mat(&b), &params).unwrap().is_empty());
        params.max_distance = None;
        assert_eq!(match_descriptors(&to_mat(&a), &to_mat(&b), &params).unwrap().len(), 1);
    }

    #[test]
    fn empty_input_gives_no_matches() {
        let a = to_mat(&random_descriptors(5, 8));
        let matches = match_descriptors(&a, &Mat::default(), &MatchParameters::default()).unwrap();
        assert!(matches.is_empty());
    }
}
