//! Embedding aggregation — reduces accepted per-frame vectors into the
//! canonical identity vector.

use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AggregateError {
    #[error("insufficient frames: {got} accepted, {min} required")]
    InsufficientFrames { got: usize, min: usize },
    #[error("frame embeddings disagree on dimension: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Element-wise mean of the input vectors, re-normalized to unit length.
///
/// The mean is order-independent, so any permutation of the same frames
/// yields the same canonical vector. The minimum-count precondition is
/// validated here independently of the session gating.
pub fn aggregate(frames: &[Embedding], min_frames: usize) -> Result<Embedding, AggregateError> {
    if frames.len() < min_frames {
        return Err(AggregateError::InsufficientFrames {
            got: frames.len(),
            min: min_frames,
        });
    }

    let dim = frames[0].dim();
    for frame in &frames[1..] {
        if frame.dim() != dim {
            return Err(AggregateError::DimensionMismatch {
                expected: dim,
                got: frame.dim(),
            });
        }
    }

    let n = frames.len() as f32;
    let mut mean = vec![0.0f32; dim];
    for frame in frames {
        for (acc, v) in mean.iter_mut().zip(frame.values.iter()) {
            *acc += v;
        }
    }
    for v in mean.iter_mut() {
        *v /= n;
    }

    let canonical = Embedding {
        values: mean,
        model_version: frames[0].model_version.clone(),
    };
    Ok(canonical.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding {
            values,
            model_version: Some("test".into()),
        }
    }

    #[test]
    fn test_mean_then_normalize() {
        let frames = vec![emb(vec![1.0, 0.0]), emb(vec![0.0, 1.0])];
        let out = aggregate(&frames, 2).unwrap();
        // Mean is (0.5, 0.5); normalized to (0.7071, 0.7071).
        assert!((out.values[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((out.values[1] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!(out.is_unit(1e-6));
    }

    #[test]
    fn test_order_independence() {
        let a = emb(vec![0.9, 0.1, 0.3]);
        let b = emb(vec![0.2, 0.8, 0.1]);
        let c = emb(vec![0.5, 0.5, 0.7]);

        let forward = aggregate(&[a.clone(), b.clone(), c.clone()], 3).unwrap();
        let reversed = aggregate(&[c.clone(), b.clone(), a.clone()], 3).unwrap();
        let rotated = aggregate(&[b, c, a], 3).unwrap();

        for (x, y) in forward.values.iter().zip(reversed.values.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
        for (x, y) in forward.values.iter().zip(rotated.values.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_output_always_unit_length() {
        let frames = vec![
            emb(vec![0.3, 0.1, 0.9, 0.2]),
            emb(vec![0.7, 0.6, 0.1, 0.4]),
            emb(vec![0.2, 0.9, 0.5, 0.8]),
        ];
        let out = aggregate(&frames, 3).unwrap();
        assert!(out.is_unit(1e-5), "norm = {}", out.norm());
    }

    #[test]
    fn test_insufficient_frames() {
        let frames = vec![emb(vec![1.0, 0.0])];
        let err = aggregate(&frames, 3).unwrap_err();
        assert_eq!(err, AggregateError::InsufficientFrames { got: 1, min: 3 });
    }

    #[test]
    fn test_empty_input() {
        let err = aggregate(&[], 1).unwrap_err();
        assert_eq!(err, AggregateError::InsufficientFrames { got: 0, min: 1 });
    }

    #[test]
    fn test_dimension_mismatch() {
        let frames = vec![emb(vec![1.0, 0.0]), emb(vec![1.0, 0.0, 0.0])];
        let err = aggregate(&frames, 2).unwrap_err();
        assert_eq!(
            err,
            AggregateError::DimensionMismatch {
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn test_single_frame_passthrough() {
        let frames = vec![emb(vec![3.0, 4.0])];
        let out = aggregate(&frames, 1).unwrap();
        assert!((out.values[0] - 0.6).abs() < 1e-6);
        assert!((out.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_model_version_carried_through() {
        let frames = vec![emb(vec![1.0, 0.0]), emb(vec![1.0, 0.0])];
        let out = aggregate(&frames, 2).unwrap();
        assert_eq!(out.model_version.as_deref(), Some("test"));
    }
}
