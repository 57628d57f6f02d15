//! Vector math for backends that score vectors in-process.

use crate::error::{Error, Result};
use crate::types::SimilarityMetric;

pub fn dot(a: &[f32], b: &[f32]) -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() }

pub fn norm(a: &[f32]) -> f32 { dot(a, a).sqrt() }

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom <= f32::EPSILON { 0.0 } else { dot(a, b) / denom }
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

/// Higher-is-better similarity under `metric`.
pub fn similarity(metric: SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => cosine(a, b),
        SimilarityMetric::Dot => dot(a, b),
        SimilarityMetric::Euclidean => 1.0 / (1.0 + euclidean(a, b)),
    }
}

pub fn check_dimension(index: &str, expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() == expected {
        Ok(())
    } else {
        Err(Error::DimensionMismatch { index: index.to_string(), expected, actual: vector.len() })
    }
}
