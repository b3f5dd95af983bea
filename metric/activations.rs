//! Maps raw network outputs to a single "probability of modification" per image.

use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

const COSINE_EPS: f64 = 1e-8;

/// Logistic function, evaluated without overflow for large `|x|`.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Softmax of one row, shifted by its maximum.
pub fn softmax(logits: ArrayView1<f64>) -> Array1<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp = logits.mapv(|v| (v - max).exp());
    let total = exp.sum();
    exp / total
}

/// Probability that the image is not a cover: softmax mass of every class after the first.
pub fn classifier_probability(logits: ArrayView1<f64>) -> f64 {
    if logits.len() < 2 {
        return 0.0;
    }
    softmax(logits).iter().skip(1).sum()
}

/// Sigmoid of each binary-head logit.
pub fn binary_logits_to_probas(logits: ArrayView1<f64>) -> Array1<f64> {
    logits.mapv(sigmoid)
}

/// Row-wise [`classifier_probability`] for an `(n, classes)` logit matrix.
pub fn classifier_logits_to_probas(logits: ArrayView2<f64>) -> Array1<f64> {
    logits
        .axis_iter(Axis(0))
        .map(classifier_probability)
        .collect()
}

/// `1 - cos²` between each embedding and the cover axis `e0`.
///
/// Embeddings pointing along the first axis score 0; orthogonal ones score 1.
pub fn embedding_to_probas(embeddings: ArrayView2<f64>) -> Array1<f64> {
    embeddings
        .axis_iter(Axis(0))
        .map(|row| {
            if row.is_empty() {
                return 1.0;
            }
            let norm = row.dot(&row).sqrt();
            let cosine = row[0] / norm.max(COSINE_EPS);
            1.0 - cosine * cosine
        })
        .collect()
}
