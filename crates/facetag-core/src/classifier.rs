//! Identity classifier: a support-vector machine exported in libsvm layout.
//!
//! Labels come from one-vs-one voting. Probabilities come from pairwise
//! Platt sigmoids coupled into a distribution (Wu, Lin & Weng, 2004), so the
//! voted label and the most probable label can occasionally differ.

use crate::types::ReducedVector;
use ndarray::{Array2, ArrayView1};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Pairwise probabilities are clamped to `[MIN_PROB, 1 - MIN_PROB]`.
const MIN_PROB: f64 = 1e-7;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier expects {expected}-dim input, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("malformed classifier artifact: {0}")]
    Malformed(String),
    #[error("failed to read classifier artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse classifier artifact: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classifier output for one input.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Raw predicted label.
    pub label: String,
    /// Probability per class, in [`IdentityClassifier::classes`] order.
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// Highest class probability (0.0 for an empty distribution).
    pub fn confidence(&self) -> f32 {
        self.probabilities.iter().copied().fold(0.0, f32::max)
    }
}

/// Maps a reduced vector to a label and a probability distribution.
pub trait IdentityClassifier {
    fn classes(&self) -> &[String];

    fn predict(&self, input: &ReducedVector) -> Result<Prediction, ClassifierError>;

    /// Stored support vector by index, in the classifier's input space.
    fn support_vector(&self, index: usize) -> Option<Vec<f32>>;

    /// Mean support vector of each class, in [`classes`](Self::classes) order.
    fn class_centroids(&self) -> Vec<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Kernel {
    Linear,
    Rbf { gamma: f64 },
    Poly { gamma: f64, coef0: f64, degree: i32 },
    Sigmoid { gamma: f64, coef0: f64 },
}

impl Kernel {
    fn eval(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        match *self {
            Kernel::Linear => a.dot(&b),
            Kernel::Rbf { gamma } => {
                let sq: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
                (-gamma * sq).exp()
            }
            Kernel::Poly { gamma, coef0, degree } => (gamma * a.dot(&b) + coef0).powi(degree),
            Kernel::Sigmoid { gamma, coef0 } => (gamma * a.dot(&b) + coef0).tanh(),
        }
    }
}

/// On-disk SVM parameters, libsvm layout.
///
/// `dual_coef` is `(k - 1) × n_sv`; `intercept`, `prob_a` and `prob_b` hold
/// one entry per class pair `(i, j)`, `i < j`, in row-major pair order.
/// The pairwise decision value is `Σ coef · K(sv, x) + intercept`.
/// Signs follow libsvm: scikit-learn's two-class `dual_coef_` and
/// `intercept_` are negated and must be flipped back on export.
#[derive(Debug, Clone, Deserialize)]
pub struct SvmArtifact {
    pub classes: Vec<String>,
    pub kernel: Kernel,
    pub support_vectors: Vec<Vec<f64>>,
    pub n_support: Vec<usize>,
    pub dual_coef: Vec<Vec<f64>>,
    pub intercept: Vec<f64>,
    pub prob_a: Vec<f64>,
    pub prob_b: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SvmClassifier {
    classes: Vec<String>,
    kernel: Kernel,
    support_vectors: Array2<f64>,
    n_support: Vec<usize>,
    /// First support-vector row of each class.
    starts: Vec<usize>,
    dual_coef: Array2<f64>,
    intercept: Vec<f64>,
    prob_a: Vec<f64>,
    prob_b: Vec<f64>,
}

impl SvmClassifier {
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let text = std::fs::read_to_string(path)?;
        let artifact: SvmArtifact = serde_json::from_str(&text)?;
        let classifier = Self::from_artifact(artifact)?;
        tracing::info!(
            path = %path.display(),
            classes = ?classifier.classes,
            support_vectors = classifier.support_vectors.nrows(),
            dim = classifier.input_dim(),
            "loaded classifier"
        );
        Ok(classifier)
    }

    pub fn from_artifact(a: SvmArtifact) -> Result<Self, ClassifierError> {
        let malformed = |msg: String| Err(ClassifierError::Malformed(msg));

        let k = a.classes.len();
        if k < 2 {
            return malformed(format!("need at least 2 classes, got {k}"));
        }
        if a.n_support.len() != k {
            return malformed(format!("n_support has {} entries for {k} classes", a.n_support.len()));
        }
        if let Some(empty) = a.n_support.iter().position(|&n| n == 0) {
            return malformed(format!("class {:?} has no support vectors", a.classes[empty]));
        }
        let n_sv: usize = a.n_support.iter().sum();
        if n_sv != a.support_vectors.len() || n_sv == 0 {
            return malformed(format!(
                "n_support sums to {n_sv} but {} support vectors stored",
                a.support_vectors.len()
            ));
        }
        let dim = a.support_vectors[0].len();
        if dim == 0 || a.support_vectors.iter().any(|sv| sv.len() != dim) {
            return malformed("support vectors must share a non-zero length".into());
        }
        if a.dual_coef.len() != k - 1 || a.dual_coef.iter().any(|row| row.len() != n_sv) {
            return malformed(format!("dual_coef must be {} x {n_sv}", k - 1));
        }
        let pairs = k * (k - 1) / 2;
        for (name, v) in [("intercept", &a.intercept), ("prob_a", &a.prob_a), ("prob_b", &a.prob_b)] {
            if v.len() != pairs {
                return malformed(format!("{name} has {} entries, expected {pairs}", v.len()));
            }
        }

        let starts = a
            .n_support
            .iter()
            .scan(0, |acc, &n| {
                let start = *acc;
                *acc += n;
                Some(start)
            })
            .collect();

        let support_vectors =
            Array2::from_shape_vec((n_sv, dim), a.support_vectors.into_iter().flatten().collect())
                .map_err(|e| ClassifierError::Malformed(e.to_string()))?;
        let dual_coef =
            Array2::from_shape_vec((k - 1, n_sv), a.dual_coef.into_iter().flatten().collect())
                .map_err(|e| ClassifierError::Malformed(e.to_string()))?;

        Ok(Self {
            classes: a.classes,
            kernel: a.kernel,
            support_vectors,
            n_support: a.n_support,
            starts,
            dual_coef,
            intercept: a.intercept,
            prob_a: a.prob_a,
            prob_b: a.prob_b,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.support_vectors.ncols()
    }

    /// One-vs-one decision values, one per class pair.
    fn decision_values(&self, x: ArrayView1<f64>) -> Vec<f64> {
        let kvalue: Vec<f64> = self
            .support_vectors
            .rows()
            .into_iter()
            .map(|sv| self.kernel.eval(sv, x))
            .collect();

        let k = self.classes.len();
        let mut out = Vec::with_capacity(k * (k - 1) / 2);
        let mut p = 0;
        for i in 0..k {
            for j in (i + 1)..k {
                let (si, ci) = (self.starts[i], self.n_support[i]);
                let (sj, cj) = (self.starts[j], self.n_support[j]);
                let coef1 = self.dual_coef.row(j - 1);
                let coef2 = self.dual_coef.row(i);

                let sum: f64 = (si..si + ci).map(|m| coef1[m] * kvalue[m]).sum::<f64>()
                    + (sj..sj + cj).map(|m| coef2[m] * kvalue[m]).sum::<f64>();
                out.push(sum + self.intercept[p]);
                p += 1;
            }
        }
        out
    }
}

impl IdentityClassifier for SvmClassifier {
    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn predict(&self, input: &ReducedVector) -> Result<Prediction, ClassifierError> {
        if input.len() != self.input_dim() {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.input_dim(),
                actual: input.len(),
            });
        }
        let x: Vec<f64> = input.values.iter().map(|&v| v as f64).collect();
        let dec = self.decision_values(ArrayView1::from(x.as_slice()));

        let k = self.classes.len();
        let mut votes = vec![0usize; k];
        let mut pairwise = vec![vec![0.0f64; k]; k];
        let mut p = 0;
        for i in 0..k {
            for j in (i + 1)..k {
                if dec[p] > 0.0 {
                    votes[i] += 1;
                } else {
                    votes[j] += 1;
                }
                let r = sigmoid_predict(dec[p], self.prob_a[p], self.prob_b[p])
                    .clamp(MIN_PROB, 1.0 - MIN_PROB);
                pairwise[i][j] = r;
                pairwise[j][i] = 1.0 - r;
                p += 1;
            }
        }

        // Ties go to the lowest class index.
        let mut winner = 0;
        for (i, &v) in votes.iter().enumerate() {
            if v > votes[winner] {
                winner = i;
            }
        }

        let probabilities = if k == 2 {
            vec![pairwise[0][1], pairwise[1][0]]
        } else {
            couple_pairwise(&pairwise)
        };

        Ok(Prediction {
            label: self.classes[winner].clone(),
            probabilities: probabilities.into_iter().map(|v| v as f32).collect(),
        })
    }

    fn support_vector(&self, index: usize) -> Option<Vec<f32>> {
        (index < self.support_vectors.nrows())
            .then(|| self.support_vectors.row(index).iter().map(|&v| v as f32).collect())
    }

    fn class_centroids(&self) -> Vec<Vec<f32>> {
        self.starts
            .iter()
            .zip(&self.n_support)
            .map(|(&start, &count)| {
                let rows = self.support_vectors.slice(ndarray::s![start..start + count, ..]);
                rows.mean_axis(ndarray::Axis(0))
                    .map(|m| m.iter().map(|&v| v as f32).collect())
                    .unwrap_or_default()
            })
            .collect()
    }
}

/// Platt sigmoid `1 / (1 + exp(dec·A + B))`, evaluated without overflow.
fn sigmoid_predict(decision: f64, a: f64, b: f64) -> f64 {
    let f = decision * a + b;
    if f >= 0.0 {
        (-f).exp() / (1.0 + (-f).exp())
    } else {
        1.0 / (1.0 + f.exp())
    }
}

/// Couple pairwise probabilities `r[i][j] ≈ P(i | i or j)` into a single
/// distribution (Wu, Lin & Weng, method 2).
#[allow(clippy::needless_range_loop)]
fn couple_pairwise(r: &[Vec<f64>]) -> Vec<f64> {
    let k = r.len();
    let max_iter = 100.max(k);
    let eps = 0.005 / k as f64;

    let mut q = vec![vec![0.0f64; k]; k];
    for t in 0..k {
        for j in 0..k {
            if j != t {
                q[t][t] += r[j][t] * r[j][t];
                q[t][j] = -r[j][t] * r[t][j];
            }
        }
    }

    let mut p = vec![1.0 / k as f64; k];
    let mut qp = vec![0.0f64; k];
    for iter in 0..max_iter {
        let mut pqp = 0.0;
        for t in 0..k {
            qp[t] = (0..k).map(|j| q[t][j] * p[j]).sum();
            pqp += p[t] * qp[t];
        }
        let max_error = qp.iter().map(|v| (v - pqp).abs()).fold(0.0, f64::max);
        if max_error < eps {
            break;
        }
        if iter + 1 == max_iter {
            tracing::debug!("pairwise coupling reached iteration limit");
        }
        for t in 0..k {
            let diff = (-qp[t] + pqp) / q[t][t];
            p[t] += diff;
            pqp = (pqp + diff * (diff * q[t][t] + 2.0 * qp[t])) / (1.0 + diff) / (1.0 + diff);
            for j in 0..k {
                qp[j] = (qp[j] + diff * q[t][j]) / (1.0 + diff);
                p[j] /= 1.0 + diff;
            }
        }
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;

    fn two_class() -> SvmClassifier {
        SvmClassifier::from_artifact(SvmArtifact {
            classes: vec!["A".into(), "B".into()],
            kernel: Kernel::Linear,
            support_vectors: vec![vec![1.0, 0.0], vec![-1.0, 0.0]],
            n_support: vec![1, 1],
            dual_coef: vec![vec![1.0, -1.0]],
            intercept: vec![0.0],
            prob_a: vec![-2.0],
            prob_b: vec![0.0],
        })
        .unwrap()
    }

    fn three_class() -> SvmClassifier {
        SvmClassifier::from_artifact(SvmArtifact {
            classes: vec!["J".into(), "K".into(), "L".into()],
            kernel: Kernel::Linear,
            support_vectors: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![-1.0, -1.0]],
            n_support: vec![1, 1, 1],
            dual_coef: vec![vec![1.0, -1.0, -1.0], vec![1.0, 1.0, -1.0]],
            intercept: vec![0.0; 3],
            prob_a: vec![-1.0; 3],
            prob_b: vec![0.0; 3],
        })
        .unwrap()
    }

    fn rv(values: &[f32]) -> ReducedVector {
        ReducedVector { values: values.to_vec() }
    }

    #[test]
    fn test_two_class_prediction_and_probability() {
        let svm = two_class();
        let p = svm.predict(&rv(&[2.0, 0.0])).unwrap();
        assert_eq!(p.label, "A");
        let expected = 1.0 / (1.0 + (-8.0f64).exp());
        assert_abs_diff_eq!(p.probabilities[0] as f64, expected, epsilon = 1e-6);
        assert_abs_diff_eq!(p.probabilities[1] as f64, 1.0 - expected, epsilon = 1e-6);
        assert_abs_diff_eq!(p.confidence(), p.probabilities[0]);

        let p = svm.predict(&rv(&[-2.0, 0.0])).unwrap();
        assert_eq!(p.label, "B");
        assert!(p.probabilities[1] > 0.99);
    }

    #[test]
    fn test_zero_decision_votes_for_second_class() {
        let p = two_class().predict(&rv(&[0.0, 5.0])).unwrap();
        assert_eq!(p.label, "B");
        assert_abs_diff_eq!(p.probabilities[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_three_class_coupled_distribution() {
        let p = three_class().predict(&rv(&[3.0, 0.0])).unwrap();
        assert_eq!(p.label, "J");
        let sum: f32 = p.probabilities.iter().sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-3);
        assert!(p.probabilities.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(p.probabilities[0] > p.probabilities[1]);
        assert!(p.probabilities[1] > p.probabilities[2]);
    }

    #[test]
    fn test_rbf_kernel() {
        let k = Kernel::Rbf { gamma: 0.5 };
        let a = [1.0, 2.0];
        let b = [3.0, 2.0];
        assert_abs_diff_eq!(k.eval(ArrayView1::from(&a[..]), ArrayView1::from(&b[..])), (-2.0f64).exp());
    }

    #[test]
    fn test_predict_dimension_mismatch() {
        match two_class().predict(&rv(&[1.0, 2.0, 3.0])) {
            Err(ClassifierError::DimensionMismatch { expected: 2, actual: 3 }) => {}
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_support_vectors_and_centroids() {
        let svm = SvmClassifier::from_artifact(SvmArtifact {
            classes: vec!["A".into(), "B".into()],
            kernel: Kernel::Linear,
            support_vectors: vec![vec![0.0, 0.0], vec![2.0, 2.0], vec![10.0, 0.0]],
            n_support: vec![2, 1],
            dual_coef: vec![vec![0.5, 0.5, -1.0]],
            intercept: vec![0.0],
            prob_a: vec![-1.0],
            prob_b: vec![0.0],
        })
        .unwrap();
        assert_eq!(svm.support_vector(1), Some(vec![2.0, 2.0]));
        assert_eq!(svm.support_vector(3), None);
        assert_eq!(svm.class_centroids(), vec![vec![1.0, 1.0], vec![10.0, 0.0]]);
    }

    #[test]
    fn test_malformed_artifacts_rejected() {
        let base = SvmArtifact {
            classes: vec!["A".into(), "B".into()],
            kernel: Kernel::Linear,
            support_vectors: vec![vec![1.0], vec![-1.0]],
            n_support: vec![1, 1],
            dual_coef: vec![vec![1.0, -1.0]],
            intercept: vec![0.0],
            prob_a: vec![-1.0],
            prob_b: vec![0.0],
        };

        let mut a = base.clone();
        a.n_support = vec![2, 1];
        assert!(matches!(SvmClassifier::from_artifact(a), Err(ClassifierError::Malformed(_))));

        let mut a = base.clone();
        a.intercept = vec![];
        assert!(matches!(SvmClassifier::from_artifact(a), Err(ClassifierError::Malformed(_))));

        let mut a = base.clone();
        a.classes.truncate(1);
        a.n_support.truncate(1);
        assert!(matches!(SvmClassifier::from_artifact(a), Err(ClassifierError::Malformed(_))));

        let mut a = base;
        a.support_vectors[1].push(0.0);
        assert!(matches!(SvmClassifier::from_artifact(a), Err(ClassifierError::Malformed(_))));
    }

    #[test]
    fn test_class_without_support_vectors_rejected() {
        let a = SvmArtifact {
            classes: vec!["A".into(), "B".into(), "C".into()],
            kernel: Kernel::Linear,
            support_vectors: vec![vec![1.0], vec![-1.0]],
            n_support: vec![1, 0, 1],
            dual_coef: vec![vec![1.0, -1.0], vec![1.0, -1.0]],
            intercept: vec![0.0; 3],
            prob_a: vec![-1.0; 3],
            prob_b: vec![0.0; 3],
        };
        match SvmClassifier::from_artifact(a) {
            Err(ClassifierError::Malformed(msg)) => assert!(msg.contains("\"B\"")),
            other => panic!("expected malformed artifact, got {other:?}"),
        }
    }

    #[test]
    fn test_load_rejects_bad_files() {
        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        write!(garbage, "{{\"classes\": [\"A\", ").unwrap();
        assert!(matches!(SvmClassifier::load(garbage.path()), Err(ClassifierError::Json(_))));

        let mut inconsistent = tempfile::NamedTempFile::new().unwrap();
        write!(
            inconsistent,
            r#"{{
                "classes": ["A", "B"],
                "kernel": {{"type": "linear"}},
                "support_vectors": [[1.0, 0.0]],
                "n_support": [1, 1],
                "dual_coef": [[1.0, -1.0]],
                "intercept": [0.0],
                "prob_a": [-1.0],
                "prob_b": [0.0]
            }}"#
        )
        .unwrap();
        assert!(matches!(SvmClassifier::load(inconsistent.path()), Err(ClassifierError::Malformed(_))));

        let missing = std::path::Path::new("/nonexistent/classifier.json");
        assert!(matches!(SvmClassifier::load(missing), Err(ClassifierError::Io(_))));
    }

    #[test]
    fn test_load_json_artifact() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "classes": ["A", "B"],
                "kernel": {{"type": "rbf", "gamma": 0.25}},
                "support_vectors": [[1.0, 0.0], [-1.0, 0.0]],
                "n_support": [1, 1],
                "dual_coef": [[1.0, -1.0]],
                "intercept": [0.0],
                "prob_a": [-3.0],
                "prob_b": [0.0]
            }}"#
        )
        .unwrap();
        let svm = SvmClassifier::load(file.path()).unwrap();
        assert_eq!(svm.classes(), &["A".to_string(), "B".to_string()]);
        assert_eq!(svm.predict(&rv(&[0.9, 0.0])).unwrap().label, "A");
    }
}
