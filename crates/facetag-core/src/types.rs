use serde::{Deserialize, Serialize};

/// Number of points in an iBUG-68 landmark set.
pub const LANDMARK_COUNT: usize = 68;

/// Length of a face descriptor produced by the embedding model.
pub const DESCRIPTOR_DIM: usize = 128;

/// Label reported for faces that fail the acceptance test.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Detected face region in detector-input coordinates.
#[derive(Debug, Clone)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Ordered 68-point face landmarks in integer pixel coordinates.
///
/// Indices follow the iBUG-68 scheme: 0..=16 jaw line (0 = left edge,
/// 8 = chin, 16 = right edge), 17..=26 brows, 27..=35 nose, 36..=47 eyes,
/// 48..=67 mouth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LandmarkSet {
    points: [(i32, i32); LANDMARK_COUNT],
}

impl LandmarkSet {
    pub const JAW_LEFT: usize = 0;
    pub const CHIN: usize = 8;
    pub const JAW_RIGHT: usize = 16;
    pub const BROW: usize = 24;
    pub const NOSE_TIP: usize = 30;
    pub const MOUTH_LEFT: usize = 48;
    pub const MOUTH_RIGHT: usize = 54;

    const LEFT_EYE: std::ops::RangeInclusive<usize> = 36..=41;
    const RIGHT_EYE: std::ops::RangeInclusive<usize> = 42..=47;

    pub fn new(points: [(i32, i32); LANDMARK_COUNT]) -> Self {
        Self { points }
    }

    /// Build from a slice, returning `None` unless it holds exactly 68 points.
    pub fn from_slice(points: &[(i32, i32)]) -> Option<Self> {
        let points: [(i32, i32); LANDMARK_COUNT] = points.try_into().ok()?;
        Some(Self { points })
    }

    pub fn points(&self) -> &[(i32, i32); LANDMARK_COUNT] {
        &self.points
    }

    pub fn point(&self, index: usize) -> (i32, i32) {
        self.points[index]
    }

    /// Five alignment anchors: [left eye centre, right eye centre, nose tip,
    /// left mouth corner, right mouth corner], in image orientation.
    pub fn alignment_points(&self) -> [(f32, f32); 5] {
        let to_f32 = |(x, y): (i32, i32)| (x as f32, y as f32);
        [
            self.centroid(Self::LEFT_EYE),
            self.centroid(Self::RIGHT_EYE),
            to_f32(self.points[Self::NOSE_TIP]),
            to_f32(self.points[Self::MOUTH_LEFT]),
            to_f32(self.points[Self::MOUTH_RIGHT]),
        ]
    }

    fn centroid(&self, range: std::ops::RangeInclusive<usize>) -> (f32, f32) {
        let pts = &self.points[range];
        let n = pts.len() as f32;
        let (sx, sy) = pts
            .iter()
            .fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x as f32, ay + y as f32));
        (sx / n, sy / n)
    }
}

/// Face descriptor vector (128-dimensional for the bundled embedding model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

/// Descriptor after the fixed linear projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedVector {
    pub values: Vec<f32>,
}

impl ReducedVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to another vector of the same length.
    pub fn euclidean_distance(&self, other: &[f32]) -> f32 {
        self.values
            .iter()
            .zip(other.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// On-screen face rectangle in original-frame pixels.
///
/// Width and height are not validated and may be negative for
/// degenerate landmark sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Per-face output of the identification pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentificationResult {
    pub face_box: FaceBox,
    /// Predicted label, or [`UNKNOWN_LABEL`] when rejected.
    pub label: String,
    /// Max class probability when accepted, exactly 0.0 when rejected.
    pub confidence: f32,
    /// Acceptance distance the decision was based on.
    pub distance: f32,
}

impl IdentificationResult {
    /// Overlay caption, e.g. `"K (0.87)"`.
    pub fn caption(&self) -> String {
        format!("{} ({:.2})", self.label, self.confidence)
    }
}
