use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

/// Member id sent upstream when no identity was resolved.
pub const UNKNOWN_MEMBER_ID: i64 = -1;

/// Bounding box for a detected face, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// Face embedding vector (128-dimensional in the reference deployment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    #[cfg(test)]
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { (dot / denom).clamp(-1.0, 1.0) } else { 0.0 }
    }

    /// Angular distance `sqrt(2 - 2·cos)`, in [0, 2].
    #[cfg(test)]
    pub fn angular_distance(&self, other: &Embedding) -> f32 {
        angular_from_cosine(self.similarity(other))
    }

    /// Copy scaled to unit length. Zero vectors are returned unchanged.
    #[cfg(test)]
    pub fn normalized(&self) -> Embedding {
        Embedding { values: normalize(&self.values) }
    }
}

pub(crate) fn normalize(values: &[f32]) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter().map(|x| x / norm).collect()
    } else {
        values.to_vec()
    }
}

pub(crate) fn angular_from_cosine(cos: f32) -> f32 {
    (2.0 - 2.0 * cos).max(0.0).sqrt()
}

/// Catalog member id, kept verbatim as text.
///
/// The catalog may deliver member ids as JSON numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JSON form for upstream calls: a number when numeric, a string otherwise.
    pub fn to_wire(&self) -> serde_json::Value {
        match self.0.trim().parse::<i64>() {
            Ok(n) => serde_json::Value::from(n),
            Err(_) => serde_json::Value::from(self.0.clone()),
        }
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One enrolled identity within an index generation.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub label: u32,
    pub username: String,
    pub member_id: MemberId,
    pub embedding: Embedding,
}

/// One frame's worth of face-presence signal.
#[derive(Debug, Clone, Copy)]
pub struct PresenceSample {
    pub has_face: bool,
    pub at: Instant,
}

impl PresenceSample {
    pub fn new(has_face: bool, at: Instant) -> Self {
        Self { has_face, at }
    }
}

/// A saved frame waiting to be identified.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub image_path: PathBuf,
    /// Local capture time, `YYYYMMDD_HHMMSS`.
    pub timestamp: String,
}

/// Outcome of one identification job, as reported downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentificationResult {
    pub username: Option<String>,
    pub member_id: Option<MemberId>,
    pub avg_distance: Option<f32>,
}

impl IdentificationResult {
    pub fn unknown() -> Self {
        Self {
            username: None,
            member_id: None,
            avg_distance: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.username.is_some()
    }

    /// Name published on the message bus.
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("unknown")
    }

    /// Member id for upstream calls, `-1` when unknown.
    pub fn wire_member_id(&self) -> serde_json::Value {
        match &self.member_id {
            Some(id) => id.to_wire(),
            None => serde_json::Value::from(UNKNOWN_MEMBER_ID),
        }
    }
}
