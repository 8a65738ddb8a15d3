use lookout_hw::ImagePayload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name the backend assigns to faces it could not match.
pub const UNKNOWN_NAME: &str = "Unknown";

/// How an endpoint scales face confidences.
///
/// The backend is not consistent: identify and group analysis return
/// percentages, group verification returns raw fractions. The scale is
/// carried with each face instead of normalising at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceScale {
    /// Value in `[0, 1]`.
    Fraction,
    /// Value in `[0, 100]`.
    Percent,
}

impl ConfidenceScale {
    pub fn to_percent(self, value: f32) -> f32 {
        match self {
            ConfidenceScale::Fraction => value * 100.0,
            ConfidenceScale::Percent => value,
        }
    }
}

/// Face box in the encoded frame's native pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from the backend's `[x, y, width, height]` array.
    pub fn from_xywh(values: [f32; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }
}

/// One face returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectedFace {
    pub name: String,
    pub confidence: f32,
    pub scale: ConfidenceScale,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub distance: Option<f32>,
}

impl DetectedFace {
    pub fn confidence_percent(&self) -> f32 {
        self.scale.to_percent(self.confidence)
    }

    pub fn is_identified(&self) -> bool {
        !self.name.is_empty() && self.name != UNKNOWN_NAME
    }

    /// Overlay label, e.g. `alice (87.5%)`.
    pub fn label(&self) -> String {
        format!("{} ({:.1}%)", self.name, self.confidence_percent())
    }
}

/// Which analysis endpoint a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalysisRequestKind {
    Identify,
    GroupAnalyze,
    GroupVerify,
    CrowdCount,
}

impl AnalysisRequestKind {
    pub fn path(self) -> &'static str {
        match self {
            AnalysisRequestKind::Identify => "/api/identify-face",
            AnalysisRequestKind::GroupAnalyze => "/api/analyze-group",
            AnalysisRequestKind::GroupVerify => "/api/verify-group",
            AnalysisRequestKind::CrowdCount => "/api/crowd-count",
        }
    }

    pub fn confidence_scale(self) -> ConfidenceScale {
        match self {
            AnalysisRequestKind::Identify | AnalysisRequestKind::GroupAnalyze => {
                ConfidenceScale::Percent
            }
            AnalysisRequestKind::GroupVerify | AnalysisRequestKind::CrowdCount => {
                ConfidenceScale::Fraction
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisRequestKind::Identify => "identify",
            AnalysisRequestKind::GroupAnalyze => "group",
            AnalysisRequestKind::GroupVerify => "verify",
            AnalysisRequestKind::CrowdCount => "crowd",
        }
    }
}

impl fmt::Display for AnalysisRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisRequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identify" => Ok(AnalysisRequestKind::Identify),
            "group" | "analyze-group" => Ok(AnalysisRequestKind::GroupAnalyze),
            "verify" | "verify-group" => Ok(AnalysisRequestKind::GroupVerify),
            "crowd" | "crowd-count" => Ok(AnalysisRequestKind::CrowdCount),
            other => Err(format!("unknown analysis kind: {other}")),
        }
    }
}

/// A request kind together with its per-kind arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisMode {
    Identify,
    GroupAnalyze,
    GroupVerify { required_users: Vec<String> },
    CrowdCount,
}

impl AnalysisMode {
    pub fn kind(&self) -> AnalysisRequestKind {
        match self {
            AnalysisMode::Identify => AnalysisRequestKind::Identify,
            AnalysisMode::GroupAnalyze => AnalysisRequestKind::GroupAnalyze,
            AnalysisMode::GroupVerify { .. } => AnalysisRequestKind::GroupVerify,
            AnalysisMode::CrowdCount => AnalysisRequestKind::CrowdCount,
        }
    }
}

/// One frame submitted for analysis.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub mode: AnalysisMode,
    pub image: ImagePayload,
}

/// Parsed backend response. Exactly one variant per session mode.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisResult {
    Identify {
        faces: Vec<DetectedFace>,
    },
    Group {
        faces: Vec<DetectedFace>,
        total_faces: u32,
        identified_count: u32,
    },
    Verify {
        verified: bool,
        missing_users: Vec<String>,
        extra_users: Vec<String>,
        faces: Vec<DetectedFace>,
    },
    Crowd {
        total_count: u32,
        annotated_image: Option<String>,
    },
}

impl AnalysisResult {
    pub fn kind(&self) -> AnalysisRequestKind {
        match self {
            AnalysisResult::Identify { .. } => AnalysisRequestKind::Identify,
            AnalysisResult::Group { .. } => AnalysisRequestKind::GroupAnalyze,
            AnalysisResult::Verify { .. } => AnalysisRequestKind::GroupVerify,
            AnalysisResult::Crowd { .. } => AnalysisRequestKind::CrowdCount,
        }
    }

    /// Faces to draw. Crowd results carry none.
    pub fn faces(&self) -> &[DetectedFace] {
        match self {
            AnalysisResult::Identify { faces }
            | AnalysisResult::Group { faces, .. }
            | AnalysisResult::Verify { faces, .. } => faces,
            AnalysisResult::Crowd { .. } => &[],
        }
    }

    /// Whether the result represents a success for status colouring.
    /// Only a failed group verification is negative.
    pub fn is_positive(&self) -> bool {
        !matches!(self, AnalysisResult::Verify { verified: false, .. })
    }

    /// One-line human summary for the status line.
    pub fn summary(&self) -> String {
        match self {
            AnalysisResult::Identify { faces } => {
                let names: Vec<&str> = faces
                    .iter()
                    .filter(|f| f.is_identified())
                    .map(|f| f.name.as_str())
                    .collect();
                if names.is_empty() {
                    format!("Detected {} faces", faces.len())
                } else {
                    format!("Detected {} faces: {}", faces.len(), names.join(", "))
                }
            }
            AnalysisResult::Group {
                total_faces,
                identified_count,
                ..
            } => format!("{identified_count} of {total_faces} faces identified"),
            AnalysisResult::Verify {
                verified: true, ..
            } => "Group verified".to_string(),
            AnalysisResult::Verify {
                missing_users,
                extra_users,
                ..
            } => {
                let mut text = String::from("Verification failed");
                if !missing_users.is_empty() {
                    text.push_str("; missing: ");
                    text.push_str(&missing_users.join(", "));
                }
                if !extra_users.is_empty() {
                    text.push_str("; unexpected: ");
                    text.push_str(&extra_users.join(", "));
                }
                text
            }
            AnalysisResult::Crowd { total_count, .. } => format!("People counted: {total_count}"),
        }
    }
}
