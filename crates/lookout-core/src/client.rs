//! HTTP inference client for the face-analysis backend.
//!
//! One `submit` call is exactly one POST. There is no retry here: the
//! scheduler's next tick is the retry policy. Every call settles within
//! the configured timeout.

use crate::types::{
    AnalysisMode, AnalysisRequest, AnalysisRequestKind, AnalysisResult, BoundingBox,
    ConfidenceScale, DetectedFace, UNKNOWN_NAME,
};
use lookout_hw::ImagePayload;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REGISTER_IMAGES: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    /// No response received: connection failure or timeout.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with a failure status or `success: false`.
    #[error("server error ({status}): {message}")]
    Http { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Rejected before sending.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Submits encoded frames for analysis.
pub trait InferenceClient: Send + Sync + 'static {
    fn submit(
        &self,
        request: AnalysisRequest,
    ) -> impl Future<Output = Result<AnalysisResult, RequestError>> + Send;
}

/// A user known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredUser {
    pub name: String,
    #[serde(default)]
    pub registration_date: Option<String>,
}

/// Backend acknowledgement of a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterOutcome {
    pub message: String,
    pub images_processed: Option<u32>,
    pub faces: Vec<DetectedFace>,
}

/// reqwest-backed client for the analysis endpoints.
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RequestError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| RequestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and read the whole body, bounded by the timeout.
    async fn exchange(&self, request: reqwest::RequestBuilder) -> Result<(u16, String), RequestError> {
        let exchange = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(classify_transport_error(&e)),
            Err(_) => Err(RequestError::Network(format!(
                "request timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    /// Register a named identity from 1–5 face images.
    pub async fn register_face(
        &self,
        name: &str,
        images: &[ImagePayload],
    ) -> Result<RegisterOutcome, RequestError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RequestError::InvalidRequest("name is required".into()));
        }
        if images.is_empty() || images.len() > MAX_REGISTER_IMAGES {
            return Err(RequestError::InvalidRequest(format!(
                "between 1 and {MAX_REGISTER_IMAGES} images are required, got {}",
                images.len()
            )));
        }

        let body = json!({
            "name": name,
            "images": images.iter().map(|i| i.data_url.as_str()).collect::<Vec<_>>(),
        });
        tracing::info!(name, images = images.len(), "registering face");

        let (status, text) = self
            .exchange(self.http.post(self.url("/api/register-face")).json(&body))
            .await?;
        parse_register_response(status, &text)
    }

    /// List identities registered with the backend.
    pub async fn registered_users(&self) -> Result<Vec<RegisteredUser>, RequestError> {
        let (status, text) = self
            .exchange(self.http.get(self.url("/api/registered-users")))
            .await?;
        let value = parse_envelope(status, &text)?;

        #[derive(Deserialize)]
        struct UsersBody {
            #[serde(default)]
            users: Vec<RegisteredUser>,
        }
        let body: UsersBody = decode(value)?;
        Ok(body.users)
    }
}

impl InferenceClient for HttpInferenceClient {
    fn submit(
        &self,
        request: AnalysisRequest,
    ) -> impl Future<Output = Result<AnalysisResult, RequestError>> + Send {
        async move {
            let kind = request.mode.kind();
            let body = request_body(&request);
            tracing::debug!(
                kind = %kind,
                width = request.image.width,
                height = request.image.height,
                "submitting frame"
            );

            let (status, text) = self
                .exchange(self.http.post(self.url(kind.path())).json(&body))
                .await?;
            parse_response(kind, status, &text)
        }
    }
}

/// JSON body for an analysis request.
pub fn request_body(request: &AnalysisRequest) -> Value {
    match &request.mode {
        AnalysisMode::GroupVerify { required_users } => json!({
            "image": request.image.data_url,
            "requiredUsers": required_users,
        }),
        _ => json!({ "image": request.image.data_url }),
    }
}

fn classify_transport_error(e: &reqwest::Error) -> RequestError {
    if e.is_timeout() {
        RequestError::Network(format!("request timed out: {e}"))
    } else if e.is_decode() {
        RequestError::Malformed(e.to_string())
    } else {
        RequestError::Network(e.to_string())
    }
}

fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Check the `{success, message}` envelope and return the parsed JSON.
fn parse_envelope(status: u16, body: &str) -> Result<Value, RequestError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) if !is_success_status(status) => {
            return Err(RequestError::Http {
                status,
                message: body_excerpt(body),
            });
        }
        Err(e) => return Err(RequestError::Malformed(e.to_string())),
    };

    let success = value.get("success").and_then(Value::as_bool);
    if success == Some(false) || !is_success_status(status) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body_excerpt(body));
        return Err(RequestError::Http { status, message });
    }
    if success.is_none() {
        return Err(RequestError::Malformed("missing `success` flag".into()));
    }
    Ok(value)
}

fn body_excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "request failed".into();
    }
    trimmed.chars().take(200).collect()
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RequestError> {
    serde_json::from_value(value).map_err(|e| RequestError::Malformed(e.to_string()))
}

#[derive(Deserialize)]
struct WireFace {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(rename = "box")]
    bbox: [f32; 4],
    #[serde(default, alias = "match_distance")]
    distance: Option<f32>,
}

impl WireFace {
    fn into_face(self, scale: ConfidenceScale) -> DetectedFace {
        DetectedFace {
            name: self.name.unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            confidence: self.confidence.unwrap_or(0.0),
            scale,
            bbox: BoundingBox::from_xywh(self.bbox),
            distance: self.distance,
        }
    }
}

fn into_faces(wire: Vec<WireFace>, scale: ConfidenceScale) -> Vec<DetectedFace> {
    wire.into_iter().map(|f| f.into_face(scale)).collect()
}

#[derive(Deserialize)]
struct IdentifyBody {
    results: Vec<WireFace>,
}

#[derive(Deserialize)]
struct GroupBody {
    faces: Vec<WireFace>,
    #[serde(default, alias = "totalFaces")]
    total_faces: Option<u32>,
    #[serde(default, alias = "identifiedCount")]
    identified_count: Option<u32>,
}

#[derive(Deserialize)]
struct VerifyBody {
    verified: bool,
    #[serde(default)]
    faces: Vec<WireFace>,
    #[serde(default, alias = "missingUsers")]
    missing_users: Vec<String>,
    #[serde(default, alias = "extraUsers")]
    extra_users: Vec<String>,
}

#[derive(Deserialize)]
struct CrowdBody {
    #[serde(alias = "totalCount")]
    total_count: u32,
    #[serde(default, alias = "annotatedImage")]
    annotated_image: Option<String>,
}

#[derive(Deserialize)]
struct RegisterBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, alias = "numImagesProcessed")]
    num_images_processed: Option<u32>,
    #[serde(default)]
    results: Vec<WireFace>,
}

/// Parse an analysis response body into the variant for `kind`.
pub fn parse_response(
    kind: AnalysisRequestKind,
    status: u16,
    body: &str,
) -> Result<AnalysisResult, RequestError> {
    let value = parse_envelope(status, body)?;
    let scale = kind.confidence_scale();

    let result = match kind {
        AnalysisRequestKind::Identify => {
            let body: IdentifyBody = decode(value)?;
            AnalysisResult::Identify {
                faces: into_faces(body.results, scale),
            }
        }
        AnalysisRequestKind::GroupAnalyze => {
            let body: GroupBody = decode(value)?;
            let faces = into_faces(body.faces, scale);
            let total_faces = body.total_faces.unwrap_or(faces.len() as u32);
            let identified_count = body
                .identified_count
                .unwrap_or_else(|| faces.iter().filter(|f| f.is_identified()).count() as u32);
            AnalysisResult::Group {
                faces,
                total_faces,
                identified_count,
            }
        }
        AnalysisRequestKind::GroupVerify => {
            let body: VerifyBody = decode(value)?;
            AnalysisResult::Verify {
                verified: body.verified,
                missing_users: body.missing_users,
                extra_users: body.extra_users,
                faces: into_faces(body.faces, scale),
            }
        }
        AnalysisRequestKind::CrowdCount => {
            let body: CrowdBody = decode(value)?;
            AnalysisResult::Crowd {
                total_count: body.total_count,
                annotated_image: body.annotated_image,
            }
        }
    };
    Ok(result)
}

fn parse_register_response(status: u16, body: &str) -> Result<RegisterOutcome, RequestError> {
    let value = parse_envelope(status, body)?;
    let body: RegisterBody = decode(value)?;
    Ok(RegisterOutcome {
        message: body
            .message
            .unwrap_or_else(|| "face registered".to_string()),
        images_processed: body.num_images_processed,
        faces: into_faces(body.results, ConfidenceScale::Fraction),
    })
}
