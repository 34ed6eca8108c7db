//! Composition analysis through an external vision-language model.
//!
//! The model is asked for a single JSON object (see [`PROMPT`]). Its reply is
//! parsed into wire structs that mirror the prompt exactly, validated, and
//! only then mapped to [`AnalysisResult`]. Model field names never leak into
//! stored records.

use crate::codec::{self, CodecError, DecodedImage, EncodeFormat};
use crate::config::AnalysisConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Instruction sent alongside every image.
pub const PROMPT: &str = r#"
You are a professional photographer, and you like photos that are well-lit, have a good composition, and are interesting.
You will be given a photograph and you will analyze it and provide feedback:
The feedback will consist of an analysis, a few scores, and 0-4 objects that you think could be improved or are perfect. Do not duplicate objects.
Avoid boxing things like the background or the sky because they are not objects.
Make sure boxes are as small as possible and as close to the object as possible.
Return a single JSON object with exactly this shape:
{
    "analysis": "3-5 sentences of in-depth professional analysis of the photo",
    "scores": {
        "composition": "1-100 inclusive",
        "lighting": "1-100 inclusive",
        "color": "1-100 inclusive"
    },
    "objects": [
        {
            "name": "name of the object, each word starts with a capital letter",
            "bounding_box": {
                "y_min": "y_min of box normalized to 0-1000",
                "y_max": "y_max of box normalized to 0-1000",
                "x_min": "x_min of box normalized to 0-1000",
                "x_max": "x_max of box normalized to 0-1000"
            },
            "analysis": "2-5 sentences of either improvement suggestions or why it is perfect",
            "is_perfect": "true or false"
        }
    ]
}
"#;

/// Upper bound of the normalized box coordinate space
pub const BOX_SCALE: u16 = 1000;

/// Objects with the same name whose edges all lie within this distance are duplicates
const DUPLICATE_TOLERANCE: u16 = 10;

/// JPEG quality of the downscaled copy sent to the model
const UPLOAD_QUALITY: u8 = 90;

/// Errors returned by the analysis client
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis service unavailable: {0}")]
    AnalysisUnavailable(String),

    #[error("Malformed analysis response: {0}")]
    MalformedAnalysis(String),

    #[error("Failed to prepare image for analysis: {0}")]
    Codec(#[from] CodecError),
}

/// Category scores, each in 1..=100. The category set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryScores {
    pub composition: u8,
    pub lighting: u8,
    pub color: u8,
}

/// Box edges in model coordinates, normalized to 0..=1000
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectBox {
    pub y_min: u16,
    pub y_max: u16,
    pub x_min: u16,
    pub x_max: u16,
}

impl ObjectBox {
    fn is_near(&self, other: &ObjectBox) -> bool {
        self.y_min.abs_diff(other.y_min) <= DUPLICATE_TOLERANCE
            && self.y_max.abs_diff(other.y_max) <= DUPLICATE_TOLERANCE
            && self.x_min.abs_diff(other.x_min) <= DUPLICATE_TOLERANCE
            && self.x_max.abs_diff(other.x_max) <= DUPLICATE_TOLERANCE
    }
}

/// One object the model called out
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub name: String,
    pub bounding_box: ObjectBox,
    pub analysis: String,
    /// Exemplary rather than needing improvement
    pub is_perfect: bool,
}

/// Validated critique of one photograph
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub analysis: String,
    pub scores: CategoryScores,
    pub objects: Vec<DetectedObject>,
}

/// Client for the vision model
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageAnalyzer: Send + Sync {
    /// Analyze one image. Every call is a fresh request; nothing is cached or retried.
    async fn analyze(&self, image: Arc<DecodedImage>) -> Result<AnalysisResult, AnalysisError>;
}

// Wire format of the model's JSON reply

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAnalysis {
    analysis: String,
    scores: RawScores,
    objects: Vec<RawObject>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScores {
    composition: LooseNumber,
    lighting: LooseNumber,
    color: LooseNumber,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawObject {
    name: String,
    bounding_box: RawBox,
    analysis: String,
    is_perfect: LooseBool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBox {
    y_min: LooseNumber,
    y_max: LooseNumber,
    x_min: LooseNumber,
    x_max: LooseNumber,
}

/// The prompt describes values as strings, so models answer either way
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LooseNumber {
    Number(f64),
    Text(String),
}

impl LooseNumber {
    fn in_range(&self, field: &str, min: u16, max: u16) -> Result<u16, AnalysisError> {
        let value = match self {
            LooseNumber::Number(n) => *n,
            LooseNumber::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                AnalysisError::MalformedAnalysis(format!("{} is not a number: {:?}", field, s))
            })?,
        };

        let rounded = value.round();
        if !rounded.is_finite() || rounded < min as f64 || rounded > max as f64 {
            return Err(AnalysisError::MalformedAnalysis(format!(
                "{} out of range {}-{}: {}",
                field, min, max, value
            )));
        }

        Ok(rounded as u16)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LooseBool {
    Bool(bool),
    Text(String),
}

impl LooseBool {
    fn parse(&self) -> Result<bool, AnalysisError> {
        match self {
            LooseBool::Bool(b) => Ok(*b),
            LooseBool::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(AnalysisError::MalformedAnalysis(format!(
                    "is_perfect must be true or false, got {:?}",
                    other
                ))),
            },
        }
    }
}

/// Capitalize the first letter of every word
fn capitalize_words(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Parse and validate the model's JSON reply.
pub fn parse_analysis(text: &str, max_objects: usize) -> Result<AnalysisResult, AnalysisError> {
    let raw: RawAnalysis = serde_json::from_str(text.trim())
        .map_err(|e| AnalysisError::MalformedAnalysis(e.to_string()))?;

    let analysis = raw.analysis.trim().to_string();
    if analysis.is_empty() {
        return Err(AnalysisError::MalformedAnalysis(
            "analysis text is empty".to_string(),
        ));
    }

    let scores = CategoryScores {
        composition: raw.scores.composition.in_range("scores.composition", 1, 100)? as u8,
        lighting: raw.scores.lighting.in_range("scores.lighting", 1, 100)? as u8,
        color: raw.scores.color.in_range("scores.color", 1, 100)? as u8,
    };

    let mut objects: Vec<DetectedObject> = Vec::with_capacity(raw.objects.len());

    for (index, raw_object) in raw.objects.into_iter().enumerate() {
        let name = capitalize_words(&raw_object.name);
        if name.is_empty() {
            return Err(AnalysisError::MalformedAnalysis(format!(
                "objects[{}].name is empty",
                index
            )));
        }

        let field = |edge: &str| format!("objects[{}].bounding_box.{}", index, edge);
        let bounding_box = ObjectBox {
            y_min: raw_object.bounding_box.y_min.in_range(&field("y_min"), 0, BOX_SCALE)?,
            y_max: raw_object.bounding_box.y_max.in_range(&field("y_max"), 0, BOX_SCALE)?,
            x_min: raw_object.bounding_box.x_min.in_range(&field("x_min"), 0, BOX_SCALE)?,
            x_max: raw_object.bounding_box.x_max.in_range(&field("x_max"), 0, BOX_SCALE)?,
        };

        if bounding_box.y_min > bounding_box.y_max || bounding_box.x_min > bounding_box.x_max {
            return Err(AnalysisError::MalformedAnalysis(format!(
                "objects[{}].bounding_box has min greater than max: {:?}",
                index, bounding_box
            )));
        }

        let duplicate = objects.iter().any(|existing| {
            existing.name.eq_ignore_ascii_case(&name) && existing.bounding_box.is_near(&bounding_box)
        });
        if duplicate {
            debug!(name = %name, "Dropping duplicate object from analysis");
            continue;
        }

        objects.push(DetectedObject {
            name,
            bounding_box,
            analysis: raw_object.analysis.trim().to_string(),
            is_perfect: raw_object.is_perfect.parse()?,
        });
    }

    // Counted after dedup
    if objects.len() > max_objects {
        return Err(AnalysisError::MalformedAnalysis(format!(
            "{} distinct objects returned, at most {} allowed",
            objects.len(),
            max_objects
        )));
    }

    Ok(AnalysisResult {
        analysis,
        scores,
        objects,
    })
}

// Gemini generateContent request/response envelope

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate
    fn into_text(self) -> Option<String> {
        let text: String = self
            .candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect();

        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Gemini-backed analyzer
pub struct GeminiAnalyzer {
    api_base: String,
    api_key: String,
    model: String,
    max_edge_px: u32,
    max_objects: usize,
    timeout: Duration,
    client: reqwest::Client,
}

impl GeminiAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_edge_px: config.max_edge_px,
            max_objects: config.max_objects,
            timeout: Duration::from_secs(config.request_timeout_secs),
            client: reqwest::Client::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        let model_path = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Downscale and encode the image the way the model receives it
    async fn prepare_payload(&self, image: Arc<DecodedImage>) -> Result<String, AnalysisError> {
        let max_edge = self.max_edge_px;

        let jpeg = tokio::task::spawn_blocking(move || {
            let resized = codec::thumbnail(&image, max_edge);
            codec::encode(&resized, EncodeFormat::Jpeg { quality: UPLOAD_QUALITY })
        })
        .await
        .map_err(|e| CodecError::Encode(format!("Image preparation task failed: {}", e)))??;

        Ok(STANDARD.encode(jpeg))
    }
}

#[async_trait]
impl ImageAnalyzer for GeminiAnalyzer {
    #[instrument(skip(self, image), fields(model = %self.model, width = image.width(), height = image.height()))]
    async fn analyze(&self, image: Arc<DecodedImage>) -> Result<AnalysisResult, AnalysisError> {
        let data = self.prepare_payload(image).await?;

        let request = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::Text {
                        text: PROMPT.to_string(),
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: "image/jpeg".to_string(),
                            data,
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
            },
        };

        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                metrics::counter!("feedback.analysis.unavailable").increment(1);
                AnalysisError::AnalysisUnavailable(format!("Vision request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Vision API returned an error");
            metrics::counter!("feedback.analysis.unavailable").increment(1);
            return Err(AnalysisError::AnalysisUnavailable(format!(
                "Vision API returned {}: {}",
                status, body
            )));
        }

        // The request timeout also covers reading the body
        let body = response.bytes().await.map_err(|e| {
            metrics::counter!("feedback.analysis.unavailable").increment(1);
            AnalysisError::AnalysisUnavailable(format!("Failed to read vision response: {}", e))
        })?;

        let envelope: GenerateContentResponse = serde_json::from_slice(&body).map_err(|e| {
            metrics::counter!("feedback.analysis.malformed").increment(1);
            AnalysisError::MalformedAnalysis(format!("Failed to parse vision response: {}", e))
        })?;

        metrics::histogram!("feedback.analysis.latency_seconds")
            .record(started.elapsed().as_secs_f64());

        let text = envelope.into_text().ok_or_else(|| {
            AnalysisError::MalformedAnalysis("Vision response contained no text".to_string())
        })?;

        let result = parse_analysis(&text, self.max_objects).map_err(|e| {
            metrics::counter!("feedback.analysis.malformed").increment(1);
            e
        })?;

        info!(
            object_count = result.objects.len(),
            composition = result.scores.composition,
            "Image analysis complete"
        );

        Ok(result)
    }
}
