//! Visual analysis: screenshot in, structured activity cues out

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

use crate::clients::{InferenceClient, VisionRequest};
use crate::error::StageError;
use crate::imaging::{self, ImageLimits};
use crate::models::{ActivityCategory, ActivityCue, PipelineInput, VisualObservation};
use crate::stages::Stage;

const SYSTEM_PROMPT: &str = "You analyze workplace screenshots. Identify the applications, \
content and activities visible on screen. Respond with JSON only.";

const RESPONSE_SHAPE: &str = r#"Return a JSON object of the form:
{"summary": "<one or two sentences>",
 "cues": [{"label": "<what is visible, e.g. code editor>",
           "category": "focused_work|communication|research|administrative|distraction|idle|other",
           "confidence": <0.0-1.0>}]}"#;

static JSON_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("JSON object pattern should compile"));

#[derive(Debug, Deserialize)]
struct RawObservation {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    cues: Vec<RawCue>,
}

#[derive(Debug, Deserialize)]
struct RawCue {
    label: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct VisualAnalysisStage {
    client: Arc<dyn InferenceClient>,
    limits: ImageLimits,
}

impl VisualAnalysisStage {
    pub fn new(client: Arc<dyn InferenceClient>, limits: ImageLimits) -> Self {
        Self { client, limits }
    }

    fn build_request(input: &PipelineInput, image_png_base64: String) -> VisionRequest {
        let window = input.window.as_deref().unwrap_or("an unspecified window");
        VisionRequest {
            system_prompt: SYSTEM_PROMPT.to_string(),
            prompt: format!(
                "Screenshot captured for subject {} during {}.\n{}",
                input.subject, window, RESPONSE_SHAPE
            ),
            image_png_base64,
        }
    }
}

#[async_trait]
impl Stage for VisualAnalysisStage {
    type Input = PipelineInput;
    type Output = VisualObservation;

    async fn run(&self, input: PipelineInput) -> Result<VisualObservation, StageError> {
        input.validate(self.limits.max_encoded_bytes)?;
        let prepared = imaging::prepare(&input.image_data, &self.limits)?;

        let request = Self::build_request(&input, prepared.png_base64);
        let response = self
            .client
            .analyze_image(&request)
            .await
            .map_err(|e| StageError::analysis(format!("inference failed: {e}")))?;

        let (summary, cues) = parse_observation(&response.text)?;
        if cues.is_empty() {
            return Err(StageError::analysis("model reported no activity cues"));
        }

        tracing::info!(
            subject = %input.subject,
            cues = cues.len(),
            model = %response.model,
            "visual analysis complete"
        );

        Ok(VisualObservation {
            subject: input.subject,
            window: input.window,
            history: input.history,
            image: prepared.meta,
            cues,
            summary,
            model: response.model,
        })
    }
}

/// Parse model text into a summary and cues. Tolerates prose or code fences
/// around the JSON object.
pub fn parse_observation(text: &str) -> Result<(String, Vec<ActivityCue>), StageError> {
    let object = JSON_OBJECT
        .find(text)
        .ok_or_else(|| StageError::analysis("model response contained no JSON object"))?;
    let raw: RawObservation = serde_json::from_str(object.as_str())
        .map_err(|e| StageError::analysis(format!("model response is not valid JSON: {e}")))?;

    let cues = raw
        .cues
        .into_iter()
        .filter_map(|cue| {
            let label = cue.label.trim().to_string();
            if label.is_empty() {
                return None;
            }
            let category = cue
                .category
                .and_then(|c| c.parse::<ActivityCategory>().ok())
                .unwrap_or_else(|| ActivityCategory::classify(&label));
            Some(ActivityCue {
                label,
                category,
                confidence: normalize_confidence(cue.confidence),
            })
        })
        .collect();

    let summary = raw
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "No summary provided".to_string());

    Ok((summary, cues))
}

/// Missing confidence defaults to 0.5; percentages are scaled down
fn normalize_confidence(raw: Option<f32>) -> f32 {
    match raw {
        None => 0.5,
        Some(c) if !c.is_finite() => 0.0,
        Some(c) if c > 1.0 && c <= 100.0 => c / 100.0,
        Some(c) => c.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{InferenceError, VisionResponse};
    use base64::{Engine, engine::general_purpose::STANDARD};
    use image::{ExtendedColorType, ImageEncoder, Rgba, RgbaImage, codecs::png::PngEncoder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        reply: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn analyze_image(
            &self,
            request: &VisionRequest,
        ) -> Result<VisionResponse, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(!request.image_png_base64.is_empty());
            Ok(VisionResponse {
                text: self.reply.clone(),
                model: "scripted".to_string(),
            })
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn screenshot() -> String {
        let img = RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 255]));
        let mut buffer = Vec::new();
        PngEncoder::new(&mut buffer)
            .write_image(img.as_raw(), 16, 16, ExtendedColorType::Rgba8)
            .unwrap();
        STANDARD.encode(buffer)
    }

    fn stage(reply: &str) -> (VisualAnalysisStage, Arc<ScriptedClient>) {
        let client = Arc::new(ScriptedClient {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        });
        (
            VisualAnalysisStage::new(client.clone(), ImageLimits::default()),
            client,
        )
    }

    #[test]
    fn test_parse_fenced_response() {
        let text = "Here you go:\n```json\n{\"summary\": \"Editing code\", \"cues\": [\
            {\"label\": \"code editor\", \"category\": \"focused_work\", \"confidence\": 0.9},\
            {\"label\": \"Slack chat\", \"confidence\": 85}]}\n```";
        let (summary, cues) = parse_observation(text).unwrap();
        assert_eq!(summary, "Editing code");
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].category, ActivityCategory::FocusedWork);
        assert_eq!(cues[1].category, ActivityCategory::Communication);
        assert!((cues[1].confidence - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_parse_rejects_prose() {
        let err = parse_observation("I cannot see anything useful").unwrap_err();
        assert!(matches!(err, StageError::Analysis { .. }));
    }

    #[test]
    fn test_parse_drops_blank_labels_and_clamps() {
        let (summary, cues) =
            parse_observation(r#"{"cues": [{"label": "  "}, {"label": "terminal", "confidence": -3}]}"#)
                .unwrap();
        assert_eq!(summary, "No summary provided");
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].confidence, 0.0);
    }

    #[tokio::test]
    async fn test_run_produces_observation() {
        let (stage, client) = stage(
            r#"{"summary": "IDE open", "cues": [{"label": "code editor", "confidence": 0.8}]}"#,
        );
        let input = PipelineInput {
            subject: "E1".to_string(),
            window: Some("09:00-10:00".to_string()),
            image_data: screenshot(),
            history: Vec::new(),
        };

        let observation = stage.run(input).await.unwrap();
        assert_eq!(observation.subject, "E1");
        assert_eq!(observation.cues.len(), 1);
        assert_eq!(observation.image.width, 16);
        assert_eq!(observation.model, "scripted");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_fails_fast_on_empty_input() {
        let (stage, client) = stage("{}");
        let input = PipelineInput {
            subject: "E1".to_string(),
            window: None,
            image_data: String::new(),
            history: Vec::new(),
        };

        let err = stage.run(input).await.unwrap_err();
        assert!(matches!(err, StageError::InvalidInput { .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_fails_when_no_cues() {
        let (stage, _client) = stage(r#"{"summary": "nothing", "cues": []}"#);
        let input = PipelineInput {
            subject: "E1".to_string(),
            window: None,
            image_data: screenshot(),
            history: Vec::new(),
        };

        let err = stage.run(input).await.unwrap_err();
        assert_eq!(err, StageError::analysis("model reported no activity cues"));
    }
}
