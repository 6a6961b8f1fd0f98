//! Data carried between the pipeline stages
//!
//! Each run owns its intermediate artifacts; nothing here is shared across runs.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::StageError;

/// Identity of a processing stage, used to tag failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    VisualAnalysis,
    ActivityPattern,
    ProductivityAssessment,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::VisualAnalysis => "VisualAnalysis",
            StageName::ActivityPattern => "ActivityPattern",
            StageName::ProductivityAssessment => "ProductivityAssessment",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload submitted by the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInput {
    #[serde(default)]
    pub subject: String,
    /// Observation window, `HH:MM-HH:MM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    /// Base64 screenshot, optionally prefixed with a `data:` URI header
    #[serde(default, alias = "image")]
    pub image_data: String,
    /// Pattern labels from the subject's earlier runs, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<PatternLabel>,
}

impl PipelineInput {
    /// Reject malformed submissions before any stage executes
    pub fn validate(&self, max_image_bytes: usize) -> Result<(), StageError> {
        if self.subject.trim().is_empty() {
            return Err(StageError::invalid_input("subject cannot be empty"));
        }
        if let Some(window) = &self.window {
            parse_window(window)?;
        }
        if self.image_data.trim().is_empty() {
            return Err(StageError::invalid_input("No image data provided"));
        }
        let size = self.image_data.len();
        if size > max_image_bytes {
            return Err(StageError::invalid_input(format!(
                "Image too large ({size} bytes). Maximum allowed is {max_image_bytes} bytes."
            )));
        }
        crate::imaging::validate_image(&self.image_data)?;
        Ok(())
    }
}

/// Parse an `HH:MM-HH:MM` window; the end must follow the start
pub fn parse_window(window: &str) -> Result<(NaiveTime, NaiveTime), StageError> {
    let (start, end) = window
        .split_once('-')
        .ok_or_else(|| StageError::invalid_input(format!("window '{window}' must be HH:MM-HH:MM")))?;
    let parse = |part: &str| {
        NaiveTime::parse_from_str(part.trim(), "%H:%M").map_err(|e| {
            StageError::invalid_input(format!("window '{window}' has an invalid time: {e}"))
        })
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if end <= start {
        return Err(StageError::invalid_input(format!(
            "window '{window}' ends before it starts"
        )));
    }
    Ok((start, end))
}

/// Coarse bucket a detected cue falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    FocusedWork,
    Communication,
    Research,
    Administrative,
    Distraction,
    Idle,
    Other,
}

const CATEGORY_KEYWORDS: &[(ActivityCategory, &[&str])] = &[
    (
        ActivityCategory::Idle,
        &["idle", "lock screen", "screensaver", "blank", "desktop wallpaper", "sleep"],
    ),
    (
        ActivityCategory::Distraction,
        &[
            "social", "youtube", "streaming", "game", "shopping", "news", "reddit", "netflix",
            "twitter", "facebook", "instagram", "tiktok", "entertainment",
        ],
    ),
    (
        ActivityCategory::Communication,
        &["email", "mail", "chat", "slack", "teams", "meeting", "video call", "zoom", "message"],
    ),
    (
        ActivityCategory::FocusedWork,
        &[
            "code", "editor", "intellij", "terminal", "document", "spreadsheet", "design", "writing",
            "compil", "debug", "presentation",
        ],
    ),
    (
        ActivityCategory::Research,
        &["documentation", "search", "research", "wiki", "reading", "tutorial", "browser"],
    ),
    (
        ActivityCategory::Administrative,
        &["calendar", "timesheet", "ticket", "crm", "form", "file manager", "settings", "admin"],
    ),
];

impl ActivityCategory {
    pub const ALL: [ActivityCategory; 7] = [
        ActivityCategory::FocusedWork,
        ActivityCategory::Communication,
        ActivityCategory::Research,
        ActivityCategory::Administrative,
        ActivityCategory::Distraction,
        ActivityCategory::Idle,
        ActivityCategory::Other,
    ];

    /// Keyword classification for cue labels the model did not categorize.
    /// "documentation" must win over "document", so Research is checked first for it.
    pub fn classify(label: &str) -> ActivityCategory {
        let label = label.to_lowercase();
        if label.contains("documentation") {
            return ActivityCategory::Research;
        }
        CATEGORY_KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| label.contains(w)))
            .map(|(category, _)| *category)
            .unwrap_or(ActivityCategory::Other)
    }

    /// Whether time in this category counts toward focused activity
    pub fn is_productive(&self) -> bool {
        matches!(
            self,
            ActivityCategory::FocusedWork
                | ActivityCategory::Communication
                | ActivityCategory::Research
                | ActivityCategory::Administrative
        )
    }
}

impl FromStr for ActivityCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "focused_work" | "focus" | "work" => Ok(ActivityCategory::FocusedWork),
            "communication" => Ok(ActivityCategory::Communication),
            "research" => Ok(ActivityCategory::Research),
            "administrative" | "admin" => Ok(ActivityCategory::Administrative),
            "distraction" => Ok(ActivityCategory::Distraction),
            "idle" => Ok(ActivityCategory::Idle),
            "other" => Ok(ActivityCategory::Other),
            _ => Err(format!("unknown activity category '{s}'")),
        }
    }
}

/// A single cue detected in a screenshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityCue {
    pub label: String,
    pub category: ActivityCategory,
    pub confidence: f32,
}

/// Facts about the screenshot actually sent to inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub resized: bool,
}

/// Output of the visual analysis stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualObservation {
    pub subject: String,
    pub window: Option<String>,
    pub history: Vec<PatternLabel>,
    pub image: ImageMeta,
    pub cues: Vec<ActivityCue>,
    pub summary: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternLabel {
    DeepWork,
    Collaborative,
    Research,
    Administrative,
    Distracted,
    Idle,
    Mixed,
}

impl PatternLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternLabel::DeepWork => "deep_work",
            PatternLabel::Collaborative => "collaborative",
            PatternLabel::Research => "research",
            PatternLabel::Administrative => "administrative",
            PatternLabel::Distracted => "distracted",
            PatternLabel::Idle => "idle",
            PatternLabel::Mixed => "mixed",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            PatternLabel::DeepWork => "deep work",
            PatternLabel::Collaborative => "collaborative",
            PatternLabel::Research => "research",
            PatternLabel::Administrative => "administrative",
            PatternLabel::Distracted => "distracted",
            PatternLabel::Idle => "idle",
            PatternLabel::Mixed => "mixed",
        }
    }
}

impl fmt::Display for PatternLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "deep_work" => Ok(PatternLabel::DeepWork),
            "collaborative" => Ok(PatternLabel::Collaborative),
            "research" => Ok(PatternLabel::Research),
            "administrative" => Ok(PatternLabel::Administrative),
            "distracted" => Ok(PatternLabel::Distracted),
            "idle" => Ok(PatternLabel::Idle),
            "mixed" => Ok(PatternLabel::Mixed),
            _ => Err(format!("unknown pattern label '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Active,
    Idle,
}

/// How the current label relates to the subject's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    NoHistory,
    Consistent,
    Shifted,
}

/// Output of the activity pattern stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityPattern {
    pub subject: String,
    pub window: Option<String>,
    pub label: PatternLabel,
    pub status: ActivityStatus,
    pub trend: Trend,
    pub category_weights: BTreeMap<ActivityCategory, f32>,
    pub focus_ratio: f32,
    pub evidence: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBand {
    High,
    Moderate,
    Low,
    Minimal,
}

impl ScoreBand {
    pub fn for_score(score: u8) -> Self {
        match score {
            75.. => ScoreBand::High,
            50..=74 => ScoreBand::Moderate,
            25..=49 => ScoreBand::Low,
            _ => ScoreBand::Minimal,
        }
    }
}

/// Final output of a successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductivityAssessment {
    pub subject: String,
    pub window: Option<String>,
    pub score: u8,
    pub band: ScoreBand,
    pub rationale: String,
    pub factors_considered: Vec<String>,
}

/// Everything a successful run produced, one section per stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub visual_analysis: VisualObservation,
    pub activity_pattern: ActivityPattern,
    pub productivity_assessment: ProductivityAssessment,
}
