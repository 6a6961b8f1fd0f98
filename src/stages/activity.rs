//! Activity pattern classification
//!
//! Pure function of the observation: identical observations always produce
//! identical patterns.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

use crate::error::StageError;
use crate::models::{
    ActivityCategory, ActivityPattern, ActivityStatus, PatternLabel, Trend, VisualObservation,
};
use crate::stages::Stage;

/// Share of total confidence a category needs to name the pattern
const DOMINANCE_THRESHOLD: f32 = 0.5;
const MAX_EVIDENCE: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityPatternStage;

#[async_trait]
impl Stage for ActivityPatternStage {
    type Input = VisualObservation;
    type Output = ActivityPattern;

    async fn run(&self, observation: VisualObservation) -> Result<ActivityPattern, StageError> {
        let pattern = classify(&observation)?;
        tracing::info!(
            subject = %pattern.subject,
            label = %pattern.label,
            focus_ratio = pattern.focus_ratio,
            "activity pattern classified"
        );
        Ok(pattern)
    }
}

pub fn classify(observation: &VisualObservation) -> Result<ActivityPattern, StageError> {
    let mut totals: BTreeMap<ActivityCategory, f32> =
        ActivityCategory::ALL.iter().map(|c| (*c, 0.0)).collect();
    for cue in &observation.cues {
        *totals.entry(cue.category).or_insert(0.0) += cue.confidence;
    }

    let total: f32 = totals.values().sum();
    if observation.cues.is_empty() || !total.is_finite() || total <= 0.0 {
        return Err(StageError::analysis(
            "observation contains no usable activity cues",
        ));
    }

    let weights: BTreeMap<ActivityCategory, f32> =
        totals.into_iter().map(|(c, v)| (c, v / total)).collect();

    let label = label_for(&weights);
    let focus_ratio: f32 = weights
        .iter()
        .filter(|(c, _)| c.is_productive())
        .map(|(_, w)| *w)
        .sum();
    let trend = trend_for(label, &observation.history);
    let status = if label == PatternLabel::Idle {
        ActivityStatus::Idle
    } else {
        ActivityStatus::Active
    };

    let mut ranked: Vec<_> = observation.cues.iter().collect();
    // Stable sort keeps model order among equal confidences
    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let evidence = ranked
        .into_iter()
        .take(MAX_EVIDENCE)
        .map(|cue| format!("{} ({:?}, {:.2})", cue.label, cue.category, cue.confidence))
        .collect();

    let summary = format!(
        "{} pattern for {}: {:.0}% focused activity across {} cue(s)",
        capitalize(label.describe()),
        observation.subject,
        focus_ratio * 100.0,
        observation.cues.len()
    );

    Ok(ActivityPattern {
        subject: observation.subject.clone(),
        window: observation.window.clone(),
        label,
        status,
        trend,
        category_weights: weights,
        focus_ratio,
        evidence,
        summary,
    })
}

fn label_for(weights: &BTreeMap<ActivityCategory, f32>) -> PatternLabel {
    let idle = weights.get(&ActivityCategory::Idle).copied().unwrap_or(0.0);
    if idle >= DOMINANCE_THRESHOLD {
        return PatternLabel::Idle;
    }

    // First maximum in category order wins ties
    let mut dominant: Option<(ActivityCategory, f32)> = None;
    for (category, weight) in weights {
        if dominant.is_none_or(|(_, best)| *weight > best) {
            dominant = Some((*category, *weight));
        }
    }

    match dominant {
        Some((category, weight)) if weight >= DOMINANCE_THRESHOLD => match category {
            ActivityCategory::FocusedWork => PatternLabel::DeepWork,
            ActivityCategory::Communication => PatternLabel::Collaborative,
            ActivityCategory::Research => PatternLabel::Research,
            ActivityCategory::Administrative => PatternLabel::Administrative,
            ActivityCategory::Distraction => PatternLabel::Distracted,
            ActivityCategory::Idle => PatternLabel::Idle,
            ActivityCategory::Other => PatternLabel::Mixed,
        },
        _ => PatternLabel::Mixed,
    }
}

/// Compare against the most frequent prior label; ties go to the most recent one
fn trend_for(label: PatternLabel, history: &[PatternLabel]) -> Trend {
    if history.is_empty() {
        return Trend::NoHistory;
    }

    let mut counts: HashMap<PatternLabel, (usize, usize)> = HashMap::new();
    for (idx, prior) in history.iter().enumerate() {
        let entry = counts.entry(*prior).or_insert((0, idx));
        entry.0 += 1;
        entry.1 = idx;
    }
    let usual = counts
        .into_iter()
        .max_by_key(|(_, (count, last_seen))| (*count, *last_seen))
        .map(|(label, _)| label);

    if usual == Some(label) {
        Trend::Consistent
    } else {
        Trend::Shifted
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
