//! Productivity scoring over an activity pattern

use async_trait::async_trait;

use crate::error::StageError;
use crate::models::{
    ActivityPattern, ActivityStatus, PatternLabel, ProductivityAssessment, ScoreBand, Trend,
};
use crate::stages::Stage;

const TREND_ADJUSTMENT: i32 = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProductivityAssessmentStage;

#[async_trait]
impl Stage for ProductivityAssessmentStage {
    type Input = ActivityPattern;
    type Output = ProductivityAssessment;

    async fn run(&self, pattern: ActivityPattern) -> Result<ProductivityAssessment, StageError> {
        let assessment = assess(&pattern)?;
        tracing::info!(
            subject = %assessment.subject,
            score = assessment.score,
            "productivity assessed"
        );
        Ok(assessment)
    }
}

fn base_score(label: PatternLabel) -> i32 {
    match label {
        PatternLabel::DeepWork => 85,
        PatternLabel::Research => 75,
        PatternLabel::Collaborative => 70,
        PatternLabel::Administrative => 60,
        PatternLabel::Mixed => 50,
        PatternLabel::Distracted => 25,
        PatternLabel::Idle => 10,
    }
}

fn trend_adjustment(label: PatternLabel, trend: Trend) -> i32 {
    match (trend, label) {
        (Trend::Consistent, PatternLabel::Distracted | PatternLabel::Idle) => -TREND_ADJUSTMENT,
        (Trend::Consistent, PatternLabel::Mixed) => 0,
        (Trend::Consistent, _) => TREND_ADJUSTMENT,
        (Trend::Shifted | Trend::NoHistory, _) => 0,
    }
}

pub fn assess(pattern: &ActivityPattern) -> Result<ProductivityAssessment, StageError> {
    if !pattern.focus_ratio.is_finite() || pattern.category_weights.values().any(|w| !w.is_finite())
    {
        return Err(StageError::analysis("activity pattern has non-finite weights"));
    }

    let focus = pattern.focus_ratio.clamp(0.0, 1.0);
    let base = base_score(pattern.label);
    let focus_adj = (focus * 20.0).round() as i32 - 10;
    let trend_adj = trend_adjustment(pattern.label, pattern.trend);
    let score = (base + focus_adj + trend_adj).clamp(0, 100) as u8;
    let band = ScoreBand::for_score(score);

    let mut factors = vec![
        format!("Activity pattern: {}", pattern.label.describe()),
        format!("Focus ratio: {:.0}%", focus * 100.0),
        format!(
            "Trend: {}",
            match pattern.trend {
                Trend::NoHistory => "no prior history",
                Trend::Consistent => "consistent with history",
                Trend::Shifted => "shifted from usual pattern",
            }
        ),
        format!(
            "Status: {}",
            match pattern.status {
                ActivityStatus::Active => "active",
                ActivityStatus::Idle => "idle",
            }
        ),
    ];
    if let Some(top) = pattern.evidence.first() {
        factors.push(format!("Strongest cue: {top}"));
    }

    let rationale = format!(
        "{} pattern scored {} (base {}, focus {:+}, trend {:+}); {:?} productivity",
        pattern.label.describe(),
        score,
        base,
        focus_adj,
        trend_adj,
        band
    );

    Ok(ProductivityAssessment {
        subject: pattern.subject.clone(),
        window: pattern.window.clone(),
        score,
        band,
        rationale,
        factors_considered: factors,
    })
}
