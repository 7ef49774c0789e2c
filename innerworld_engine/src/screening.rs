//! Per-message safety screening: sticky self-harm flag, self-worth drift, emotional storms,
//! and the risk tier that gates escalation to learning support.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ScreeningConfig, TierThresholds};
use crate::emotion::EmotionalState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningMetrics {
    pub self_worth: f64,
    pub self_criticism: f64,
    pub emotional_volatility: f64,
    pub manipulation_score: u32,
    self_harm_detected: bool,
    pub emotional_storm_count: u32,
    pub last_storm_at: Option<DateTime<Utc>>,
}

impl Default for ScreeningMetrics {
    fn default() -> Self {
        Self {
            self_worth: 0.5,
            self_criticism: 0.5,
            emotional_volatility: 0.0,
            manipulation_score: 0,
            self_harm_detected: false,
            emotional_storm_count: 0,
            last_storm_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Normal,
    SupportNeeded,
    Crisis,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Normal => "normal",
            RiskTier::SupportNeeded => "support_needed",
            RiskTier::Crisis => "crisis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcernLevel {
    None,
    Mild,
    Moderate,
    High,
}

/// What changed during one `update`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScreeningUpdate {
    pub self_harm_phrase: bool,
    pub self_deprecation: bool,
    pub storm_incremented: bool,
}

fn contains_any(haystack: &str, phrases: &[String]) -> bool {
    phrases
        .iter()
        .any(|phrase| !phrase.is_empty() && haystack.contains(&phrase.to_lowercase()))
}

impl ScreeningMetrics {
    /// Once set, stays set for the life of the session.
    pub fn self_harm_detected(&self) -> bool {
        self.self_harm_detected
    }

    pub fn update(
        &mut self,
        user_id: &str,
        message: &str,
        latest: Option<EmotionalState>,
        volatility: f64,
        now: DateTime<Utc>,
        config: &ScreeningConfig,
    ) -> ScreeningUpdate {
        let lower = message.to_lowercase();
        let critical = &config.thresholds.critical;
        let mut update = ScreeningUpdate::default();

        if contains_any(&lower, &critical.self_harm_phrases) {
            self.self_harm_detected = true;
            update.self_harm_phrase = true;
            tracing::error!("Self-harm language detected for user {}", user_id);
        }

        if contains_any(&lower, &config.self_deprecation_phrases) {
            self.self_worth = (self.self_worth - config.step).clamp(0.0, 1.0);
            self.self_criticism = (self.self_criticism + config.step).clamp(0.0, 1.0);
            update.self_deprecation = true;
        }

        if matches!(latest, Some(EmotionalState::Anger | EmotionalState::Anxiety)) {
            let window = ChronoDuration::minutes(critical.storm_window_minutes);
            if let Some(last) = self.last_storm_at {
                if now - last < window {
                    self.emotional_storm_count += 1;
                    update.storm_incremented = true;
                }
            }
            self.last_storm_at = Some(now);
        }

        self.emotional_volatility = volatility.clamp(0.0, 1.0);
        update
    }

    pub fn risk(&self, config: &ScreeningConfig) -> RiskTier {
        let thresholds = &config.thresholds;
        if self.self_harm_detected {
            RiskTier::Crisis
        } else if self.self_worth < thresholds.moderate.self_worth
            || self.emotional_storm_count > thresholds.critical.support_storm_count
        {
            RiskTier::SupportNeeded
        } else {
            RiskTier::Normal
        }
    }

    fn crosses(&self, tier: &TierThresholds) -> bool {
        self.self_worth < tier.self_worth
            || self.self_criticism > tier.self_criticism
            || self.emotional_volatility > tier.emotional_volatility
            || self.manipulation_score >= tier.manipulation_score
    }

    /// Highest tier any metric has crossed.
    pub fn concern_level(&self, config: &ScreeningConfig) -> ConcernLevel {
        let thresholds = &config.thresholds;
        if self.crosses(&thresholds.high) {
            ConcernLevel::High
        } else if self.crosses(&thresholds.moderate) {
            ConcernLevel::Moderate
        } else if self.crosses(&thresholds.mild) {
            ConcernLevel::Mild
        } else {
            ConcernLevel::None
        }
    }
}
