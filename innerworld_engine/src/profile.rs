use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DIMENSION_MIN: i32 = 1;
pub const DIMENSION_MAX: i32 = 10;
const DEFAULT_DIMENSION: i32 = 5;
const DEFAULT_HISTORY_CAPACITY: usize = 200;

const PATTERN_MIN_HISTORY: usize = 5;
const PATTERN_WINDOW: usize = 10;
const TREND_RATIO: f64 = 1.5;
const STRUGGLE_BELOW: i32 = 4;
const LOW_MOTIVATION_BELOW: i32 = 3;
const DECLINING_MIN_NEGATIVE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningDimension {
    UnderstandingMeaning,
    Memory,
    Attention,
    Motivation,
}

/// Tie-break order for weakest/strongest. The first dimension holding the extreme wins.
pub const DIMENSION_PRIORITY: [LearningDimension; 4] = [
    LearningDimension::UnderstandingMeaning,
    LearningDimension::Memory,
    LearningDimension::Attention,
    LearningDimension::Motivation,
];

impl LearningDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            LearningDimension::UnderstandingMeaning => "understanding_meaning",
            LearningDimension::Memory => "memory",
            LearningDimension::Attention => "attention",
            LearningDimension::Motivation => "motivation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "understanding_meaning" | "understanding" => Some(LearningDimension::UnderstandingMeaning),
            "memory" => Some(LearningDimension::Memory),
            "attention" => Some(LearningDimension::Attention),
            "motivation" => Some(LearningDimension::Motivation),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            LearningDimension::UnderstandingMeaning => "понимание смысла",
            LearningDimension::Memory => "память",
            LearningDimension::Attention => "внимание",
            LearningDimension::Motivation => "мотивация",
        }
    }

    pub fn recommended_location(self) -> &'static str {
        match self {
            LearningDimension::UnderstandingMeaning => "tower_confusion",
            LearningDimension::Memory => "valley_words",
            LearningDimension::Attention => "forest_calm",
            LearningDimension::Motivation => "workshop_creator",
        }
    }

    /// Curriculum modules that train this dimension, most relevant first.
    pub fn modules(self) -> &'static [u32] {
        match self {
            LearningDimension::UnderstandingMeaning => &[15, 6, 5],
            LearningDimension::Memory => &[16, 9, 15],
            LearningDimension::Attention => &[8, 2, 19],
            LearningDimension::Motivation => &[17, 20, 5],
        }
    }

    fn teaching_strategy(self) -> &'static str {
        match self {
            LearningDimension::UnderstandingMeaning => {
                "Больше объяснений \"почему\" и примеров из жизни. Связываем новое со знакомым."
            }
            LearningDimension::Memory => {
                "Повторение с интервалами, эмоциональные якоря и визуализация."
            }
            LearningDimension::Attention => {
                "Короткие сессии с перерывами и техники осознанности."
            }
            LearningDimension::Motivation => {
                "Больше выбора и контроля, связь с личными целями, быстрые успехи."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileChange {
    pub dimension: LearningDimension,
    pub value: i32,
    pub delta: i32,
    pub source: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningProfile {
    pub understanding_meaning: i32,
    pub memory: i32,
    pub attention: i32,
    pub motivation: i32,
    history_capacity: usize,
    history: VecDeque<ProfileChange>,
}

impl Default for LearningProfile {
    fn default() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl LearningProfile {
    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            understanding_meaning: DEFAULT_DIMENSION,
            memory: DEFAULT_DIMENSION,
            attention: DEFAULT_DIMENSION,
            motivation: DEFAULT_DIMENSION,
            history_capacity: capacity.max(1),
            history: VecDeque::new(),
        }
    }

    pub fn get(&self, dimension: LearningDimension) -> i32 {
        match dimension {
            LearningDimension::UnderstandingMeaning => self.understanding_meaning,
            LearningDimension::Memory => self.memory,
            LearningDimension::Attention => self.attention,
            LearningDimension::Motivation => self.motivation,
        }
    }

    fn slot(&mut self, dimension: LearningDimension) -> &mut i32 {
        match dimension {
            LearningDimension::UnderstandingMeaning => &mut self.understanding_meaning,
            LearningDimension::Memory => &mut self.memory,
            LearningDimension::Attention => &mut self.attention,
            LearningDimension::Motivation => &mut self.motivation,
        }
    }

    /// Apply `delta` clamped to [1, 10]. A change entry is appended even when the clamp
    /// swallows the whole delta; it records the effective delta.
    pub fn adjust(
        &mut self,
        dimension: LearningDimension,
        delta: i32,
        source: &str,
        at: DateTime<Utc>,
    ) -> i32 {
        let old = self.get(dimension);
        let new = old.saturating_add(delta).clamp(DIMENSION_MIN, DIMENSION_MAX);
        *self.slot(dimension) = new;

        self.history.push_back(ProfileChange {
            dimension,
            value: new,
            delta: new - old,
            source: source.to_string(),
            at,
        });
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }

        new
    }

    pub fn history(&self) -> impl Iterator<Item = &ProfileChange> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn weakest(&self) -> LearningDimension {
        let mut weakest = DIMENSION_PRIORITY[0];
        for dimension in DIMENSION_PRIORITY {
            if self.get(dimension) < self.get(weakest) {
                weakest = dimension;
            }
        }
        weakest
    }

    pub fn strongest(&self) -> LearningDimension {
        let mut strongest = DIMENSION_PRIORITY[0];
        for dimension in DIMENSION_PRIORITY {
            if self.get(dimension) > self.get(strongest) {
                strongest = dimension;
            }
        }
        strongest
    }

    pub fn average(&self) -> f64 {
        let total: i32 = DIMENSION_PRIORITY.iter().map(|d| self.get(*d)).sum();
        total as f64 / DIMENSION_PRIORITY.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyTier {
    Easy,
    Medium,
    Hard,
}

impl DifficultyTier {
    pub fn as_str(self) -> &'static str {
        match self {
            DifficultyTier::Easy => "easy",
            DifficultyTier::Medium => "medium",
            DifficultyTier::Hard => "hard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcernType {
    GeneralStruggle,
    LowMotivation,
    DecliningPerformance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum LearningPattern {
    InsufficientData,
    Analyzed {
        trend: Trend,
        concern: Option<ConcernType>,
        positive_changes: usize,
        negative_changes: usize,
        average_score: f64,
        weakest: LearningDimension,
    },
}

impl LearningPattern {
    pub fn concern(&self) -> Option<ConcernType> {
        match self {
            LearningPattern::InsufficientData => None,
            LearningPattern::Analyzed { concern, .. } => *concern,
        }
    }
}

/// Stateless read-side over a profile: recommendations, difficulty, trends.
pub struct ProfileAnalyzer;

impl ProfileAnalyzer {
    pub fn recommended_location(profile: &LearningProfile) -> &'static str {
        profile.weakest().recommended_location()
    }

    pub fn difficulty(profile: &LearningProfile) -> DifficultyTier {
        let average = profile.average();
        if average < 4.0 {
            DifficultyTier::Easy
        } else if average < 7.0 {
            DifficultyTier::Medium
        } else {
            DifficultyTier::Hard
        }
    }

    pub fn recommended_modules(profile: &LearningProfile, count: usize) -> Vec<u32> {
        profile
            .weakest()
            .modules()
            .iter()
            .take(count)
            .copied()
            .collect()
    }

    pub fn detect_pattern(profile: &LearningProfile) -> LearningPattern {
        if profile.history_len() < PATTERN_MIN_HISTORY {
            return LearningPattern::InsufficientData;
        }

        let skip = profile.history_len().saturating_sub(PATTERN_WINDOW);
        let (mut positive, mut negative) = (0usize, 0usize);
        for change in profile.history().skip(skip) {
            if change.delta > 0 {
                positive += 1;
            } else if change.delta < 0 {
                negative += 1;
            }
        }

        let trend = if positive as f64 > negative as f64 * TREND_RATIO {
            Trend::Improving
        } else if negative as f64 > positive as f64 * TREND_RATIO {
            Trend::Declining
        } else {
            Trend::Stable
        };

        let concern = if DIMENSION_PRIORITY
            .iter()
            .all(|d| profile.get(*d) < STRUGGLE_BELOW)
        {
            Some(ConcernType::GeneralStruggle)
        } else if profile.motivation < LOW_MOTIVATION_BELOW {
            Some(ConcernType::LowMotivation)
        } else if trend == Trend::Declining && negative > DECLINING_MIN_NEGATIVE {
            Some(ConcernType::DecliningPerformance)
        } else {
            None
        };

        LearningPattern::Analyzed {
            trend,
            concern,
            positive_changes: positive,
            negative_changes: negative,
            average_score: profile.average(),
            weakest: profile.weakest(),
        }
    }

    pub fn progress_summary(profile: &LearningProfile) -> String {
        let average = profile.average();
        let weakest = profile.weakest();
        let strongest = profile.strongest();

        let headline = if average >= 7.0 {
            format!("Отличный прогресс! 🌟 Средний балл: {:.1}/10", average)
        } else if average >= 5.0 {
            format!("Хороший прогресс! 👍 Средний балл: {:.1}/10", average)
        } else {
            format!("Есть над чем поработать. Средний балл: {:.1}/10", average)
        };

        format!(
            "{}\n\nСильная сторона: {} ({}/10)\nНад чем поработаем: {} ({}/10)",
            headline,
            strongest.display_name(),
            profile.get(strongest),
            weakest.display_name(),
            profile.get(weakest)
        )
    }

    pub fn teaching_strategy(profile: &LearningProfile) -> String {
        format!("Стратегия: {}", profile.weakest().teaching_strategy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_always_stays_in_bounds() {
        let now = Utc::now();
        let mut profile = LearningProfile::default();
        for delta in [-100, 37, i32::MIN, i32::MAX, 0, -3, 9] {
            for dimension in DIMENSION_PRIORITY {
                let value = profile.adjust(dimension, delta, "fuzz", now);
                assert!((DIMENSION_MIN..=DIMENSION_MAX).contains(&value));
            }
        }
    }

    #[test]
    fn clamped_adjustment_still_logs_effective_delta() {
        let now = Utc::now();
        let mut profile = LearningProfile::default();
        profile.adjust(LearningDimension::Memory, 20, "quest:x", now);
        profile.adjust(LearningDimension::Memory, 1, "quest:y", now);

        let log: Vec<_> = profile.history().cloned().collect();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].value, 10);
        assert_eq!(log[0].delta, 5);
        assert_eq!(log[1].value, 10);
        assert_eq!(log[1].delta, 0);
        assert_eq!(log[1].source, "quest:y");
    }

    #[test]
    fn weakest_and_tier_after_mixed_adjustments() {
        let now = Utc::now();
        let mut profile = LearningProfile::default();
        profile.adjust(LearningDimension::UnderstandingMeaning, -2, "x", now);
        profile.adjust(LearningDimension::Motivation, 3, "y", now);

        assert_eq!(profile.understanding_meaning, 3);
        assert_eq!(profile.memory, 5);
        assert_eq!(profile.attention, 5);
        assert_eq!(profile.motivation, 8);
        assert_eq!(profile.weakest(), LearningDimension::UnderstandingMeaning);
        assert_eq!(profile.strongest(), LearningDimension::Motivation);
        assert!((profile.average() - 5.25).abs() < 1e-9);
        assert_eq!(ProfileAnalyzer::difficulty(&profile), DifficultyTier::Medium);
        assert_eq!(ProfileAnalyzer::recommended_location(&profile), "tower_confusion");
    }

    #[test]
    fn ties_follow_the_dimension_priority() {
        let profile = LearningProfile::default();
        assert_eq!(profile.weakest(), LearningDimension::UnderstandingMeaning);
        assert_eq!(profile.strongest(), LearningDimension::UnderstandingMeaning);

        let mut profile = LearningProfile::default();
        profile.adjust(LearningDimension::Attention, -1, "t", Utc::now());
        profile.adjust(LearningDimension::Motivation, -1, "t", Utc::now());
        assert_eq!(profile.weakest(), LearningDimension::Attention);
    }

    #[test]
    fn history_cap_evicts_oldest() {
        let now = Utc::now();
        let mut profile = LearningProfile::with_history_capacity(3);
        for source in ["a", "b", "c", "d"] {
            profile.adjust(LearningDimension::Memory, 1, source, now);
        }
        let sources: Vec<_> = profile.history().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["b", "c", "d"]);
    }

    #[test]
    fn pattern_needs_five_entries() {
        let now = Utc::now();
        let mut profile = LearningProfile::default();
        for _ in 0..4 {
            profile.adjust(LearningDimension::Memory, 1, "t", now);
        }
        assert_eq!(
            ProfileAnalyzer::detect_pattern(&profile),
            LearningPattern::InsufficientData
        );
    }

    #[test]
    fn struggle_is_reported_before_low_motivation() {
        let now = Utc::now();
        let mut profile = LearningProfile::default();
        for dimension in DIMENSION_PRIORITY {
            profile.adjust(dimension, -4, "t", now);
        }
        profile.adjust(LearningDimension::Memory, 1, "t", now);

        // every dimension < 4 and motivation < 3: the first check wins
        let pattern = ProfileAnalyzer::detect_pattern(&profile);
        assert_eq!(pattern.concern(), Some(ConcernType::GeneralStruggle));
        match pattern {
            LearningPattern::Analyzed { trend, .. } => assert_eq!(trend, Trend::Declining),
            other => panic!("unexpected pattern {:?}", other),
        }
    }

    #[test]
    fn steady_decline_flags_declining_performance() {
        let now = Utc::now();
        let mut profile = LearningProfile::default();
        profile.adjust(LearningDimension::UnderstandingMeaning, 5, "t", now);
        profile.adjust(LearningDimension::Memory, 5, "t", now);
        profile.adjust(LearningDimension::Motivation, 5, "t", now);
        for _ in 0..4 {
            profile.adjust(LearningDimension::Attention, -1, "t", now);
        }
        for _ in 0..3 {
            profile.adjust(LearningDimension::Memory, -1, "t", now);
        }

        // 3 positive, 7 negative in the window, motivation still high
        let pattern = ProfileAnalyzer::detect_pattern(&profile);
        assert_eq!(pattern.concern(), Some(ConcernType::DecliningPerformance));
    }

    #[test]
    fn modules_follow_weakest_dimension() {
        let mut profile = LearningProfile::default();
        profile.adjust(LearningDimension::Attention, -3, "t", Utc::now());
        assert_eq!(ProfileAnalyzer::recommended_modules(&profile, 2), vec![8, 2]);
        assert!(ProfileAnalyzer::teaching_strategy(&profile).starts_with("Стратегия:"));
        assert!(ProfileAnalyzer::progress_summary(&profile).contains("внимание (2/10)"));
    }
}
