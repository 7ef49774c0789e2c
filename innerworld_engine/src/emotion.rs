//! Keyword-based emotional classification and per-user emotional history.
//!
//! Classification is a pure function of the message and the keyword table. The history ring
//! lives inside each session and feeds the volatility, storm and dominant-emotion signals.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::EmotionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionalState {
    Tiredness,
    Anxiety,
    Anger,
    Interest,
    Doubt,
}

/// Tie-break order for classification and dominant-emotion counting. Earlier wins.
pub const EMOTION_PRIORITY: [EmotionalState; 5] = [
    EmotionalState::Tiredness,
    EmotionalState::Anxiety,
    EmotionalState::Anger,
    EmotionalState::Interest,
    EmotionalState::Doubt,
];

const INTENSITY_PER_HIT: f64 = 0.3;
const DEFAULT_INTENSITY: f64 = 0.5;
const SNIPPET_CHARS: usize = 50;

impl EmotionalState {
    pub fn as_str(self) -> &'static str {
        match self {
            EmotionalState::Tiredness => "tiredness",
            EmotionalState::Anxiety => "anxiety",
            EmotionalState::Anger => "anger",
            EmotionalState::Interest => "interest",
            EmotionalState::Doubt => "doubt",
        }
    }

    pub fn is_negative(self) -> bool {
        matches!(
            self,
            EmotionalState::Tiredness | EmotionalState::Anxiety | EmotionalState::Anger
        )
    }

    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            EmotionalState::Tiredness => &[
                "устал",
                "устала",
                "не хочу",
                "скучно",
                "надоело",
                "хватит",
                "не могу больше",
                "сил нет",
                "замучил",
                "замучила",
            ],
            EmotionalState::Anxiety => &[
                "боюсь",
                "страшно",
                "волнуюсь",
                "тревожно",
                "беспокоюсь",
                "переживаю",
                "нервничаю",
                "паникую",
                "испугался",
                "испугалась",
            ],
            EmotionalState::Anger => &[
                "злюсь",
                "бесит",
                "раздражает",
                "ненавижу",
                "достало",
                "разозлился",
                "разозлилась",
                "противно",
                "фу",
                "глупо",
            ],
            EmotionalState::Interest => &[
                "интересно",
                "хочу",
                "расскажи",
                "покажи",
                "здорово",
                "круто",
                "давай",
                "попробую",
                "можно",
                "а что",
                "а как",
            ],
            EmotionalState::Doubt => &[
                "не понимаю",
                "не знаю",
                "не уверен",
                "не уверена",
                "сомневаюсь",
                "непонятно",
                "сложно",
                "трудно",
                "запутался",
                "запуталась",
            ],
        }
    }

    /// Calm-first location for each state.
    pub fn recommended_location(self) -> &'static str {
        match self {
            EmotionalState::Tiredness | EmotionalState::Anxiety => "forest_calm",
            EmotionalState::Anger => "mountain_emptiness",
            EmotionalState::Doubt => "tower_confusion",
            EmotionalState::Interest => "city_mind",
        }
    }

    /// Accusative form used in "Вижу, что ты чувствуешь ...".
    pub fn felt_as(self) -> &'static str {
        match self {
            EmotionalState::Tiredness => "усталость",
            EmotionalState::Anxiety => "тревогу",
            EmotionalState::Anger => "злость",
            EmotionalState::Interest => "интерес",
            EmotionalState::Doubt => "сомнение",
        }
    }

    fn support_messages(self) -> &'static [&'static str] {
        match self {
            EmotionalState::Tiredness => &[
                "Похоже, ты устал 😴 Давай сделаем паузу или выберем что-то полегче?",
                "Отдыхать тоже важно. Хочешь задание покороче?",
            ],
            EmotionalState::Anxiety => &[
                "Я рядом 🤗 Разберёмся по шагу за раз.",
                "Волноваться нормально. Давай начнём с самого простого.",
            ],
            EmotionalState::Anger => &[
                "Понимаю, что ты злишься 😤 Так бывает, когда что-то не выходит.",
                "Можно выдохнуть и попробовать по-другому. Я помогу.",
            ],
            EmotionalState::Doubt => &[
                "Сомневаться нормально, значит ты думаешь 🤔",
                "Давай вместе найдём, что именно непонятно.",
            ],
            EmotionalState::Interest => &[
                "Вижу, тебе интересно! 🌟",
                "Отлично, с интересом всё получается быстрее!",
            ],
        }
    }
}

/// One classified message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalReading {
    pub state: EmotionalState,
    pub intensity: f64,
    pub keywords: Vec<String>,
    pub snippet: String,
    pub at: DateTime<Utc>,
}

/// Classify a message. Same input always yields the same state, intensity and keywords.
pub fn classify(message: &str, at: DateTime<Utc>) -> EmotionalReading {
    let lower = message.to_lowercase();

    let mut best: Option<(EmotionalState, Vec<String>)> = None;
    for state in EMOTION_PRIORITY {
        let hits: Vec<String> = state
            .keywords()
            .iter()
            .filter(|keyword| lower.contains(*keyword))
            .map(|keyword| keyword.to_string())
            .collect();
        if hits.is_empty() {
            continue;
        }
        let beats_current = best
            .as_ref()
            .map_or(true, |(_, current)| hits.len() > current.len());
        if beats_current {
            best = Some((state, hits));
        }
    }

    let snippet: String = message.chars().take(SNIPPET_CHARS).collect();
    match best {
        Some((state, keywords)) => EmotionalReading {
            state,
            intensity: (keywords.len() as f64 * INTENSITY_PER_HIT).min(1.0),
            keywords,
            snippet,
            at,
        },
        None => EmotionalReading {
            state: EmotionalState::Interest,
            intensity: DEFAULT_INTENSITY,
            keywords: Vec::new(),
            snippet,
            at,
        },
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionalSummary {
    pub current: EmotionalState,
    pub current_intensity: f64,
    pub dominant: EmotionalState,
    pub volatility: f64,
    pub storm: bool,
    pub total_readings: usize,
    pub recommended_location: String,
}

/// Bounded ring of readings, oldest evicted first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionHistory {
    capacity: usize,
    readings: VecDeque<EmotionalReading>,
}

impl Default for EmotionHistory {
    fn default() -> Self {
        Self::with_capacity(EmotionConfig::default().history_capacity)
    }
}

impl EmotionHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            readings: VecDeque::new(),
        }
    }

    pub fn push(&mut self, reading: EmotionalReading) {
        self.readings.push_back(reading);
        while self.readings.len() > self.capacity {
            self.readings.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn latest(&self) -> Option<&EmotionalReading> {
        self.readings.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmotionalReading> {
        self.readings.iter()
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }

    /// Fraction of adjacent in-window pairs whose states differ.
    pub fn volatility(&self, now: DateTime<Utc>, window_minutes: i64) -> f64 {
        let cutoff = now - ChronoDuration::minutes(window_minutes);
        let recent: Vec<EmotionalState> = self
            .readings
            .iter()
            .filter(|reading| reading.at > cutoff)
            .map(|reading| reading.state)
            .collect();
        if recent.len() < 2 {
            return 0.0;
        }

        let changes = recent.windows(2).filter(|pair| pair[0] != pair[1]).count();
        changes as f64 / (recent.len() - 1) as f64
    }

    /// True when the last `run` readings are all negative.
    pub fn storm(&self, run: usize) -> bool {
        if run == 0 || self.readings.len() < run {
            return false;
        }
        self.readings
            .iter()
            .rev()
            .take(run)
            .all(|reading| reading.state.is_negative())
    }

    pub fn dominant(&self, window: usize) -> EmotionalState {
        let mut counts = [0usize; EMOTION_PRIORITY.len()];
        for reading in self.readings.iter().rev().take(window) {
            if let Some(index) = EMOTION_PRIORITY.iter().position(|s| *s == reading.state) {
                counts[index] += 1;
            }
        }

        let mut dominant = EmotionalState::Interest;
        let mut best = 0usize;
        for (index, count) in counts.iter().enumerate() {
            if *count > best {
                best = *count;
                dominant = EMOTION_PRIORITY[index];
            }
        }
        dominant
    }

    /// Support line for `state`, rotating with the history length.
    pub fn support_message(&self, state: EmotionalState) -> &'static str {
        let messages = state.support_messages();
        messages[self.readings.len() % messages.len()]
    }

    pub fn summary(&self, now: DateTime<Utc>, config: &EmotionConfig) -> EmotionalSummary {
        let (current, current_intensity) = self
            .latest()
            .map(|reading| (reading.state, reading.intensity))
            .unwrap_or((EmotionalState::Interest, DEFAULT_INTENSITY));
        EmotionalSummary {
            current,
            current_intensity,
            dominant: self.dominant(config.dominant_window),
            volatility: self.volatility(now, config.volatility_window_minutes),
            storm: self.storm(config.storm_run),
            total_readings: self.readings.len(),
            recommended_location: current.recommended_location().to_string(),
        }
    }
}
