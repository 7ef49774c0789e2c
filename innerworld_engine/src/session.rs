use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::config::EngineConfig;
use crate::emotion::{EmotionHistory, EmotionalReading};
use crate::profile::LearningProfile;
use crate::quest::QuestProgress;
use crate::screening::ScreeningMetrics;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    #[default]
    Start,
    ParentLinking,
    Onboarding,
    EmotionCheck,
    LocationSelection,
    QuestActive,
    QuestReflection,
    CasualChat,
    LearningSupport,
    ScreeningCheck,
    EndSession,
}

impl ConversationState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ConversationState::Start => "START",
            ConversationState::ParentLinking => "PARENT_LINKING",
            ConversationState::Onboarding => "ONBOARDING",
            ConversationState::EmotionCheck => "EMOTION_CHECK",
            ConversationState::LocationSelection => "LOCATION_SELECTION",
            ConversationState::QuestActive => "QUEST_ACTIVE",
            ConversationState::QuestReflection => "QUEST_REFLECTION",
            ConversationState::CasualChat => "CASUAL_CHAT",
            ConversationState::LearningSupport => "LEARNING_SUPPORT",
            ConversationState::ScreeningCheck => "SCREENING_CHECK",
            ConversationState::EndSession => "END_SESSION",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PARENT_LINKING" => ConversationState::ParentLinking,
            "ONBOARDING" => ConversationState::Onboarding,
            "EMOTION_CHECK" => ConversationState::EmotionCheck,
            "LOCATION_SELECTION" => ConversationState::LocationSelection,
            "QUEST_ACTIVE" => ConversationState::QuestActive,
            "QUEST_REFLECTION" => ConversationState::QuestReflection,
            "CASUAL_CHAT" => ConversationState::CasualChat,
            "LEARNING_SUPPORT" => ConversationState::LearningSupport,
            "SCREENING_CHECK" => ConversationState::ScreeningCheck,
            "END_SESSION" => ConversationState::EndSession,
            _ => ConversationState::Start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Child,
    Guide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub role: MessageRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Bounded recent-message log, oldest evicted first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    capacity: usize,
    entries: VecDeque<LoggedMessage>,
}

impl MessageLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, role: MessageRole, text: &str, at: DateTime<Utc>) {
        self.entries.push_back(LoggedMessage {
            role,
            text: text.to_string(),
            at,
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> impl Iterator<Item = &LoggedMessage> {
        self.entries.iter().skip(self.entries.len().saturating_sub(count))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameProgress {
    pub experience: u32,
    pub level: u32,
    pub quests_completed: u32,
}

impl GameProgress {
    pub fn starting() -> Self {
        Self {
            experience: 0,
            level: 1,
            quests_completed: 0,
        }
    }

    /// Add experience and level up while it covers `level * 100`. Returns levels gained.
    pub fn add_experience(&mut self, points: u32) -> u32 {
        self.experience = self.experience.saturating_add(points);
        let mut gained = 0;
        while self.level > 0 && self.experience >= self.level * 100 {
            self.experience -= self.level * 100;
            self.level += 1;
            gained += 1;
        }
        gained
    }
}

/// Everything the engine knows about one child. Owned by that child's actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub name: Option<String>,
    pub age: Option<u32>,
    pub guardian_linked: bool,
    pub state: ConversationState,
    pub latest_emotion: Option<EmotionalReading>,
    pub emotions: EmotionHistory,
    pub profile: LearningProfile,
    pub screening: ScreeningMetrics,
    pub location: Option<String>,
    pub active_quest_id: Option<String>,
    pub quest_step: usize,
    pub quest_progress: Option<QuestProgress>,
    pub message_log: MessageLog,
    pub turn_count: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub progress: GameProgress,
    pub location_progress: BTreeMap<String, i32>,
    pub invalid_streak: u32,
    pub pending_reminders: Vec<String>,
}

impl Session {
    pub fn new(user_id: &str, now: DateTime<Utc>, config: &EngineConfig) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: None,
            age: None,
            guardian_linked: false,
            state: ConversationState::Start,
            latest_emotion: None,
            emotions: EmotionHistory::with_capacity(config.emotion.history_capacity),
            profile: LearningProfile::with_history_capacity(
                config.session.profile_history_capacity,
            ),
            screening: ScreeningMetrics::default(),
            location: None,
            active_quest_id: None,
            quest_step: 0,
            quest_progress: None,
            message_log: MessageLog::with_capacity(config.session.message_log_capacity),
            turn_count: 0,
            started_at: now,
            last_activity: now,
            progress: GameProgress::starting(),
            location_progress: BTreeMap::new(),
            invalid_streak: 0,
            pending_reminders: Vec::new(),
        }
    }

    pub fn clear_quest(&mut self) {
        self.active_quest_id = None;
        self.quest_step = 0;
        self.quest_progress = None;
        self.invalid_streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_round_trip_through_db_strings() {
        for state in [
            ConversationState::Start,
            ConversationState::ParentLinking,
            ConversationState::QuestActive,
            ConversationState::EndSession,
        ] {
            assert_eq!(ConversationState::from_db(state.as_db_str()), state);
        }
        assert_eq!(ConversationState::from_db("garbage"), ConversationState::Start);
    }

    #[test]
    fn level_up_carries_leftover_experience() {
        let mut progress = GameProgress::starting();
        assert_eq!(progress.add_experience(90), 0);
        assert_eq!(progress.add_experience(40), 1);
        assert_eq!(progress.level, 2);
        assert_eq!(progress.experience, 30);

        assert_eq!(progress.add_experience(500), 2);
        assert_eq!(progress.level, 4);
        assert_eq!(progress.experience, 30);
    }

    #[test]
    fn message_log_keeps_the_newest_entries() {
        let now = Utc::now();
        let mut log = MessageLog::with_capacity(2);
        log.push(MessageRole::Child, "a", now);
        log.push(MessageRole::Guide, "b", now);
        log.push(MessageRole::Child, "c", now);

        let texts: Vec<_> = log.recent(10).map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(log.recent(1).count(), 1);
    }
}
