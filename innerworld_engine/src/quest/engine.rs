use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use thiserror::Error;

use super::definition::{BridgeSpec, QuestDefinition, QuestRewards, QuestStep, StepType};
use crate::clock::Clock;
use crate::profile::DifficultyTier;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QuestError {
    #[error("No active quest")]
    NoActiveQuest,
    #[error("Quest not found: {0}")]
    QuestNotFound(String),
    #[error("Quest has no steps: {0}")]
    EmptyQuest(String),
    #[error("Quest already complete")]
    AlreadyComplete,
    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StepResponse {
    Text(String),
    Choice(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestProgress {
    pub quest_id: String,
    pub current_step: usize,
    pub responses: BTreeMap<String, StepResponse>,
    pub scores: BTreeMap<String, f64>,
    pub total_score: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QuestProgress {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Advanced {
        next_step: QuestStep,
        feedback: Option<String>,
    },
    Completed {
        completion_message: String,
        total_score: f64,
    },
}

const PROGRESS_SHARDS: usize = 16;

type ProgressShard = HashMap<String, QuestProgress>;

/// Quest catalog plus one live progress record per user. Progress is sharded by user id so
/// users rarely contend on the same lock.
pub struct QuestEngine {
    quests_dir: PathBuf,
    clock: Arc<dyn Clock>,
    catalog: RwLock<HashMap<String, Arc<QuestDefinition>>>,
    progress: Vec<Mutex<ProgressShard>>,
}

impl QuestEngine {
    pub fn new(quests_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            quests_dir: quests_dir.into(),
            clock,
            catalog: RwLock::new(HashMap::new()),
            progress: (0..PROGRESS_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn read_catalog(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<QuestDefinition>>> {
        match self.catalog.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_progress(&self, user_id: &str) -> MutexGuard<'_, ProgressShard> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let shard = &self.progress[(hasher.finish() as usize) % self.progress.len()];
        match shard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Load every `*.yaml`/`*.yml` under the quests directory into the catalog.
    /// A file that fails to parse is logged and skipped.
    pub fn load_all(&self) -> usize {
        let loaded = scan_dir(&self.quests_dir);
        let count = loaded.len();
        let mut catalog = match self.catalog.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for quest in loaded {
            catalog.insert(quest.id.clone(), Arc::new(quest));
        }
        tracing::info!("Loaded {} quests from {:?}", count, self.quests_dir);
        count
    }

    /// Rescan the quests directory and swap the catalog wholesale.
    pub fn reload(&self) -> usize {
        let fresh: HashMap<String, Arc<QuestDefinition>> = scan_dir(&self.quests_dir)
            .into_iter()
            .map(|quest| (quest.id.clone(), Arc::new(quest)))
            .collect();
        let count = fresh.len();
        match self.catalog.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        tracing::info!("Reloaded quest catalog: {} quests", count);
        count
    }

    pub fn insert(&self, quest: QuestDefinition) {
        let mut catalog = match self.catalog.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        catalog.insert(quest.id.clone(), Arc::new(quest));
    }

    pub fn len(&self) -> usize {
        self.read_catalog().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_catalog().is_empty()
    }

    pub fn get(&self, quest_id: &str) -> Option<Arc<QuestDefinition>> {
        self.read_catalog().get(quest_id).cloned()
    }

    pub fn by_location(&self, location: &str) -> Vec<Arc<QuestDefinition>> {
        let mut quests: Vec<_> = self
            .read_catalog()
            .values()
            .filter(|quest| quest.location == location)
            .cloned()
            .collect();
        quests.sort_by(|a, b| a.id.cmp(&b.id));
        quests
    }

    pub fn by_difficulty(&self, difficulty: DifficultyTier) -> Vec<Arc<QuestDefinition>> {
        let mut quests: Vec<_> = self
            .read_catalog()
            .values()
            .filter(|quest| quest.difficulty == difficulty)
            .cloned()
            .collect();
        quests.sort_by(|a, b| a.id.cmp(&b.id));
        quests
    }

    /// First quest at `location`, preferring the given difficulty.
    pub fn first_for_location(
        &self,
        location: &str,
        preferred: DifficultyTier,
    ) -> Option<Arc<QuestDefinition>> {
        let quests = self.by_location(location);
        quests
            .iter()
            .find(|quest| quest.difficulty == preferred)
            .or_else(|| quests.first())
            .cloned()
    }

    /// Start `quest_id` for `user_id` and return its first step. Any live progress is replaced.
    pub fn start(&self, user_id: &str, quest_id: &str) -> Result<QuestStep, QuestError> {
        let quest = self
            .get(quest_id)
            .ok_or_else(|| QuestError::QuestNotFound(quest_id.to_string()))?;
        let first = quest
            .steps
            .first()
            .cloned()
            .ok_or_else(|| QuestError::EmptyQuest(quest_id.to_string()))?;

        let progress = QuestProgress {
            quest_id: quest_id.to_string(),
            current_step: 0,
            responses: BTreeMap::new(),
            scores: BTreeMap::new(),
            total_score: 0.0,
            started_at: self.clock.now(),
            completed_at: None,
        };

        if let Some(previous) = self.lock_progress(user_id).insert(user_id.to_string(), progress) {
            if !previous.is_completed() {
                tracing::warn!(
                    "User {} abandoned quest {} at step {} by starting {}",
                    user_id,
                    previous.quest_id,
                    previous.current_step,
                    quest_id
                );
            }
        }

        tracing::info!("Quest {} started for user {}", quest_id, user_id);
        Ok(first)
    }

    pub fn current_step(&self, user_id: &str) -> Option<QuestStep> {
        let progress = self.lock_progress(user_id).get(user_id).cloned()?;
        let quest = self.get(&progress.quest_id)?;
        quest.steps.get(progress.current_step).cloned()
    }

    pub fn submit(&self, user_id: &str, response: StepResponse) -> Result<StepOutcome, QuestError> {
        let mut all_progress = self.lock_progress(user_id);
        let progress = all_progress
            .get_mut(user_id)
            .ok_or(QuestError::NoActiveQuest)?;
        let quest = self
            .get(&progress.quest_id)
            .ok_or_else(|| QuestError::QuestNotFound(progress.quest_id.clone()))?;

        let step = quest
            .steps
            .get(progress.current_step)
            .ok_or(QuestError::AlreadyComplete)?;

        validate(step, &response)?;

        let score = score_for(step, &response);
        progress.responses.insert(step.id.clone(), response.clone());
        progress.scores.insert(step.id.clone(), score);
        progress.total_score += score;
        progress.current_step += 1;

        if progress.current_step >= quest.steps.len() {
            progress.completed_at = Some(self.clock.now());
            tracing::info!(
                "Quest {} completed by user {} (score {:.2})",
                quest.id,
                user_id,
                progress.total_score
            );
            return Ok(StepOutcome::Completed {
                completion_message: quest.completion_message.clone(),
                total_score: progress.total_score,
            });
        }

        let next_step = quest.steps[progress.current_step].clone();
        Ok(StepOutcome::Advanced {
            next_step,
            feedback: feedback_for(step, &response),
        })
    }

    fn completed_quest(&self, user_id: &str) -> Option<Arc<QuestDefinition>> {
        let quest_id = {
            let progress = self.lock_progress(user_id);
            let entry = progress.get(user_id)?;
            if !entry.is_completed() {
                return None;
            }
            entry.quest_id.clone()
        };
        self.get(&quest_id)
    }

    pub fn rewards_for(&self, user_id: &str) -> Option<QuestRewards> {
        self.completed_quest(user_id).map(|quest| quest.rewards.clone())
    }

    pub fn bridge_for(&self, user_id: &str) -> Option<BridgeSpec> {
        self.completed_quest(user_id)
            .and_then(|quest| quest.reality_bridge.clone())
    }

    pub fn progress(&self, user_id: &str) -> Option<QuestProgress> {
        self.lock_progress(user_id).get(user_id).cloned()
    }

    /// Put back a persisted progress record, e.g. when a session is reloaded.
    pub fn restore(&self, user_id: &str, progress: QuestProgress) {
        self.lock_progress(user_id).insert(user_id.to_string(), progress);
    }

    pub fn clear(&self, user_id: &str) -> Option<QuestProgress> {
        let removed = self.lock_progress(user_id).remove(user_id);
        if removed.is_some() {
            tracing::debug!("Cleared quest progress for user {}", user_id);
        }
        removed
    }
}

fn validate(step: &QuestStep, response: &StepResponse) -> Result<(), QuestError> {
    match step.kind {
        StepType::InputText => {
            let StepResponse::Text(text) = response else {
                return Err(QuestError::Validation("Ответ должен быть текстом".to_string()));
            };
            let length = text.chars().count();
            if length < step.validation.min_length {
                return Err(QuestError::Validation(format!(
                    "Ответ слишком короткий (минимум {} символов)",
                    step.validation.min_length
                )));
            }
            if length > step.validation.max_length {
                return Err(QuestError::Validation(format!(
                    "Ответ слишком длинный (максимум {} символов)",
                    step.validation.max_length
                )));
            }
            Ok(())
        }
        StepType::Choice | StepType::MultipleChoice => {
            let StepResponse::Choice(index) = response else {
                return Err(QuestError::Validation("Выбери один из вариантов".to_string()));
            };
            if *index < 0 || *index as usize >= step.options.len() {
                return Err(QuestError::Validation("Неверный номер варианта".to_string()));
            }
            Ok(())
        }
        StepType::Reflection => Ok(()),
    }
}

fn chosen_option<'a>(
    step: &'a QuestStep,
    response: &StepResponse,
) -> Option<&'a super::definition::StepOption> {
    if !step.kind.is_choice() {
        return None;
    }
    match response {
        StepResponse::Choice(index) if *index >= 0 => step.options.get(*index as usize),
        _ => None,
    }
}

fn score_for(step: &QuestStep, response: &StepResponse) -> f64 {
    chosen_option(step, response).map_or(0.0, |option| option.score)
}

fn feedback_for(step: &QuestStep, response: &StepResponse) -> Option<String> {
    chosen_option(step, response)
        .and_then(|option| option.feedback.clone())
        .or_else(|| step.feedback.clone())
}

fn collect_quest_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read quests directory {:?}: {}", dir, e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_quest_files(&path, out);
        } else if matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        ) {
            out.push(path);
        }
    }
}

fn scan_dir(dir: &Path) -> Vec<QuestDefinition> {
    let mut files = Vec::new();
    collect_quest_files(dir, &mut files);
    files.sort();

    let mut quests = Vec::new();
    for file in files {
        match QuestDefinition::load_file(&file) {
            Ok(quest) => {
                tracing::debug!(
                    "Loaded quest {} ({} steps) from {:?}",
                    quest.id,
                    quest.steps.len(),
                    file
                );
                quests.push(quest);
            }
            Err(e) => tracing::error!("Skipping quest file {:?}: {:#}", file, e),
        }
    }
    quests
}
