use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::profile::DifficultyTier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[serde(alias = "free_text")]
    InputText,
    #[serde(alias = "single_choice")]
    Choice,
    MultipleChoice,
    Reflection,
}

impl StepType {
    pub fn is_choice(self) -> bool {
        matches!(self, StepType::Choice | StepType::MultipleChoice)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepValidation {
    #[serde(default)]
    pub min_length: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_max_length() -> usize {
    1000
}

impl Default for StepValidation {
    fn default() -> Self {
        Self {
            min_length: 0,
            max_length: default_max_length(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOption {
    pub text: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestStep {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepType,
    pub prompt: String,
    #[serde(default)]
    pub validation: StepValidation,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub options: Vec<StepOption>,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl QuestStep {
    /// Prompt with numbered options, as shown to the child.
    pub fn render(&self) -> String {
        let mut text = self.prompt.trim_end().to_string();
        for (index, option) in self.options.iter().enumerate() {
            text.push_str(&format!("\n{}. {}", index + 1, option.text));
        }
        text
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestRewards {
    #[serde(default)]
    pub experience_points: u32,
    /// Dimension name -> delta.
    #[serde(default)]
    pub learning_profile: BTreeMap<String, i32>,
    /// Location id -> progress delta.
    #[serde(default)]
    pub location_progress: BTreeMap<String, i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeVerification {
    #[serde(rename = "type", default = "default_verification_type")]
    pub kind: String,
    #[serde(default = "default_verification_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_verification_type() -> String {
    "self_report".to_string()
}

fn default_verification_prompt() -> String {
    "Получилось выполнить?".to_string()
}

impl Default for BridgeVerification {
    fn default() -> Self {
        Self {
            kind: default_verification_type(),
            prompt: default_verification_prompt(),
            options: Vec::new(),
        }
    }
}

/// Real-world follow-up task issued when the quest completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSpec {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default = "default_deadline_hours")]
    pub deadline_hours: i64,
    #[serde(default = "default_reminder_hours")]
    pub reminder_hours: i64,
    #[serde(default)]
    pub verification: BridgeVerification,
}

fn default_deadline_hours() -> i64 {
    48
}

fn default_reminder_hours() -> i64 {
    24
}

/// One year.
const MAX_BRIDGE_HOURS: i64 = 24 * 365;

impl BridgeSpec {
    /// The reminder must come before the deadline, and both within a year.
    pub fn validate(&self) -> Result<()> {
        if self.reminder_hours <= 0
            || self.reminder_hours >= self.deadline_hours
            || self.deadline_hours > MAX_BRIDGE_HOURS
        {
            anyhow::bail!(
                "Bridge {} needs 0 < reminder_hours ({}) < deadline_hours ({}) <= {}",
                self.id,
                self.reminder_hours,
                self.deadline_hours,
                MAX_BRIDGE_HOURS
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestInsight {
    #[serde(default)]
    pub technique: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestDefinition {
    pub id: String,
    pub title: String,
    pub location: String,
    #[serde(alias = "psychological_module", default)]
    pub module: String,
    pub difficulty: DifficultyTier,
    #[serde(default)]
    pub estimated_time_minutes: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<QuestStep>,
    #[serde(default)]
    pub completion_message: String,
    #[serde(default)]
    pub rewards: QuestRewards,
    #[serde(default)]
    pub reality_bridge: Option<BridgeSpec>,
    #[serde(default, alias = "psychological_insights")]
    pub insights: Vec<QuestInsight>,
}

impl QuestDefinition {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let quest: QuestDefinition =
            serde_yaml::from_str(contents).context("Failed to parse quest YAML")?;
        if quest.id.trim().is_empty() {
            anyhow::bail!("Quest id is empty");
        }
        if let Some(bridge) = &quest.reality_bridge {
            bridge
                .validate()
                .with_context(|| format!("Quest {} has an invalid reality bridge", quest.id))?;
        }
        Ok(quest)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read quest file {:?}", path))?;
        Self::from_yaml(&contents).with_context(|| format!("Invalid quest file {:?}", path))
    }
}
