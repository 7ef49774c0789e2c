use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::bridge::BridgePolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_history_messages")]
    pub history_messages: usize,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_history_messages() -> usize {
    10
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: default_llm_url(),
            model: default_llm_model(),
            api_key: None,
            history_messages: default_history_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionConfig {
    #[serde(default = "default_emotion_history")]
    pub history_capacity: usize,
    #[serde(default = "default_volatility_window_minutes")]
    pub volatility_window_minutes: i64,
    #[serde(default = "default_storm_run")]
    pub storm_run: usize,
    #[serde(default = "default_dominant_window")]
    pub dominant_window: usize,
}

fn default_emotion_history() -> usize {
    50
}

fn default_volatility_window_minutes() -> i64 {
    60
}

fn default_storm_run() -> usize {
    3
}

fn default_dominant_window() -> usize {
    10
}

impl Default for EmotionConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_emotion_history(),
            volatility_window_minutes: default_volatility_window_minutes(),
            storm_run: default_storm_run(),
            dominant_window: default_dominant_window(),
        }
    }
}

/// Per-tier thresholds. A tier is crossed when any one of its values is crossed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierThresholds {
    pub self_worth: f64,
    pub self_criticism: f64,
    pub emotional_volatility: f64,
    pub manipulation_score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriticalThresholds {
    #[serde(default = "default_self_harm_phrases")]
    pub self_harm_phrases: Vec<String>,
    #[serde(default = "default_storm_window_minutes")]
    pub storm_window_minutes: i64,
    #[serde(default = "default_support_storm_count")]
    pub support_storm_count: u32,
}

fn default_self_harm_phrases() -> Vec<String> {
    ["навредить себе", "умереть", "покончить", "не хочу жить"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_storm_window_minutes() -> i64 {
    60
}

fn default_support_storm_count() -> u32 {
    5
}

impl Default for CriticalThresholds {
    fn default() -> Self {
        Self {
            self_harm_phrases: default_self_harm_phrases(),
            storm_window_minutes: default_storm_window_minutes(),
            support_storm_count: default_support_storm_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScreeningThresholds {
    #[serde(default = "default_mild")]
    pub mild: TierThresholds,
    #[serde(default = "default_moderate")]
    pub moderate: TierThresholds,
    #[serde(default = "default_high")]
    pub high: TierThresholds,
    #[serde(default)]
    pub critical: CriticalThresholds,
}

fn default_mild() -> TierThresholds {
    TierThresholds {
        self_worth: 0.4,
        self_criticism: 0.6,
        emotional_volatility: 0.5,
        manipulation_score: 5,
    }
}

fn default_moderate() -> TierThresholds {
    TierThresholds {
        self_worth: 0.35,
        self_criticism: 0.65,
        emotional_volatility: 0.6,
        manipulation_score: 7,
    }
}

fn default_high() -> TierThresholds {
    TierThresholds {
        self_worth: 0.3,
        self_criticism: 0.7,
        emotional_volatility: 0.7,
        manipulation_score: 10,
    }
}

impl Default for ScreeningThresholds {
    fn default() -> Self {
        Self {
            mild: default_mild(),
            moderate: default_moderate(),
            high: default_high(),
            critical: CriticalThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningConfig {
    #[serde(default = "default_screening_step")]
    pub step: f64,
    #[serde(default = "default_self_deprecation_phrases")]
    pub self_deprecation_phrases: Vec<String>,
    #[serde(default)]
    pub thresholds: ScreeningThresholds,
}

fn default_screening_step() -> f64 {
    0.05
}

fn default_self_deprecation_phrases() -> Vec<String> {
    ["тупой", "тупая", "идиот", "ничего не умею", "не получается"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            step: default_screening_step(),
            self_deprecation_phrases: default_self_deprecation_phrases(),
            thresholds: ScreeningThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_onboarding_turns")]
    pub onboarding_turns: u64,
    #[serde(default = "default_message_log_capacity")]
    pub message_log_capacity: usize,
    #[serde(default = "default_profile_history_capacity")]
    pub profile_history_capacity: usize,
    #[serde(default = "default_stuck_after_failures")]
    pub stuck_after_failures: u32,
    #[serde(default = "default_recommended_modules")]
    pub recommended_modules: usize,
    /// A session actor with nothing to do for this long is stopped; the next message reloads it.
    #[serde(default = "default_actor_idle_minutes")]
    pub actor_idle_minutes: u64,
}

fn default_onboarding_turns() -> u64 {
    5
}

fn default_message_log_capacity() -> usize {
    50
}

fn default_profile_history_capacity() -> usize {
    200
}

fn default_stuck_after_failures() -> u32 {
    3
}

fn default_recommended_modules() -> usize {
    3
}

fn default_actor_idle_minutes() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            onboarding_turns: default_onboarding_turns(),
            message_log_capacity: default_message_log_capacity(),
            profile_history_capacity: default_profile_history_capacity(),
            stuck_after_failures: default_stuck_after_failures(),
            recommended_modules: default_recommended_modules(),
            actor_idle_minutes: default_actor_idle_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_quests_dir")]
    pub quests_dir: String,

    #[serde(default)]
    pub bridge_policy: BridgePolicy,

    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub emotion: EmotionConfig,
    #[serde(default)]
    pub screening: ScreeningConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_database_path() -> String {
    "innerworld.db".to_string()
}

fn default_quests_dir() -> String {
    "quests".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            quests_dir: default_quests_dir(),
            bridge_policy: BridgePolicy::default(),
            completion: CompletionConfig::default(),
            emotion: EmotionConfig::default(),
            screening: ScreeningConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `INNERWORLD_CONFIG` if set, otherwise `innerworld_config.toml` next to the executable.
    pub fn config_path() -> PathBuf {
        match env::var("INNERWORLD_CONFIG") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => Self::get_base_dir().join("innerworld_config.toml"),
        }
    }

    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match Self::from_toml(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str::<EngineConfig>(contents).context("Failed to parse engine config")
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = env::var("INNERWORLD_DB_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(dir) = env::var("INNERWORLD_QUESTS_DIR") {
            if !dir.trim().is_empty() {
                config.quests_dir = dir;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.completion.api_url = url;
            config.completion.enabled = true;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.completion.model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.completion.api_key = Some(key);
        }

        if let Ok(enabled) = env::var("INNERWORLD_ENABLE_COMPLETION") {
            config.completion.enabled = env_flag(&enabled);
        }

        if let Ok(policy) = env::var("INNERWORLD_BRIDGE_POLICY") {
            match BridgePolicy::parse(&policy) {
                Some(policy) => config.bridge_policy = policy,
                None => tracing::warn!("Ignoring unknown bridge policy {:?}", policy),
            }
        }

        if let Ok(turns) = env::var("INNERWORLD_ONBOARDING_TURNS") {
            if let Ok(turns) = turns.parse() {
                config.session.onboarding_turns = turns;
            }
        }

        config
    }
}

fn env_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml("").expect("parse");
        assert_eq!(config.emotion.history_capacity, 50);
        assert_eq!(config.session.onboarding_turns, 5);
        assert_eq!(config.bridge_policy, BridgePolicy::Overwrite);
        assert_eq!(config.screening.thresholds.moderate.self_worth, 0.35);
        assert!(config
            .screening
            .thresholds
            .critical
            .self_harm_phrases
            .iter()
            .any(|p| p == "не хочу жить"));
    }

    #[test]
    fn threshold_table_is_overridable_per_tier() {
        let config = EngineConfig::from_toml(
            r#"
            bridge_policy = "reject"

            [screening.thresholds.moderate]
            self_worth = 0.2
            self_criticism = 0.9
            emotional_volatility = 0.9
            manipulation_score = 9

            [screening.thresholds.critical]
            self_harm_phrases = ["phrase"]
            "#,
        )
        .expect("parse");

        assert_eq!(config.bridge_policy, BridgePolicy::Reject);
        assert_eq!(config.screening.thresholds.moderate.self_worth, 0.2);
        assert_eq!(config.screening.thresholds.mild.self_worth, 0.4);
        assert_eq!(
            config.screening.thresholds.critical.self_harm_phrases,
            vec!["phrase".to_string()]
        );
        assert_eq!(config.screening.thresholds.critical.support_storm_count, 5);
    }

    #[test]
    fn env_flag_accepts_common_truthy_spellings() {
        assert!(env_flag("1"));
        assert!(env_flag("TRUE"));
        assert!(env_flag("yes"));
        assert!(!env_flag("no"));
    }
}
