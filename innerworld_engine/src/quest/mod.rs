pub mod definition;
pub mod engine;

pub use definition::{
    BridgeSpec, BridgeVerification, QuestDefinition, QuestInsight, QuestRewards, QuestStep,
    StepOption, StepType, StepValidation,
};
pub use engine::{QuestEngine, QuestError, QuestProgress, StepOutcome, StepResponse};
