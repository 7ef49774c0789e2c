pub mod bridge;
pub mod clock;
pub mod completion;
pub mod config;
pub mod database;
pub mod emotion;
pub mod orchestrator;
pub mod profile;
pub mod quest;
pub mod screening;
pub mod session;
pub mod store;

pub use bridge::{ActiveBridge, BridgeError, BridgePolicy, ReminderSink};
pub use config::EngineConfig;
pub use orchestrator::{EngineEvent, Orchestrator, TurnReply};
pub use session::{ConversationState, Session};
