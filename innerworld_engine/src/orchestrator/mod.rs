//! Session orchestration. Every user gets a single-writer actor fed by a flume mailbox, so
//! chat turns, reminder events, bridge confirmations and guardian-link updates for one user
//! never run concurrently. Different users share nothing but the catalog and the stores.

mod handlers;
pub mod intent;

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::bridge::{ActiveBridge, BridgeError, BridgeScheduler, ReminderDue, ReminderSink};
use crate::clock::{Clock, SystemClock};
use crate::completion::{self, CompletionService};
use crate::config::EngineConfig;
use crate::database::SqliteStore;
use crate::emotion;
use crate::quest::QuestEngine;
use crate::screening::RiskTier;
use crate::session::{ConversationState, MessageRole, Session};
use crate::store::{BridgeStore, SessionStore};

/// Notable things that happened inside the engine, for the transport or a guardian dashboard.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SafetyEscalation { user_id: String, risk: RiskTier },
    QuestCompleted {
        user_id: String,
        quest_id: String,
        total_score: f64,
    },
    ReminderDelivered { user_id: String, bridge_id: String },
    StormDetected { user_id: String, storm_count: u32 },
}

/// Result of one chat turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub text: String,
    pub state: ConversationState,
    /// Set when the session could not be saved. The in-memory session is kept; see
    /// [`Orchestrator::flush`].
    pub persist_error: Option<String>,
}

enum UserCommand {
    Message {
        text: String,
        reply: oneshot::Sender<TurnReply>,
    },
    ReminderDue(ReminderDue),
    CompleteBridge {
        response: String,
        reply: oneshot::Sender<Result<ActiveBridge, BridgeError>>,
    },
    LinkGuardian {
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Session>,
    },
}

/// Shared collaborators every actor and handler works with.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    sessions: Arc<dyn SessionStore>,
    pub(crate) quests: QuestEngine,
    pub(crate) bridges: BridgeScheduler,
    pub(crate) completion: Arc<dyn CompletionService>,
    sink: Arc<dyn ReminderSink>,
    events: flume::Sender<EngineEvent>,
}

impl EngineCore {
    pub(crate) fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Engine event dropped, no listener");
        }
    }
}

/// A live actor's inbox. The generation tells a stopping actor whether the entry is still its own.
struct Mailbox {
    generation: u64,
    tx: flume::Sender<UserCommand>,
}

type Mailboxes = Mutex<HashMap<String, Mailbox>>;

pub struct Orchestrator {
    core: Arc<EngineCore>,
    mailboxes: Arc<Mailboxes>,
    next_generation: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Wire the engine together, load the quest catalog and re-arm persisted reminders.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        sessions: Arc<dyn SessionStore>,
        bridge_store: Arc<dyn BridgeStore>,
        clock: Arc<dyn Clock>,
        completion: Arc<dyn CompletionService>,
        sink: Arc<dyn ReminderSink>,
    ) -> Result<(Arc<Self>, flume::Receiver<EngineEvent>)> {
        let quests = QuestEngine::new(config.quests_dir.clone(), clock.clone());
        if quests.load_all() == 0 {
            tracing::warn!("No quests found in {}", config.quests_dir);
        }

        let (bridges, due_rx) = BridgeScheduler::new(bridge_store, clock.clone(), config.bridge_policy);
        let (events_tx, events_rx) = flume::unbounded();

        let orchestrator = Arc::new(Self {
            core: Arc::new(EngineCore {
                config,
                clock,
                sessions,
                quests,
                bridges,
                completion,
                sink,
                events: events_tx,
            }),
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        });

        let handle = tokio::spawn(dispatch_reminders(Arc::downgrade(&orchestrator), due_rx));
        *lock(&orchestrator.dispatcher) = Some(handle);

        orchestrator
            .core
            .bridges
            .restore_on_startup()
            .context("Failed to restore bridge reminders")?;

        Ok((orchestrator, events_rx))
    }

    /// Production wiring: SQLite store, configured completion service, system clock.
    pub fn bootstrap(
        config: EngineConfig,
        sink: Arc<dyn ReminderSink>,
    ) -> Result<(Arc<Self>, flume::Receiver<EngineEvent>)> {
        let store = Arc::new(SqliteStore::new(&config.database_path)?);
        let completion = completion::from_config(&config.completion);
        Self::new(
            config,
            store.clone(),
            store,
            Arc::new(SystemClock),
            completion,
            sink,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn quests(&self) -> &QuestEngine {
        &self.core.quests
    }

    /// Queue a command for the user's actor, starting one if needed. Sends happen under the
    /// mailbox lock, the same lock an idle actor takes before it stops.
    fn send(&self, user_id: &str, command: UserCommand) {
        let mut mailboxes = lock(&self.mailboxes);
        let command = match mailboxes.get(user_id) {
            Some(mailbox) => match mailbox.tx.send(command) {
                Ok(()) => return,
                Err(flume::SendError(command)) => {
                    tracing::warn!("Session actor for user {} stopped, restarting", user_id);
                    command
                }
            },
            None => command,
        };

        let generation = self.next_generation.fetch_add(1, AtomicOrdering::Relaxed);
        let (tx, rx) = flume::unbounded();
        // rx is alive, so this cannot fail
        let _ = tx.send(command);
        tokio::spawn(run_actor(
            self.core.clone(),
            user_id.to_string(),
            generation,
            rx,
            Arc::downgrade(&self.mailboxes),
        ));
        mailboxes.insert(user_id.to_string(), Mailbox { generation, tx });
    }

    async fn request<T>(
        &self,
        user_id: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> UserCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(user_id, build(tx));
        rx.await
            .map_err(|_| anyhow!("Session actor for user {} dropped the request", user_id))
    }

    /// Number of session actors currently in memory.
    pub fn live_sessions(&self) -> usize {
        lock(&self.mailboxes).len()
    }

    /// The sole chat entry point: handle one inbound message and return the reply.
    pub async fn process_message(&self, user_id: &str, text: &str) -> Result<TurnReply> {
        let text = text.to_string();
        self.request(user_id, |reply| UserCommand::Message { text, reply })
            .await
    }

    /// Confirm the user's oldest open bridge outside of chat.
    pub async fn complete_bridge(
        &self,
        user_id: &str,
        response: &str,
    ) -> Result<ActiveBridge, BridgeError> {
        let response = response.to_string();
        self.request(user_id, |reply| UserCommand::CompleteBridge { response, reply })
            .await?
    }

    /// Record that a guardian accepted the link invitation.
    pub async fn link_guardian(&self, user_id: &str) -> Result<()> {
        self.request(user_id, |reply| UserCommand::LinkGuardian { reply })
            .await?
    }

    /// Save the in-memory session again, e.g. after a failed turn save.
    pub async fn flush(&self, user_id: &str) -> Result<()> {
        self.request(user_id, |reply| UserCommand::Flush { reply })
            .await?
    }

    /// A copy of the user's current in-memory session.
    pub async fn session(&self, user_id: &str) -> Result<Session> {
        self.request(user_id, |reply| UserCommand::Snapshot { reply })
            .await
    }

    pub fn check_deadlines(&self) -> Result<Vec<ActiveBridge>> {
        self.core.bridges.check_deadlines()
    }

    pub fn reload_quests(&self) -> usize {
        self.core.quests.reload()
    }

    /// Stop reminder timers and session actors. Queued commands are dropped.
    pub fn shutdown(&self) {
        self.core.bridges.shutdown();
        if let Some(handle) = lock(&self.dispatcher).take() {
            handle.abort();
        }
        let stopped = {
            let mut mailboxes = lock(&self.mailboxes);
            let count = mailboxes.len();
            mailboxes.clear();
            count
        };
        tracing::info!("Orchestrator shut down ({} session actors)", stopped);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Route due reminders into the owning user's mailbox.
async fn dispatch_reminders(orchestrator: Weak<Orchestrator>, due_rx: flume::Receiver<ReminderDue>) {
    while let Ok(due) = due_rx.recv_async().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        let user_id = due.user_id.clone();
        orchestrator.send(&user_id, UserCommand::ReminderDue(due));
    }
    tracing::debug!("Reminder dispatcher stopped");
}

async fn run_actor(
    core: Arc<EngineCore>,
    user_id: String,
    generation: u64,
    rx: flume::Receiver<UserCommand>,
    mailboxes: Weak<Mailboxes>,
) {
    let idle = Duration::from_secs(core.config.session.actor_idle_minutes.saturating_mul(60));
    let mut actor = UserActor::load(core, &user_id);
    loop {
        match tokio::time::timeout(idle, rx.recv_async()).await {
            Ok(Ok(command)) => actor.handle(command).await,
            Ok(Err(_)) => break,
            // unsaved changes keep the actor alive until a flush succeeds
            Err(_) if actor.dirty => {}
            Err(_) => {
                if stop_if_idle(&mailboxes, &user_id, generation, &rx) {
                    actor.unload();
                    break;
                }
            }
        }
    }
    tracing::debug!("Session actor for user {} stopped", user_id);
}

/// Drop the actor's mailbox entry unless a command is waiting. Returns whether to stop.
fn stop_if_idle(
    mailboxes: &Weak<Mailboxes>,
    user_id: &str,
    generation: u64,
    rx: &flume::Receiver<UserCommand>,
) -> bool {
    let Some(mailboxes) = mailboxes.upgrade() else {
        return true;
    };
    let mut mailboxes = lock(&mailboxes);
    if !rx.is_empty() {
        return false;
    }
    if mailboxes
        .get(user_id)
        .is_some_and(|mailbox| mailbox.generation == generation)
    {
        mailboxes.remove(user_id);
    }
    true
}

struct UserActor {
    core: Arc<EngineCore>,
    session: Session,
    /// Whether the store already holds a record for this user.
    persisted: bool,
    /// The last save failed.
    dirty: bool,
}

impl UserActor {
    fn load(core: Arc<EngineCore>, user_id: &str) -> Self {
        let now = core.clock.now();
        let (session, persisted) = match core.sessions.get(user_id) {
            Ok(Some(session)) => {
                if let Some(progress) = &session.quest_progress {
                    core.quests.restore(user_id, progress.clone());
                }
                tracing::debug!(
                    "Loaded session for user {} in state {}",
                    user_id,
                    session.state.as_db_str()
                );
                (session, true)
            }
            Ok(None) => {
                tracing::info!("New session for user {}", user_id);
                (Session::new(user_id, now, &core.config), false)
            }
            Err(e) => {
                tracing::error!("Failed to load session for user {}: {:#}", user_id, e);
                (Session::new(user_id, now, &core.config), false)
            }
        };
        Self {
            core,
            session,
            persisted,
            dirty: false,
        }
    }

    fn save(&mut self) -> Result<()> {
        let result = if self.persisted {
            self.core.sessions.update(&self.session)
        } else {
            let created = self.core.sessions.create(&self.session);
            self.persisted = created.is_ok();
            created
        };
        self.dirty = result.is_err();
        result
    }

    /// Release what the actor holds outside its session. Quest progress is restored from the
    /// session on the next load.
    fn unload(&self) {
        self.core.quests.clear(&self.session.user_id);
        tracing::debug!("Session actor for user {} idle, unloading", self.session.user_id);
    }

    fn save_logged(&mut self) {
        if let Err(e) = self.save() {
            tracing::error!(
                "Failed to save session for user {}: {:#}",
                self.session.user_id,
                e
            );
        }
    }

    async fn handle(&mut self, command: UserCommand) {
        match command {
            UserCommand::Message { text, reply } => {
                let text = self.turn(&text).await;
                let persist_error = self.save().err().map(|e| {
                    tracing::error!(
                        "Failed to save session for user {}: {:#}",
                        self.session.user_id,
                        e
                    );
                    format!("{:#}", e)
                });
                let _ = reply.send(TurnReply {
                    text,
                    state: self.session.state,
                    persist_error,
                });
            }
            UserCommand::ReminderDue(due) => self.deliver_reminder(due).await,
            UserCommand::CompleteBridge { response, reply } => {
                let result = self
                    .core
                    .bridges
                    .complete(&self.session.user_id, &response);
                if let Ok(bridge) = &result {
                    let core = self.core.clone();
                    handlers::apply_bridge_completion(&core, &mut self.session, bridge);
                    self.save_logged();
                }
                let _ = reply.send(result);
            }
            UserCommand::LinkGuardian { reply } => {
                self.session.guardian_linked = true;
                tracing::info!("Guardian linked for user {}", self.session.user_id);
                let _ = reply.send(self.save());
            }
            UserCommand::Flush { reply } => {
                let _ = reply.send(self.save());
            }
            UserCommand::Snapshot { reply } => {
                let _ = reply.send(self.session.clone());
            }
        }
    }

    async fn deliver_reminder(&mut self, due: ReminderDue) {
        let core = self.core.clone();
        match core.bridges.fire(&due, core.sink.as_ref()).await {
            Ok(Some(bridge)) => {
                self.session.pending_reminders.push(format!(
                    "⏰ Напоминание: {}. {}\nНапиши «сделал», когда получится!",
                    bridge.title, bridge.description
                ));
                core.emit(EngineEvent::ReminderDelivered {
                    user_id: bridge.user_id.clone(),
                    bridge_id: bridge.bridge_id.clone(),
                });
                self.save_logged();
            }
            Ok(None) => {}
            Err(e) => tracing::error!(
                "Failed to fire reminder {} for user {}: {:#}",
                due.bridge_key,
                due.user_id,
                e
            ),
        }
    }

    async fn turn(&mut self, text: &str) -> String {
        let core = self.core.clone();
        let now = core.clock.now();
        let session = &mut self.session;

        session.turn_count += 1;
        session.last_activity = now;
        session.message_log.push(MessageRole::Child, text, now);

        let storm_run = core.config.emotion.storm_run;
        let was_storm = session.emotions.storm(storm_run);
        let reading = emotion::classify(text, now);
        tracing::debug!(
            "User {} turn {}: {} ({:.1})",
            session.user_id,
            session.turn_count,
            reading.state.as_str(),
            reading.intensity
        );
        session.latest_emotion = Some(reading.clone());
        session.emotions.push(reading);

        let volatility = session
            .emotions
            .volatility(now, core.config.emotion.volatility_window_minutes);
        let latest = session.latest_emotion.as_ref().map(|reading| reading.state);
        let update = session.screening.update(
            &session.user_id,
            text,
            latest,
            volatility,
            now,
            &core.config.screening,
        );

        if !was_storm && session.emotions.storm(storm_run) {
            core.emit(EngineEvent::StormDetected {
                user_id: session.user_id.clone(),
                storm_count: session.screening.emotional_storm_count,
            });
        }
        let mut reply = if update.self_harm_phrase {
            core.emit(EngineEvent::SafetyEscalation {
                user_id: session.user_id.clone(),
                risk: RiskTier::Crisis,
            });
            if handlers::past_gates(&core, session) {
                session.state = ConversationState::ScreeningCheck;
                handlers::run_state_machine(&core, session, text).await
            } else {
                // safety reply only; linking and onboarding resume on the next message
                tracing::warn!(
                    "User {} has not finished linking or onboarding, staying in {}",
                    session.user_id,
                    session.state.as_db_str()
                );
                handlers::CRISIS_REPLY.to_string()
            }
        } else {
            handlers::run_state_machine(&core, session, text).await
        };

        if !session.pending_reminders.is_empty() {
            let notices = std::mem::take(&mut session.pending_reminders);
            reply = format!("{}\n\n{}", notices.join("\n\n"), reply);
        }

        session.message_log.push(MessageRole::Guide, &reply, core.clock.now());
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::completion::DisabledCompletion;
    use crate::profile::{DifficultyTier, LearningDimension};
    use crate::quest::{
        BridgeSpec, QuestDefinition, QuestRewards, QuestStep, StepOption, StepType, StepValidation,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReminderSink for RecordingSink {
        async fn on_reminder_due(&self, _user_id: &str, bridge: &ActiveBridge) -> Result<()> {
            self.delivered.lock().expect("lock").push(bridge.bridge_id.clone());
            Ok(())
        }
    }

    /// Session store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    impl SessionStore for FlakyStore {
        fn get(&self, user_id: &str) -> Result<Option<Session>> {
            self.inner.get(user_id)
        }

        fn create(&self, session: &Session) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.create(session)
        }

        fn update(&self, session: &Session) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("disk full");
            }
            self.inner.update(session)
        }

        fn delete(&self, user_id: &str) -> Result<bool> {
            self.inner.delete(user_id)
        }
    }

    fn breathing_quest() -> QuestDefinition {
        QuestDefinition {
            id: "tower_breath".into(),
            title: "Дыхание в башне".into(),
            location: "tower_confusion".into(),
            module: "15".into(),
            difficulty: DifficultyTier::Medium,
            estimated_time_minutes: 5,
            description: "Учимся успокаиваться".into(),
            steps: vec![
                QuestStep {
                    id: "feel".into(),
                    kind: StepType::Choice,
                    prompt: "Что ты чувствуешь перед контрольной?".into(),
                    validation: StepValidation::default(),
                    hint: Some("Выбери номер варианта".into()),
                    options: vec![
                        StepOption {
                            text: "Спокойствие".into(),
                            score: 0.2,
                            feedback: None,
                        },
                        StepOption {
                            text: "Тревогу".into(),
                            score: 1.0,
                            feedback: Some("Так бывает у многих".into()),
                        },
                    ],
                    feedback: None,
                },
                QuestStep {
                    id: "reflect".into(),
                    kind: StepType::Reflection,
                    prompt: "Что поможет тебе в следующий раз?".into(),
                    validation: StepValidation {
                        min_length: 5,
                        max_length: 500,
                    },
                    hint: None,
                    options: vec![],
                    feedback: None,
                },
            ],
            completion_message: "Ты научился замечать тревогу!".into(),
            rewards: QuestRewards {
                experience_points: 50,
                learning_profile: BTreeMap::from([("understanding_meaning".to_string(), 1)]),
                location_progress: BTreeMap::from([("tower_confusion".to_string(), 10)]),
            },
            reality_bridge: Some(BridgeSpec {
                id: "three_breaths".into(),
                title: "Три вдоха".into(),
                description: "Перед уроком сделай три медленных вдоха".into(),
                deadline_hours: 48,
                reminder_hours: 24,
                verification: Default::default(),
            }),
            insights: vec![],
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        events: flume::Receiver<EngineEvent>,
        sessions: Arc<FlakyStore>,
        clock: ManualClock,
        sink: Arc<RecordingSink>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            quests_dir: dir.path().join("quests").to_string_lossy().into_owned(),
            ..EngineConfig::default()
        };
        let sessions = Arc::new(FlakyStore::default());
        let bridges = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let sink = Arc::new(RecordingSink::default());

        let (orchestrator, events) = Orchestrator::new(
            config,
            sessions.clone(),
            bridges,
            Arc::new(clock.clone()),
            Arc::new(DisabledCompletion),
            sink.clone(),
        )
        .expect("orchestrator");
        orchestrator.quests().insert(breathing_quest());

        Harness {
            orchestrator,
            events,
            sessions,
            clock,
            sink,
            _dir: dir,
        }
    }

    /// A linked, named child waiting at the quest offer.
    fn offered_session(config: &EngineConfig, now: chrono::DateTime<Utc>) -> Session {
        let mut session = Session::new("kid", now, config);
        session.name = Some("Маша".into());
        session.guardian_linked = true;
        session.turn_count = 10;
        session.state = ConversationState::QuestActive;
        session.location = Some("tower_confusion".into());
        session.active_quest_id = Some("tower_breath".into());
        session
    }

    fn seed_at_quest_offer(h: &Harness) {
        let session = offered_session(h.orchestrator.config(), h.clock.now());
        h.sessions.create(&session).expect("seed");
    }

    /// Play the seeded quest to the end and return the bridge it issued.
    async fn finish_breathing_quest(h: &Harness) -> ActiveBridge {
        for text in ["да", "2", "буду дышать медленно"] {
            say(h, text).await;
        }
        h.orchestrator
            .core
            .bridges
            .open_for_user("kid")
            .expect("open")
            .remove(0)
    }

    fn delivered_reminders(events: &[EngineEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, EngineEvent::ReminderDelivered { .. }))
            .count()
    }

    async fn say(h: &Harness, text: &str) -> TurnReply {
        h.orchestrator
            .process_message("kid", text)
            .await
            .expect("turn")
    }

    fn drain(events: &flume::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        events.try_iter().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn first_meeting_through_quest_bridge_and_reminder() {
        let h = harness();

        let reply = say(&h, "привет").await;
        assert_eq!(reply.state, ConversationState::ParentLinking);
        assert!(reply.text.contains("родитель"));
        assert_eq!(say(&h, "ну что?").await.state, ConversationState::ParentLinking);

        h.orchestrator.link_guardian("kid").await.expect("link");
        let reply = say(&h, "привет").await;
        assert!(reply.text.contains("Родитель подключился"));
        assert!(reply.text.contains("Как тебя зовут?"));
        assert_eq!(reply.state, ConversationState::Onboarding);

        let reply = say(&h, "Меня зовут Маша").await;
        assert!(reply.text.contains("Маша"));
        assert_eq!(reply.state, ConversationState::Onboarding);

        // the fifth turn closes onboarding and offers a quest for the weakest dimension
        let reply = say(&h, "люблю рисовать").await;
        assert_eq!(reply.state, ConversationState::QuestActive);
        assert!(reply.text.contains("Башню Непонимания"));
        assert!(reply.text.contains("«Дыхание в башне»"));

        let reply = say(&h, "да").await;
        assert!(reply.text.contains("🎯 Шаг 1"));
        assert!(reply.text.contains("1. Спокойствие"));

        let reply = say(&h, "2").await;
        assert!(reply.text.contains("✅ Так бывает у многих"));
        assert!(reply.text.contains("🎯 Шаг 2"));

        let reply = say(&h, "Сделаю три вдоха и посчитаю до пяти").await;
        assert_eq!(reply.state, ConversationState::CasualChat);
        assert!(reply.text.contains("Ты научился замечать тревогу!"));
        assert!(reply.text.contains("Мост в реальность: Три вдоха"));
        assert!(reply.text.contains("Что нового ты узнал?"));

        let events = drain(&h.events);
        assert!(events.contains(&EngineEvent::QuestCompleted {
            user_id: "kid".into(),
            quest_id: "tower_breath".into(),
            total_score: 1.0,
        }));

        let session = h.orchestrator.session("kid").await.expect("session");
        assert_eq!(session.profile.get(LearningDimension::UnderstandingMeaning), 6);
        assert_eq!(session.progress.experience, 50);
        assert_eq!(session.progress.quests_completed, 1);
        assert_eq!(session.location_progress.get("tower_confusion"), Some(&10));
        assert!(session.active_quest_id.is_none());
        assert!(h.orchestrator.quests().progress("kid").is_none());

        // reminder at 24h, delivered through the user's mailbox
        h.clock.advance(ChronoDuration::hours(25));
        tokio::time::advance(Duration::from_secs(25 * 3600)).await;
        loop {
            let event = h.events.recv_async().await.expect("event");
            if let EngineEvent::ReminderDelivered { bridge_id, .. } = event {
                assert_eq!(bridge_id, "three_breaths");
                break;
            }
        }
        assert_eq!(h.sink.delivered.lock().expect("lock").len(), 1);

        let reply = say(&h, "как дела у тебя").await;
        assert!(reply.text.starts_with("⏰ Напоминание: Три вдоха."));

        let reply = say(&h, "Я сделала!").await;
        assert!(reply.text.contains("Ура! Задание «Три вдоха» выполнено!"));
        let session = h.orchestrator.session("kid").await.expect("session");
        assert_eq!(session.profile.get(LearningDimension::Motivation), 6);
        assert!(session.pending_reminders.is_empty());
        assert_eq!(session.message_log.len(), 2 * session.turn_count as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn three_failed_answers_route_to_support_and_resume() {
        let h = harness();
        seed_at_quest_offer(&h);

        assert!(say(&h, "да").await.text.contains("🎯 Шаг 1"));

        let reply = say(&h, "ммм").await;
        assert!(reply.text.contains("Попробуй ещё раз"));
        assert_eq!(reply.state, ConversationState::QuestActive);
        say(&h, "ммм").await;

        let reply = say(&h, "ммм").await;
        assert_eq!(reply.state, ConversationState::CasualChat);
        assert!(reply.text.contains("Подсказка: Выбери номер варианта"));
        let session = h.orchestrator.session("kid").await.expect("session");
        assert_eq!(session.invalid_streak, 0);
        assert_eq!(session.active_quest_id.as_deref(), Some("tower_breath"));

        let reply = say(&h, "давай квест").await;
        assert!(reply.text.contains("Продолжаем квест"));
        assert!(reply.text.contains("🎯 Шаг 1"));
        assert_eq!(reply.state, ConversationState::QuestActive);

        assert!(say(&h, "1").await.text.contains("🎯 Шаг 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn self_harm_is_answered_with_safety_and_stays_flagged() {
        let h = harness();
        seed_at_quest_offer(&h);

        let reply = say(&h, "я не хочу жить").await;
        assert!(reply.text.contains("8-800-2000-122"));
        assert_eq!(reply.state, ConversationState::CasualChat);
        assert!(drain(&h.events).contains(&EngineEvent::SafetyEscalation {
            user_id: "kid".into(),
            risk: RiskTier::Crisis,
        }));

        for text in ["всё хорошо", "правда всё хорошо", "пока"] {
            say(&h, text).await;
        }
        // back through START: screening still routes to support
        let reply = say(&h, "привет").await;
        assert!(reply.text.contains("8-800-2000-122"));

        let stored = h.sessions.get("kid").expect("get").expect("session");
        assert!(stored.screening.self_harm_detected());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_keeps_the_turn_and_flush_retries() {
        let h = harness();
        h.sessions.failing.store(true, Ordering::SeqCst);

        let reply = say(&h, "привет").await;
        assert!(reply.persist_error.as_deref().unwrap_or("").contains("disk full"));
        assert!(h.sessions.get("kid").expect("get").is_none());
        assert!(h.orchestrator.flush("kid").await.is_err());

        h.sessions.failing.store(false, Ordering::SeqCst);
        h.orchestrator.flush("kid").await.expect("flush");
        let stored = h.sessions.get("kid").expect("get").expect("session");
        assert_eq!(stored.turn_count, 1);

        let reply = say(&h, "привет").await;
        assert!(reply.persist_error.is_none());
        assert_eq!(h.sessions.get("kid").expect("get").expect("session").turn_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn turns_for_one_user_are_serialized() {
        let h = harness();
        let orchestrator = h.orchestrator.clone();
        let other = h.orchestrator.clone();

        let (a, b, c) = tokio::join!(
            orchestrator.process_message("kid", "раз"),
            orchestrator.process_message("kid", "два"),
            other.process_message("friend", "привет"),
        );
        a.expect("a");
        b.expect("b");
        c.expect("c");

        let kid = h.orchestrator.session("kid").await.expect("session");
        assert_eq!(kid.turn_count, 2);
        assert_eq!(kid.message_log.len(), 4);
        let friend = h.orchestrator.session("friend").await.expect("session");
        assert_eq!(friend.turn_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirming_a_bridge_outside_chat() {
        let h = harness();
        seed_at_quest_offer(&h);

        assert!(matches!(
            h.orchestrator.complete_bridge("kid", "готово").await,
            Err(BridgeError::NotFound(_))
        ));

        say(&h, "да").await;
        say(&h, "2").await;
        say(&h, "буду дышать медленно").await;

        let bridge = h
            .orchestrator
            .complete_bridge("kid", "сделал утром")
            .await
            .expect("complete");
        assert_eq!(bridge.verification_response.as_deref(), Some("сделал утром"));

        h.clock.advance(ChronoDuration::hours(30));
        tokio::time::advance(Duration::from_secs(30 * 3600)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(h.sink.delivered.lock().expect("lock").is_empty());
        h.orchestrator.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn crisis_before_onboarding_keeps_the_gates() {
        let h = harness();

        let reply = say(&h, "я не хочу жить").await;
        assert!(reply.text.contains("8-800-2000-122"));
        assert_eq!(reply.state, ConversationState::Start);
        assert!(drain(&h.events).contains(&EngineEvent::SafetyEscalation {
            user_id: "kid".into(),
            risk: RiskTier::Crisis,
        }));

        let reply = say(&h, "давай квест").await;
        assert_eq!(reply.state, ConversationState::ParentLinking);

        h.orchestrator.link_guardian("kid").await.expect("link");
        assert_eq!(say(&h, "привет").await.state, ConversationState::Onboarding);

        let reply = say(&h, "я не хочу жить").await;
        assert!(reply.text.contains("8-800-2000-122"));
        assert_eq!(reply.state, ConversationState::Onboarding);
        assert_eq!(say(&h, "давай квест").await.state, ConversationState::Onboarding);

        let session = h.orchestrator.session("kid").await.expect("session");
        assert!(session.name.is_none());
        assert!(session.active_quest_id.is_none());
        assert!(session.screening.self_harm_detected());
    }

    #[tokio::test(start_paused = true)]
    async fn introduction_right_after_linking_is_remembered() {
        let h = harness();
        say(&h, "привет").await;
        h.orchestrator.link_guardian("kid").await.expect("link");

        let reply = say(&h, "Меня зовут Маша").await;
        assert!(reply.text.contains("Родитель подключился"));
        assert!(reply.text.contains("Привет, Маша!"));
        assert!(!reply.text.contains("Как тебя зовут?"));
        assert_eq!(reply.state, ConversationState::Onboarding);

        say(&h, "скучно").await;
        let session = h.orchestrator.session("kid").await.expect("session");
        assert_eq!(session.name.as_deref(), Some("Маша"));
    }

    #[tokio::test(start_paused = true)]
    async fn completion_queued_ahead_of_a_due_reminder_silences_it() {
        let h = harness();
        seed_at_quest_offer(&h);
        let bridge = finish_breathing_quest(&h).await;
        drain(&h.events);

        let (done_tx, done_rx) = oneshot::channel();
        h.orchestrator.send(
            "kid",
            UserCommand::CompleteBridge {
                response: "сделал".into(),
                reply: done_tx,
            },
        );
        h.orchestrator.send(
            "kid",
            UserCommand::ReminderDue(ReminderDue {
                user_id: "kid".into(),
                bridge_key: bridge.id.clone(),
            }),
        );
        done_rx.await.expect("reply").expect("complete");

        // queued behind the reminder, so it sees the result
        let session = h.orchestrator.session("kid").await.expect("session");
        assert!(session.pending_reminders.is_empty());
        assert!(h.sink.delivered.lock().expect("lock").is_empty());
        assert_eq!(delivered_reminders(&drain(&h.events)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reminder_queued_ahead_of_completion_is_delivered_once() {
        let h = harness();
        seed_at_quest_offer(&h);
        let bridge = finish_breathing_quest(&h).await;
        drain(&h.events);

        h.orchestrator.send(
            "kid",
            UserCommand::ReminderDue(ReminderDue {
                user_id: "kid".into(),
                bridge_key: bridge.id.clone(),
            }),
        );
        let (done_tx, done_rx) = oneshot::channel();
        h.orchestrator.send(
            "kid",
            UserCommand::CompleteBridge {
                response: "сделал".into(),
                reply: done_tx,
            },
        );
        let completed = done_rx.await.expect("reply").expect("complete");
        assert!(completed.reminded);
        assert_eq!(*h.sink.delivered.lock().expect("lock"), vec!["three_breaths".to_string()]);

        // the original timer still fires at 24h and finds the bridge completed
        h.clock.advance(ChronoDuration::hours(25));
        tokio::time::advance(Duration::from_secs(25 * 3600)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.sink.delivered.lock().expect("lock").len(), 1);
        assert_eq!(delivered_reminders(&drain(&h.events)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quest_resumes_mid_way_after_reopening_the_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("innerworld.db");
        let config = EngineConfig {
            quests_dir: dir.path().join("quests").to_string_lossy().into_owned(),
            ..EngineConfig::default()
        };
        let clock = ManualClock::new(Utc::now());
        let sink = Arc::new(RecordingSink::default());

        let open = || {
            let store = Arc::new(SqliteStore::new(&db_path).expect("database"));
            let (orchestrator, _events) = Orchestrator::new(
                config.clone(),
                store.clone(),
                store,
                Arc::new(clock.clone()),
                Arc::new(DisabledCompletion),
                sink.clone(),
            )
            .expect("orchestrator");
            orchestrator.quests().insert(breathing_quest());
            orchestrator
        };

        SqliteStore::new(&db_path)
            .expect("database")
            .create(&offered_session(&config, clock.now()))
            .expect("seed");

        let first = open();
        first.process_message("kid", "да").await.expect("turn");
        let reply = first.process_message("kid", "2").await.expect("turn");
        assert!(reply.text.contains("🎯 Шаг 2"));
        first.shutdown();
        drop(first);

        let second = open();
        let session = second.session("kid").await.expect("session");
        assert_eq!(session.quest_step, 1);
        assert_eq!(second.quests().progress("kid").map(|p| p.current_step), Some(1));

        let reply = second
            .process_message("kid", "буду дышать медленно")
            .await
            .expect("turn");
        assert!(reply.text.contains("Ты научился замечать тревогу!"));
        assert!(!reply.text.contains("начинается"));
        let session = second.session("kid").await.expect("session");
        assert_eq!(session.progress.quests_completed, 1);
        second.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_actor_unloads_and_reloads_from_the_store() {
        let h = harness();
        seed_at_quest_offer(&h);
        assert!(say(&h, "да").await.text.contains("🎯 Шаг 1"));
        assert_eq!(h.orchestrator.live_sessions(), 1);

        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        assert_eq!(h.orchestrator.live_sessions(), 0);
        assert!(h.orchestrator.quests().progress("kid").is_none());

        let reply = say(&h, "2").await;
        assert!(reply.text.contains("🎯 Шаг 2"));
        assert_eq!(h.orchestrator.live_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsaved_actor_is_not_unloaded() {
        let h = harness();
        h.sessions.failing.store(true, Ordering::SeqCst);
        assert!(say(&h, "привет").await.persist_error.is_some());

        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        assert_eq!(h.orchestrator.live_sessions(), 1);

        h.sessions.failing.store(false, Ordering::SeqCst);
        h.orchestrator.flush("kid").await.expect("flush");
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        assert_eq!(h.orchestrator.live_sessions(), 0);
        assert_eq!(h.sessions.get("kid").expect("get").expect("session").turn_count, 1);
    }
}
