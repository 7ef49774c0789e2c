//! One handler per conversation state. Each handler produces a reply fragment and says
//! whether the turn stays, rests in another state, or chains into another handler.

use super::intent::{self, Intent};
use super::{EngineCore, EngineEvent};
use crate::bridge::{ActiveBridge, BridgeError};
use crate::completion::{complete_or_fallback, conversation_messages, Message};
use crate::emotion::EmotionalState;
use crate::profile::{LearningDimension, ProfileAnalyzer};
use crate::quest::{QuestError, QuestStep, StepOutcome};
use crate::screening::{ConcernLevel, RiskTier};
use crate::session::{ConversationState, Session};

const MAX_CHAIN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    Stay,
    /// Store the state and end the turn.
    Rest(ConversationState),
    /// Run the state's handler within the same turn.
    Chain(ConversationState),
}

#[derive(Debug, Clone)]
pub(crate) struct HandlerOutcome {
    reply: String,
    next: Next,
}

impl HandlerOutcome {
    fn stay(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            next: Next::Stay,
        }
    }

    fn rest(reply: impl Into<String>, state: ConversationState) -> Self {
        Self {
            reply: reply.into(),
            next: Next::Rest(state),
        }
    }

    fn chain(reply: impl Into<String>, state: ConversationState) -> Self {
        Self {
            reply: reply.into(),
            next: Next::Chain(state),
        }
    }
}

/// Run handlers from the session's current state until one stays or rests.
pub(crate) async fn run_state_machine(core: &EngineCore, session: &mut Session, text: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut state = session.state;
    let mut entered = false;
    let mut hops = 0;

    loop {
        let outcome = handle(core, session, state, text, entered).await;
        if !outcome.reply.trim().is_empty() {
            parts.push(outcome.reply);
        }

        match outcome.next {
            Next::Stay => {
                session.state = state;
                break;
            }
            Next::Rest(next) => {
                tracing::debug!(
                    "User {}: {} -> {} (rest)",
                    session.user_id,
                    state.as_db_str(),
                    next.as_db_str()
                );
                session.state = next;
                break;
            }
            Next::Chain(next) => {
                tracing::debug!(
                    "User {}: {} -> {}",
                    session.user_id,
                    state.as_db_str(),
                    next.as_db_str()
                );
                hops += 1;
                if hops > MAX_CHAIN {
                    tracing::warn!(
                        "User {}: chain limit reached, resting in {}",
                        session.user_id,
                        next.as_db_str()
                    );
                    session.state = next;
                    break;
                }
                state = next;
                entered = true;
            }
        }
    }

    if parts.is_empty() {
        "Я тут! 🙂".to_string()
    } else {
        parts.join("\n\n")
    }
}

async fn handle(
    core: &EngineCore,
    session: &mut Session,
    state: ConversationState,
    text: &str,
    entered: bool,
) -> HandlerOutcome {
    match state {
        ConversationState::Start => start(core, session),
        ConversationState::ParentLinking => parent_linking(session, entered),
        ConversationState::Onboarding => onboarding(core, session, text, entered).await,
        ConversationState::EmotionCheck => emotion_check(session),
        ConversationState::ScreeningCheck => screening_check(core, session),
        ConversationState::LocationSelection => location_selection(core, session),
        ConversationState::QuestActive => quest_active(core, session, text, entered),
        ConversationState::QuestReflection => quest_reflection(),
        ConversationState::LearningSupport => learning_support(core, session),
        ConversationState::CasualChat => casual_chat(core, session, text).await,
        ConversationState::EndSession => end_session(core, session),
    }
}

pub(crate) fn location_display_name(location: &str) -> &str {
    match location {
        "tower_confusion" => "Башню Непонимания",
        "valley_words" => "Долину Слов",
        "mountain_emptiness" => "Гору Пустоты",
        "forest_calm" => "Лес Спокойствия",
        "city_mind" => "Город Разума",
        "workshop_creator" => "Мастерскую Творца",
        "bridge_actions" => "Мост Действий",
        other => other,
    }
}

fn start(core: &EngineCore, session: &Session) -> HandlerOutcome {
    if !session.guardian_linked {
        return HandlerOutcome::chain(
            "Привет! Я InnerWorld Edu 🌟\n\n\
             Помогу тебе с учёбой и научу понимать себя лучше.\n\n\
             Но сначала нужно, чтобы твой родитель подключился. Это нужно для твоей безопасности.",
            ConversationState::ParentLinking,
        );
    }

    match &session.name {
        None => HandlerOutcome::chain("", ConversationState::Onboarding),
        Some(name) => {
            let greeting = format!("С возвращением, {}! 😊", name);
            if session.turn_count < core.config.session.onboarding_turns {
                HandlerOutcome::chain(greeting, ConversationState::Onboarding)
            } else {
                HandlerOutcome::chain(greeting, ConversationState::EmotionCheck)
            }
        }
    }
}

/// Whether the child has a linked guardian and has finished onboarding.
pub(crate) fn past_gates(core: &EngineCore, session: &Session) -> bool {
    let onboarded =
        session.name.is_some() && session.turn_count >= core.config.session.onboarding_turns;
    session.guardian_linked
        && onboarded
        && !matches!(
            session.state,
            ConversationState::ParentLinking | ConversationState::Onboarding
        )
}

fn parent_linking(session: &Session, entered: bool) -> HandlerOutcome {
    if session.guardian_linked {
        return HandlerOutcome::chain("Родитель подключился! 🎉", ConversationState::Start);
    }
    if entered {
        HandlerOutcome::stay("Я отправлю твоему родителю приглашение. Как только он его примет, мы начнём!")
    } else {
        HandlerOutcome::stay("Пока ждём родителя ⏳ Попроси его открыть ссылку-приглашение.")
    }
}

const ONBOARDING_GOAL: &str = "Сейчас этап знакомства. Узнай имя ребёнка, какие предметы даются \
сложно и что именно сложно (не понимаю, забываю, скучно). Задавай по одному вопросу.";

async fn onboarding(
    core: &EngineCore,
    session: &mut Session,
    text: &str,
    entered: bool,
) -> HandlerOutcome {
    if entered {
        // START greeted a returning child already
        if session.name.is_some() {
            return HandlerOutcome::stay("");
        }
        return match intent::introduced_name(text) {
            Some(name) => {
                tracing::info!("User {} introduced as {}", session.user_id, name);
                session.name = Some(name.clone());
                HandlerOutcome::stay(format!(
                    "Привет, {}! 😊 Какой предмет в школе кажется тебе самым сложным?",
                    name
                ))
            }
            None => HandlerOutcome::stay("Привет! Как тебя зовут?"),
        };
    }

    let mut just_named = None;
    if session.name.is_none() {
        if let Some(name) = intent::extract_name(text) {
            tracing::info!("User {} introduced as {}", session.user_id, name);
            session.name = Some(name.clone());
            just_named = Some(name);
        }
    }
    if session.age.is_none() {
        session.age = intent::extract_age(text);
    }

    if session.turn_count >= core.config.session.onboarding_turns {
        if let Some(name) = &session.name {
            return HandlerOutcome::chain(
                format!("Приятно познакомиться поближе, {}! Пора в путешествие 🗺️", name),
                ConversationState::LocationSelection,
            );
        }
    }

    let fallback = match &just_named {
        Some(name) => format!(
            "Приятно познакомиться, {}! 😊 Какой предмет в школе кажется тебе самым сложным?",
            name
        ),
        None if session.name.is_none() => "Как мне тебя называть? 🙂".to_string(),
        None => "Расскажи мне о себе! Что тебе сложнее всего: понять, запомнить или сосредоточиться?"
            .to_string(),
    };

    let mut messages = conversation_messages(session, core.config.completion.history_messages);
    messages.insert(1, Message::system(ONBOARDING_GOAL));
    let reply = complete_or_fallback(core.completion.as_ref(), messages, &fallback).await;
    HandlerOutcome::stay(reply)
}

fn emotion_check(session: &Session) -> HandlerOutcome {
    let Some(reading) = &session.latest_emotion else {
        return HandlerOutcome::chain("", ConversationState::ScreeningCheck);
    };
    let mut reply = format!("Вижу, что ты чувствуешь {}.", reading.state.felt_as());
    if reading.state.is_negative() {
        reply.push(' ');
        reply.push_str(session.emotions.support_message(reading.state));
    }
    HandlerOutcome::chain(reply, ConversationState::ScreeningCheck)
}

fn screening_check(core: &EngineCore, session: &Session) -> HandlerOutcome {
    let config = &core.config.screening;
    let level = session.screening.concern_level(config);
    if level >= ConcernLevel::Moderate {
        tracing::warn!(
            "Screening concern {:?} for user {} (self_worth {:.2}, self_criticism {:.2}, storms {})",
            level,
            session.user_id,
            session.screening.self_worth,
            session.screening.self_criticism,
            session.screening.emotional_storm_count
        );
    }

    match session.screening.risk(config) {
        RiskTier::Normal => HandlerOutcome::chain("", ConversationState::LocationSelection),
        risk => {
            if risk == RiskTier::SupportNeeded {
                core.emit(EngineEvent::SafetyEscalation {
                    user_id: session.user_id.clone(),
                    risk,
                });
            }
            HandlerOutcome::chain("", ConversationState::LearningSupport)
        }
    }
}

fn location_selection(core: &EngineCore, session: &mut Session) -> HandlerOutcome {
    let profile_location = ProfileAnalyzer::recommended_location(&session.profile);
    let difficulty = ProfileAnalyzer::difficulty(&session.profile);
    tracing::debug!(
        "User {}: weakest {}, modules {:?}, difficulty {}",
        session.user_id,
        session.profile.weakest().as_str(),
        ProfileAnalyzer::recommended_modules(&session.profile, core.config.session.recommended_modules),
        difficulty.as_str()
    );

    let mut candidates = vec![profile_location];
    if let Some(reading) = &session.latest_emotion {
        let calm = reading.state.recommended_location();
        if calm != profile_location {
            candidates.push(calm);
        }
    }

    let chosen = candidates.iter().find_map(|location| {
        core.quests
            .first_for_location(location, difficulty)
            .map(|quest| (*location, quest))
    });

    match chosen {
        Some((location, quest)) => {
            session.location = Some(location.to_string());
            session.active_quest_id = Some(quest.id.clone());
            session.quest_step = 0;
            HandlerOutcome::rest(
                format!(
                    "Отлично! Думаю, тебе стоит посетить {} 🏰\n\n\
                     Там тебя ждёт квест «{}». Готов начать?",
                    location_display_name(location),
                    quest.title
                ),
                ConversationState::QuestActive,
            )
        }
        None => {
            session.location = Some(profile_location.to_string());
            tracing::warn!("No quests available for user {} at {:?}", session.user_id, candidates);
            HandlerOutcome::rest(
                format!(
                    "Давай отправимся в {} 🏰 Квесты там ещё готовятся, а пока просто поболтаем!",
                    location_display_name(profile_location)
                ),
                ConversationState::CasualChat,
            )
        }
    }
}

fn render_step(step: &QuestStep, number: usize) -> String {
    let mut text = format!("🎯 Шаг {}\n\n{}", number, step.render());
    if let Some(hint) = &step.hint {
        text.push_str(&format!("\n\n💡 Подсказка: {}", hint));
    }
    text
}

fn sync_quest(core: &EngineCore, session: &mut Session) {
    session.quest_progress = core.quests.progress(&session.user_id);
    session.quest_step = session
        .quest_progress
        .as_ref()
        .map_or(0, |progress| progress.current_step);
}

fn quest_active(
    core: &EngineCore,
    session: &mut Session,
    text: &str,
    entered: bool,
) -> HandlerOutcome {
    let user_id = session.user_id.clone();
    let Some(quest_id) = session.active_quest_id.clone() else {
        return HandlerOutcome::chain("", ConversationState::LocationSelection);
    };

    let live = core
        .quests
        .progress(&user_id)
        .filter(|progress| progress.quest_id == quest_id && !progress.is_completed());

    if live.is_none() {
        return match core.quests.start(&user_id, &quest_id) {
            Ok(first) => {
                sync_quest(core, session);
                let title = core
                    .quests
                    .get(&quest_id)
                    .map(|quest| quest.title.clone())
                    .unwrap_or_else(|| quest_id.clone());
                HandlerOutcome::stay(format!("Квест «{}» начинается!\n\n{}", title, render_step(&first, 1)))
            }
            Err(e) => {
                tracing::error!("Cannot start quest {} for user {}: {}", quest_id, user_id, e);
                session.clear_quest();
                HandlerOutcome::chain(
                    "Не могу начать этот квест 😅 Давай подберём другой.",
                    ConversationState::LocationSelection,
                )
            }
        };
    }

    // Chained in from chat: show where we stopped instead of grading the chat text
    if entered {
        return match core.quests.current_step(&user_id) {
            Some(step) => HandlerOutcome::stay(format!(
                "Продолжаем квест!\n\n{}",
                render_step(&step, session.quest_step + 1)
            )),
            None => HandlerOutcome::chain("", ConversationState::LocationSelection),
        };
    }

    let Some(step) = core.quests.current_step(&user_id) else {
        session.clear_quest();
        core.quests.clear(&user_id);
        return HandlerOutcome::chain("", ConversationState::LocationSelection);
    };

    let answer = intent::parse_answer(&step, text);
    match core.quests.submit(&user_id, answer) {
        Ok(StepOutcome::Advanced { next_step, feedback }) => {
            session.invalid_streak = 0;
            sync_quest(core, session);
            let mut reply = String::new();
            if let Some(feedback) = feedback {
                reply.push_str(&format!("✅ {}\n\n", feedback));
            }
            reply.push_str(&render_step(&next_step, session.quest_step + 1));
            HandlerOutcome::stay(reply)
        }
        Ok(StepOutcome::Completed {
            completion_message,
            total_score,
        }) => {
            session.invalid_streak = 0;
            let reply = finish_quest(core, session, &quest_id, &completion_message, total_score);
            HandlerOutcome::chain(reply, ConversationState::QuestReflection)
        }
        Err(QuestError::Validation(reason)) => {
            session.invalid_streak += 1;
            if session.invalid_streak >= core.config.session.stuck_after_failures {
                tracing::info!(
                    "User {} stuck on quest {} step {} after {} attempts",
                    user_id,
                    quest_id,
                    step.id,
                    session.invalid_streak
                );
                return HandlerOutcome::chain(
                    format!("❌ {}", reason),
                    ConversationState::LearningSupport,
                );
            }
            let mut reply = format!("❌ {}\n\nПопробуй ещё раз!", reason);
            if let Some(hint) = &step.hint {
                reply.push_str(&format!("\n\n💡 Подсказка: {}", hint));
            }
            HandlerOutcome::stay(reply)
        }
        Err(e) => {
            tracing::warn!("Quest {} for user {} is no longer playable: {}", quest_id, user_id, e);
            core.quests.clear(&user_id);
            session.clear_quest();
            HandlerOutcome::chain(
                "Этот квест больше недоступен. Выберем новый!",
                ConversationState::LocationSelection,
            )
        }
    }
}

/// Apply rewards, create the follow-up bridge and clear the finished quest.
fn finish_quest(
    core: &EngineCore,
    session: &mut Session,
    quest_id: &str,
    completion_message: &str,
    total_score: f64,
) -> String {
    let user_id = session.user_id.clone();
    let now = core.clock.now();
    let source = format!("quest:{}", quest_id);
    let mut parts = vec![completion_message.trim().to_string(), "🎉 Квест завершён!".to_string()];

    if let Some(rewards) = core.quests.rewards_for(&user_id) {
        let mut lines = vec![format!("🎁 Награды:\n• XP: +{}", rewards.experience_points)];
        let gained = session.progress.add_experience(rewards.experience_points);
        if gained > 0 {
            lines.push(format!("• Новый уровень: {} ⭐", session.progress.level));
        }
        for (name, delta) in &rewards.learning_profile {
            match LearningDimension::parse(name) {
                Some(dimension) => {
                    session.profile.adjust(dimension, *delta, &source, now);
                }
                None => tracing::warn!("Quest {} rewards unknown dimension {:?}", quest_id, name),
            }
        }
        for (location, delta) in &rewards.location_progress {
            *session.location_progress.entry(location.clone()).or_insert(0) += delta;
        }
        parts.push(lines.join("\n"));
    }
    session.progress.quests_completed += 1;

    if let Some(spec) = core.quests.bridge_for(&user_id) {
        match core.bridges.create(&user_id, quest_id, &spec) {
            Ok(bridge) => parts.push(format!(
                "🌉 Мост в реальность: {}\n{}\n\nУ тебя есть {} часов! Я напомню через {} часов ⏰",
                bridge.title, bridge.description, spec.deadline_hours, spec.reminder_hours
            )),
            Err(BridgeError::PendingBridge { .. }) => parts.push(
                "🌉 Сначала закончи прошлое задание из реальной жизни, потом дам новое!".to_string(),
            ),
            Err(e) => tracing::error!("Failed to create bridge for user {}: {}", user_id, e),
        }
    }

    core.emit(EngineEvent::QuestCompleted {
        user_id: user_id.clone(),
        quest_id: quest_id.to_string(),
        total_score,
    });

    core.quests.clear(&user_id);
    session.clear_quest();
    parts.retain(|part| !part.is_empty());
    parts.join("\n\n")
}

fn quest_reflection() -> HandlerOutcome {
    HandlerOutcome::rest(
        "Отлично справился! 🎉\n\nЧто нового ты узнал? Что было самым интересным?",
        ConversationState::CasualChat,
    )
}

pub(crate) const CRISIS_REPLY: &str = "Мне очень важно, чтобы ты был в безопасности 💛\n\n\
Пожалуйста, расскажи об этом маме, папе или другому взрослому, которому доверяешь. \
Ещё можно бесплатно позвонить на детский телефон доверия: 8-800-2000-122.";

fn learning_support(core: &EngineCore, session: &mut Session) -> HandlerOutcome {
    if session.screening.risk(&core.config.screening) == RiskTier::Crisis {
        return HandlerOutcome::rest(CRISIS_REPLY, ConversationState::CasualChat);
    }

    let mut reply = match session.latest_emotion.as_ref().map(|r| r.state) {
        Some(EmotionalState::Tiredness) => {
            "Вижу, ты устал 😴\n\nМожет, сделаем перерыв? Или попробуем что-то более лёгкое?".to_string()
        }
        Some(EmotionalState::Anxiety) => {
            "Всё нормально, не волнуйся 🤗\n\nДавай разберёмся вместе, шаг за шагом. Ты справишься!"
                .to_string()
        }
        Some(EmotionalState::Anger) => {
            "Понимаю, что ты злишься 😤\n\nТак бывает, когда что-то не получается. Хочешь попробовать по-другому?"
                .to_string()
        }
        _ => "Я здесь, чтобы помочь! Что тебя беспокоит?".to_string(),
    };

    if session.invalid_streak >= core.config.session.stuck_after_failures {
        session.invalid_streak = 0;
        if let Some(step) = core.quests.current_step(&session.user_id) {
            if let Some(hint) = &step.hint {
                reply.push_str(&format!("\n\n💡 Подсказка: {}", hint));
            }
        }
        reply.push_str("\n\nКогда будешь готов, напиши «квест», и продолжим с того же места.");
    }

    tracing::debug!(
        "User {} support: {} ({:?})",
        session.user_id,
        ProfileAnalyzer::teaching_strategy(&session.profile),
        ProfileAnalyzer::detect_pattern(&session.profile).concern()
    );
    HandlerOutcome::rest(reply, ConversationState::CasualChat)
}

/// Mark a confirmed bridge in the session. Returns the reply line.
pub(crate) fn apply_bridge_completion(
    core: &EngineCore,
    session: &mut Session,
    bridge: &ActiveBridge,
) -> String {
    let source = format!("bridge:{}", bridge.bridge_id);
    session
        .profile
        .adjust(LearningDimension::Motivation, 1, &source, core.clock.now());
    format!(
        "Ура! Задание «{}» выполнено! 🌉 Мотивация +1",
        bridge.title
    )
}

const CASUAL_FALLBACK: &str = "Ха-ха, интересно! 😄 Расскажи ещё что-нибудь!";

async fn casual_chat(core: &EngineCore, session: &mut Session, text: &str) -> HandlerOutcome {
    if intent::is_bridge_confirmation(text) {
        match core.bridges.complete(&session.user_id, text) {
            Ok(bridge) => {
                let reply = apply_bridge_completion(core, session, &bridge);
                return HandlerOutcome::stay(reply);
            }
            Err(BridgeError::NotFound(_)) => {}
            Err(e) => tracing::error!("Failed to complete bridge for user {}: {}", session.user_id, e),
        }
    }

    match intent::detect(text) {
        Some(Intent::Farewell) => return HandlerOutcome::chain("", ConversationState::EndSession),
        Some(Intent::Quest) => return HandlerOutcome::chain("", ConversationState::QuestActive),
        Some(Intent::Help) => return HandlerOutcome::chain("", ConversationState::LearningSupport),
        None => {}
    }

    let messages = conversation_messages(session, core.config.completion.history_messages);
    let reply = complete_or_fallback(core.completion.as_ref(), messages, CASUAL_FALLBACK).await;
    HandlerOutcome::stay(reply)
}

fn end_session(core: &EngineCore, session: &Session) -> HandlerOutcome {
    let mood = session.emotions.summary(core.clock.now(), &core.config.emotion);
    tracing::info!(
        "Session for user {} ends after {} turns: mood {} (dominant {}, volatility {:.2}), {}",
        session.user_id,
        session.turn_count,
        mood.current.as_str(),
        mood.dominant.as_str(),
        mood.volatility,
        ProfileAnalyzer::progress_summary(&session.profile).replace('\n', "; ")
    );

    let farewell = match &session.name {
        Some(name) => format!("Спасибо за сегодня, {}! 🌟", name),
        None => "Спасибо за сегодня! 🌟".to_string(),
    };
    HandlerOutcome::rest(
        format!("{}\n\nТы молодец! Возвращайся, когда захочешь.\n\nПока! 👋", farewell),
        ConversationState::Start,
    )
}
