//! Keyword intents and answer parsing for raw chat text.

use regex_lite::Regex;
use std::sync::OnceLock;

use crate::emotion::EMOTION_PRIORITY;
use crate::quest::{QuestStep, StepResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Farewell,
    Quest,
    Help,
}

const FAREWELL: &[&str] = &["пока", "до свидания", "уйду"];
const QUEST: &[&str] = &["квест", "задание", "учиться"];
const HELP: &[&str] = &["помоги", "не понимаю", "сложно"];
const BRIDGE_DONE: &[&str] = &[
    "сделал",
    "сделала",
    "получилось",
    "выполнил",
    "выполнила",
    "готово",
];
const NEGATORS: &[&str] = &["не", "нет", "ни"];

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_string())
        .collect()
}

/// Whole-word match, so "покажи" is not a farewell.
fn has_phrase(text_words: &[String], phrase: &str) -> bool {
    let phrase_words: Vec<&str> = phrase.split_whitespace().collect();
    if phrase_words.is_empty() || phrase_words.len() > text_words.len() {
        return false;
    }
    text_words
        .windows(phrase_words.len())
        .any(|window| window.iter().zip(&phrase_words).all(|(a, b)| a == b))
}

fn has_any(text_words: &[String], phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| has_phrase(text_words, phrase))
}

/// Casual-chat routing intent. Farewell wins over quest, quest over help.
pub fn detect(text: &str) -> Option<Intent> {
    let text_words = words(text);
    if has_any(&text_words, FAREWELL) {
        Some(Intent::Farewell)
    } else if has_any(&text_words, QUEST) {
        Some(Intent::Quest)
    } else if has_any(&text_words, HELP) {
        Some(Intent::Help)
    } else {
        None
    }
}

/// A confirmation word not directly negated: "сделал" yes, "ещё не сделал" no.
pub fn is_bridge_confirmation(text: &str) -> bool {
    let text_words = words(text);
    text_words.iter().enumerate().any(|(index, word)| {
        BRIDGE_DONE.contains(&word.as_str())
            && (index == 0 || !NEGATORS.contains(&text_words[index - 1].as_str()))
    })
}

fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn first_number() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"-?\d+")
}

fn name_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?:^|\s)(?:меня зовут|зовут)\s+([^\s,.!?]+)")
}

fn age_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(\d{1,2})\s*(?:лет|год)")
}

/// Map raw text onto a step answer. Choice steps take the first number (1-based, as shown)
/// or an exact option text; anything else stays text and fails choice validation.
pub fn parse_answer(step: &QuestStep, text: &str) -> StepResponse {
    if !step.kind.is_choice() {
        return StepResponse::Text(text.to_string());
    }

    if let Some(found) = first_number().and_then(|re| re.find(text)) {
        // numbers that do not fit stay text and fail validation
        if let Some(index) = found
            .as_str()
            .parse::<i64>()
            .ok()
            .and_then(|number| number.checked_sub(1))
        {
            return StepResponse::Choice(index);
        }
    }

    let wanted = text.trim().to_lowercase();
    step.options
        .iter()
        .position(|option| option.text.trim().to_lowercase() == wanted)
        .map(|index| StepResponse::Choice(index as i64))
        .unwrap_or_else(|| StepResponse::Text(text.to_string()))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

const MAX_BARE_NAME_CHARS: usize = 20;
const NOT_NAMES: &[&str] = &["привет", "здравствуй", "здравствуйте", "да", "нет", "ок", "хорошо"];

/// Words the guide reacts to elsewhere, so a bare "скучно" or "квест" is not a name.
fn is_known_word(word: &str) -> bool {
    NOT_NAMES.contains(&word)
        || [FAREWELL, QUEST, HELP, BRIDGE_DONE, NEGATORS]
            .iter()
            .any(|list| list.contains(&word))
        || EMOTION_PRIORITY
            .iter()
            .any(|state| state.keywords().contains(&word))
}

/// Only an explicit "меня зовут Маша".
pub fn introduced_name(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let captures = name_pattern()?.captures(&lower)?;
    let name = captures.get(1)?.as_str();
    (name.chars().all(char::is_alphabetic) && !is_known_word(name)).then(|| capitalize(name))
}

/// "Меня зовут Маша" or a bare single-word reply.
pub fn extract_name(text: &str) -> Option<String> {
    if let Some(name) = introduced_name(text) {
        return Some(name);
    }

    let lower = text.to_lowercase();
    let trimmed = lower.trim().trim_end_matches(|c: char| !c.is_alphanumeric());
    let is_single_word = !trimmed.is_empty()
        && trimmed.chars().count() <= MAX_BARE_NAME_CHARS
        && trimmed.chars().all(char::is_alphabetic)
        && !is_known_word(trimmed);
    if is_single_word {
        Some(capitalize(trimmed))
    } else {
        None
    }
}

pub fn extract_age(text: &str) -> Option<u32> {
    let lower = text.to_lowercase();
    let captures = age_pattern()?.captures(&lower)?;
    let age: u32 = captures.get(1)?.as_str().parse().ok()?;
    (5..=18).contains(&age).then_some(age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quest::{StepOption, StepType, StepValidation};

    fn choice_step() -> QuestStep {
        QuestStep {
            id: "pick".into(),
            kind: StepType::Choice,
            prompt: "?".into(),
            validation: StepValidation::default(),
            hint: None,
            options: vec![
                StepOption {
                    text: "Спокойно".into(),
                    score: 0.2,
                    feedback: None,
                },
                StepOption {
                    text: "Тревожно".into(),
                    score: 1.0,
                    feedback: None,
                },
            ],
            feedback: None,
        }
    }

    #[test]
    fn intents_match_whole_words_in_priority_order() {
        assert_eq!(detect("Ну всё, пока!"), Some(Intent::Farewell));
        assert_eq!(detect("покажи ещё"), None);
        assert_eq!(detect("Хочу новое задание"), Some(Intent::Quest));
        assert_eq!(detect("Я не понимаю дроби"), Some(Intent::Help));
        assert_eq!(detect("пока, а квест завтра"), Some(Intent::Farewell));
        assert!(is_bridge_confirmation("Я сделала!"));
        assert!(!is_bridge_confirmation("сделать бы"));
    }

    #[test]
    fn negated_confirmations_do_not_count() {
        assert!(!is_bridge_confirmation("не получилось"));
        assert!(!is_bridge_confirmation("я ничего не сделал"));
        assert!(!is_bridge_confirmation("Нет, ещё не выполнила"));
        assert!(is_bridge_confirmation("Получилось! Не сразу, но сделал"));
        assert!(is_bridge_confirmation("готово"));
    }

    #[test]
    fn choice_answers_are_one_based() {
        let step = choice_step();
        assert_eq!(parse_answer(&step, "2"), StepResponse::Choice(1));
        assert_eq!(parse_answer(&step, "вариант 1 наверно"), StepResponse::Choice(0));
        assert_eq!(parse_answer(&step, "0"), StepResponse::Choice(-1));
        assert_eq!(parse_answer(&step, "тревожно"), StepResponse::Choice(1));
        assert_eq!(
            parse_answer(&step, "-9223372036854775808"),
            StepResponse::Text("-9223372036854775808".into())
        );
        assert_eq!(
            parse_answer(&step, "99999999999999999999"),
            StepResponse::Text("99999999999999999999".into())
        );
        assert_eq!(
            parse_answer(&step, "не знаю"),
            StepResponse::Text("не знаю".into())
        );
    }

    #[test]
    fn text_steps_keep_raw_text() {
        let mut step = choice_step();
        step.kind = StepType::InputText;
        assert_eq!(parse_answer(&step, "2"), StepResponse::Text("2".into()));
    }

    #[test]
    fn names_and_ages_from_introductions() {
        assert_eq!(extract_name("Привет, меня зовут Маша"), Some("Маша".into()));
        assert_eq!(extract_name("петя"), Some("Петя".into()));
        assert_eq!(extract_name("моя мама дома"), None);
        assert_eq!(extract_name("Лёва!"), Some("Лёва".into()));
        assert_eq!(extract_name("Привет!"), None);
        assert_eq!(extract_name("не скажу тебе ничего"), None);
        assert_eq!(extract_name("скучно"), None);
        assert_eq!(extract_name("Квест!"), None);
        assert_eq!(introduced_name("Маша"), None);
        assert_eq!(introduced_name("а меня зовут Лёва"), Some("Лёва".into()));
        assert_eq!(extract_age("мне 10 лет"), Some(10));
        assert_eq!(extract_age("мне 99 лет"), None);
    }
}
