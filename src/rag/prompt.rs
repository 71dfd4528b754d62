use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::models::{Message, Turn};
use super::vector_store::ScoredSegment;

static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!("cl100k tokenizer unavailable, estimating token counts: {}", e);
        None
    }
});

const CONDENSE_INSTRUCTIONS: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language. \
Reply with the standalone question only.";

const QA_INSTRUCTIONS: &str = "Use the following pieces of context to answer the user's question. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

pub fn count_tokens(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Most recent turns whose combined size fits in `max_tokens`, oldest first.
pub fn trim_history(history: &[Turn], max_tokens: usize) -> &[Turn] {
    let mut used = 0;
    let mut keep = 0;
    for turn in history.iter().rev() {
        let cost = count_tokens(&turn.question) + count_tokens(&turn.answer);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        keep += 1;
    }
    &history[history.len() - keep..]
}

fn history_messages(history: &[Turn]) -> Vec<Message> {
    history
        .iter()
        .flat_map(|turn| {
            [
                Message::user(turn.question.clone()),
                Message::assistant(turn.answer.clone()),
            ]
        })
        .collect()
}

pub fn condense_messages(history: &[Turn], question: &str) -> Vec<Message> {
    let transcript: Vec<String> = history
        .iter()
        .map(|turn| format!("Human: {}\nAssistant: {}", turn.question, turn.answer))
        .collect();
    vec![
        Message::system(CONDENSE_INSTRUCTIONS),
        Message::user(format!(
            "Chat History:\n{}\nFollow Up Input: {}\nStandalone question:",
            transcript.join("\n"),
            question
        )),
    ]
}

pub fn answer_messages(
    context: &[ScoredSegment],
    history: &[Turn],
    question: &str,
) -> Vec<Message> {
    let context_text = context
        .iter()
        .map(|hit| hit.segment.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut messages = vec![Message::system(format!(
        "{}\n----------------\n{}",
        QA_INSTRUCTIONS, context_text
    ))];
    messages.extend(history_messages(history));
    messages.push(Message::user(question));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(q: &str, a: &str) -> Turn {
        Turn {
            question: q.to_string(),
            answer: a.to_string(),
        }
    }

    #[test]
    fn test_trim_history_keeps_recent_turns() {
        let history = vec![
            turn(&"old ".repeat(200), "answer"),
            turn("What is the fee?", "It is $40,000."),
            turn("And the term?", "Ten years."),
        ];
        let trimmed = trim_history(&history, 40);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0].question, "What is the fee?");
        assert!(trim_history(&history, 0).is_empty());
    }

    #[test]
    fn test_answer_messages_layout() {
        let history = vec![turn("Hi", "Hello!")];
        let messages = answer_messages(&[], &history, "What is covered?");
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[3].content, "What is covered?");
    }

    #[test]
    fn test_condense_includes_history_and_question() {
        let history = [turn("Who is the franchisor?", "EggBred LLC.")];
        let messages = condense_messages(&history, "Where is it based?");
        assert!(messages[1].content.contains("Human: Who is the franchisor?"));
        assert!(messages[1]
            .content
            .ends_with("Follow Up Input: Where is it based?\nStandalone question:"));
    }
}
