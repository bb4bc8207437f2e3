use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::chat::ConversationMemory;
use crate::services::knowledge_index::SearchHit;

// Marker-based field protocol shared with the generation backend. The
// markers live only in this module so the format can be swapped for a
// structured one without touching the orchestrator.
static ANSWER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)ChatBot_Answer:\s*(.*?)\s*End_ChatBot_Answer").unwrap());
static SUMMARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)ChatBot_Summary:\s*(.*?)\s*End_ChatBot_Summary").unwrap());
static TOPIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)ChatBot_Topic:[ \t]*(.*?)[ \t]*$").unwrap());

/// Deterministic prompt assembly from conversation memory, the
/// sanitized message and retrieved knowledge.
pub struct PromptBuilder {
    reserve_topic: String,
}

impl PromptBuilder {
    pub fn new(reserve_topic: String) -> Self {
        Self { reserve_topic }
    }

    pub fn format(
        &self,
        memory: &ConversationMemory,
        message: &str,
        retrieved: &[SearchHit],
    ) -> String {
        let mut rag_block = String::new();

        if let Some(best) = retrieved.first() {
            rag_block.push_str(&format!(
                "Here is relevant background information that may help answer the user's \
                 question. Summarize and explain it in your own words:\n\n\
                 RAG_Question: {}\n\n\
                 RAG_Answer: {}.\n\n\
                 Generate **ready-to-use follow-up questions** that user can send immediately \
                 to clarify the answer, ask for examples or explore related topics. The \
                 questions **must be intended for the user to ask the bot, not for the user \
                 to answer**. Each question must start with '*'.\n\n",
                best.question, best.answer
            ));

            // Lower-ranked hits are topic hints only, not full pairs.
            for hit in &retrieved[1..] {
                rag_block.push_str(&format!(
                    "Another related topic to consider: {}\n\n",
                    hit.question
                ));
            }
        }

        format!(
            "User prompt: \"{message}\"\n\n\
             Role description: You are a domain expert on {reserve}. Follow the user's \
             demand strictly. If the user provides a question, give a **concise, meaningful, \
             and accurate answer**.\n\n\
             {rag_block}\
             The answer **must include ready-to-use follow-up questions** that the user can \
             copy and send immediately. These questions must start with '*'.\n\n\
             If the answer includes programming code, wrap it with `<code>` and `</code>` \
             tags.\n\n\
             Reserve Topic: {reserve}. Topic: {topic}\n\n\
             Previous conversation summary: {summary}\n\n\
             Sample output:\n\n\
             ChatBot_Answer: [Your answer here] End_ChatBot_Answer\n\n\
             ChatBot_Summary: [Summarize interactions] End_ChatBot_Summary\n\n\
             ChatBot_Topic: [Conversation topic]",
            message = message,
            reserve = self.reserve_topic,
            rag_block = rag_block,
            topic = memory.previous_topic,
            summary = memory.summary,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub answer: String,
    pub summary: String,
    pub topic: String,
}

/// Extract the three structured fields from a raw reply. A field whose
/// markers are missing comes back empty; the orchestrator escalates an
/// empty answer, since that is never a valid bot turn. Newlines inside
/// the answer become explicit `<br>` markers for the rich-text client.
pub fn parse_reply(reply: &str) -> ParsedReply {
    let capture = |re: &Regex| {
        re.captures(reply)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    };

    ParsedReply {
        answer: capture(&ANSWER_RE).replace('\n', "<br>"),
        summary: capture(&SUMMARY_RE),
        topic: capture(&TOPIC_RE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(question: &str, answer: &str, similarity: f32) -> SearchHit {
        SearchHit {
            question: question.to_string(),
            answer: answer.to_string(),
            similarity,
        }
    }

    #[test]
    fn test_parse_all_fields() {
        let parsed = parse_reply(
            "ChatBot_Answer: Hi End_ChatBot_Answer ChatBot_Summary: s End_ChatBot_Summary ChatBot_Topic: t",
        );
        assert_eq!(parsed.answer, "Hi");
        assert_eq!(parsed.summary, "s");
        assert_eq!(parsed.topic, "t");
    }

    #[test]
    fn test_parse_without_markers_yields_empty_fields() {
        let parsed = parse_reply("no markers here");
        assert_eq!(parsed.answer, "");
        assert_eq!(parsed.summary, "");
        assert_eq!(parsed.topic, "");
    }

    #[test]
    fn test_parse_normalizes_answer_newlines() {
        let parsed = parse_reply(
            "ChatBot_Answer: line one\nline two End_ChatBot_Answer\nChatBot_Topic: xss",
        );
        assert_eq!(parsed.answer, "line one<br>line two");
        assert_eq!(parsed.topic, "xss");
        assert_eq!(parsed.summary, "");
    }

    #[test]
    fn test_parse_topic_stops_at_line_end() {
        let parsed = parse_reply("ChatBot_Topic: access control\ntrailing noise");
        assert_eq!(parsed.topic, "access control");
    }

    #[test]
    fn test_format_includes_grounding_for_best_hit_only() {
        let builder = PromptBuilder::new("OWASP".to_string());
        let memory = ConversationMemory::default();
        let hits = vec![
            hit("What is XSS?", "Cross-site scripting", 0.9),
            hit("What is CSRF?", "Request forgery", 0.7),
        ];

        let prompt = builder.format(&memory, "tell me about xss", &hits);

        assert!(prompt.contains("RAG_Question: What is XSS?"));
        assert!(prompt.contains("RAG_Answer: Cross-site scripting."));
        assert!(prompt.contains("Another related topic to consider: What is CSRF?"));
        assert!(!prompt.contains("RAG_Answer: Request forgery"));
    }

    #[test]
    fn test_format_without_hits_has_no_grounding_block() {
        let builder = PromptBuilder::new("OWASP".to_string());
        let memory = ConversationMemory::default();

        let prompt = builder.format(&memory, "What is XSS?", &[]);

        assert!(!prompt.contains("RAG_Question"));
        assert!(!prompt.contains("relevant background information"));
        assert!(prompt.contains("User prompt: \"What is XSS?\""));
        assert!(prompt.contains("Reserve Topic: OWASP."));
    }

    #[test]
    fn test_format_carries_memory_forward() {
        let builder = PromptBuilder::new("OWASP".to_string());
        let memory = ConversationMemory {
            previous_topic: "injection".to_string(),
            summary: "user asked about SQLi basics".to_string(),
        };

        let prompt = builder.format(&memory, "more please", &[]);

        assert!(prompt.contains("Topic: injection"));
        assert!(prompt.contains("Previous conversation summary: user asked about SQLi basics"));
    }

    #[test]
    fn test_format_is_deterministic() {
        let builder = PromptBuilder::new("OWASP".to_string());
        let memory = ConversationMemory::default();
        let hits = vec![hit("q", "a", 0.8)];

        assert_eq!(
            builder.format(&memory, "m", &hits),
            builder.format(&memory, "m", &hits)
        );
    }
}
