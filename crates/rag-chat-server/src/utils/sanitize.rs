use once_cell::sync::Lazy;
use regex::Regex;

// Script and style elements are removed together with their content;
// a stripped <script> tag must not leave its body behind as text.
static EMBEDDED_CONTENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:script|style)\b[^>]*>.*?</(?:script|style)\s*>").unwrap()
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

// Shell/SQL metacharacters dropped from user input before it reaches
// the prompt or the conversation log.
static METACHAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[;&|$><`{}"'\\%]"#).unwrap());

static CONTROL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00\x08\x1a]").unwrap());

/// Strip HTML markup and shell/SQL metacharacters from a raw chat
/// message and trim surrounding whitespace. An empty result means the
/// message carried no usable content and must be rejected by the caller.
pub fn sanitize_message(input: &str) -> String {
    let no_embedded = EMBEDDED_CONTENT_RE.replace_all(input, "");
    let no_tags = TAG_RE.replace_all(&no_embedded, "");
    let no_meta = METACHAR_RE.replace_all(&no_tags, "");
    let clean = CONTROL_RE.replace_all(&no_meta, "");
    clean.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_element_fully_removed() {
        assert_eq!(sanitize_message("<script>alert(1)</script> hello"), "hello");
    }

    #[test]
    fn test_style_element_fully_removed() {
        assert_eq!(
            sanitize_message("<style>body { color: red }</style>question"),
            "question"
        );
    }

    #[test]
    fn test_markup_stripped_content_kept() {
        assert_eq!(
            sanitize_message("<b>What</b> is <i>XSS</i>?"),
            "What is XSS?"
        );
    }

    #[test]
    fn test_metacharacters_dropped() {
        assert_eq!(sanitize_message("a;b&c|d$e`f"), "abcdef");
        assert_eq!(sanitize_message(r#"it's a "test" 100%"#), "its a test 100");
    }

    #[test]
    fn test_whitespace_trimmed() {
        assert_eq!(sanitize_message("   spaced out   "), "spaced out");
    }

    #[test]
    fn test_empty_after_sanitization() {
        assert_eq!(sanitize_message("<script>alert(1)</script>"), "");
        assert_eq!(sanitize_message("   "), "");
        assert_eq!(sanitize_message(";;;"), "");
    }

    #[test]
    fn test_plain_message_unchanged() {
        assert_eq!(sanitize_message("What is XSS?"), "What is XSS?");
    }
}
