//! Identifier normalization and mention scanning.
//!
//! Entity ids (worlds, agents, chats) are kebab-case; log categories are
//! dot-hierarchical lower-case. Mentions are `@name` tokens inside free-form
//! message text; a *paragraph-begin* mention starts the first non-empty
//! paragraph of a message and decides who a message is addressed to.

/// Convert an arbitrary display name into a kebab-case identifier.
///
/// Alphanumerics are lowercased; every other run of characters collapses to a
/// single `-`. Leading and trailing dashes are trimmed.
///
/// ```
/// use worldllm::ids::to_kebab_case;
/// assert_eq!(to_kebab_case("My World"), "my-world");
/// assert_eq!(to_kebab_case("  Alice & Bob! "), "alice-bob");
/// assert_eq!(to_kebab_case("already-kebab"), "already-kebab");
/// ```
pub fn to_kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Normalize a log-category name to dot-hierarchical lower-case.
///
/// Underscores, dashes, slashes, and spaces all act as hierarchy separators;
/// repeated separators collapse. `LOG_LEVEL_WS_SERVER` style env suffixes
/// become `ws.server`.
pub fn normalize_category(category: &str) -> String {
    let mut out = String::with_capacity(category.len());
    let mut pending_dot = false;
    for ch in category.chars() {
        if ch.is_alphanumeric() {
            if pending_dot && !out.is_empty() {
                out.push('.');
            }
            pending_dot = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_dot = true;
        }
    }
    out
}

/// True when `ch` can appear inside a mention identifier.
fn is_mention_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '-' || ch == '_' || ch == '.'
}

/// Extract every `@name` mention in `text`, in order of appearance, with the
/// original casing preserved. Bare `@` signs and mentions inside words
/// (`a@b`) are ignored.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut mentions = Vec::new();
    let mut prev: Option<char> = None;
    for (i, ch) in text.char_indices() {
        if ch == '@' && prev.map_or(true, |p| !is_mention_char(p)) {
            let rest = &text[i + 1..];
            let end = rest
                .char_indices()
                .find(|(_, c)| !is_mention_char(*c))
                .map(|(j, _)| j)
                .unwrap_or(rest.len());
            if end > 0 {
                // Trim trailing punctuation that is part of the sentence, not
                // the identifier ("@alice." or "@alice,").
                let raw = &rest[..end];
                let trimmed = raw.trim_end_matches(|c| c == '.' || c == '-' || c == '_');
                if !trimmed.is_empty() {
                    mentions.push(trimmed.to_string());
                }
            }
        }
        prev = Some(ch);
    }
    mentions
}

/// Extract the mention that begins the first non-empty paragraph, if any.
///
/// The scan tolerates a single leading interjection word before the mention
/// ("Hey @alice, ...") and trailing punctuation after the identifier.
/// Mentions further into the paragraph do not count.
///
/// ```
/// use worldllm::ids::extract_paragraph_mention;
/// assert_eq!(extract_paragraph_mention("@alice can you help?"), Some("alice".to_string()));
/// assert_eq!(extract_paragraph_mention("Hey @Alice, got a minute?"), Some("Alice".to_string()));
/// assert_eq!(extract_paragraph_mention("I think @alice should do it"), None);
/// ```
pub fn extract_paragraph_mention(text: &str) -> Option<String> {
    let paragraph = text
        .split("\n\n")
        .map(|p| p.trim())
        .find(|p| !p.is_empty())?;

    let mut words = paragraph.split_whitespace();
    let first = words.next()?;
    let candidate = if first.starts_with('@') {
        first
    } else {
        // One interjection word is allowed before the mention, and only one.
        let second = words.next()?;
        if !second.starts_with('@') {
            return None;
        }
        second
    };

    let name: String = candidate[1..]
        .chars()
        .take_while(|c| is_mention_char(*c))
        .collect();
    let name = name
        .trim_end_matches(|c| c == '.' || c == '-' || c == '_')
        .to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Case-insensitive equality for identifiers and mention names.
pub fn id_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_case_basics() {
        assert_eq!(to_kebab_case("New World"), "new-world");
        assert_eq!(to_kebab_case("UPPER"), "upper");
        assert_eq!(to_kebab_case("a  b--c"), "a-b-c");
        assert_eq!(to_kebab_case("---"), "");
    }

    #[test]
    fn category_normalization() {
        assert_eq!(normalize_category("WS_SERVER"), "ws.server");
        assert_eq!(normalize_category("core.events"), "core.events");
        assert_eq!(normalize_category("Core/Events-Loop"), "core.events.loop");
    }

    #[test]
    fn mentions_preserve_casing_and_order() {
        let found = extract_mentions("ping @Alice then @bob, thanks");
        assert_eq!(found, vec!["Alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn mention_requires_word_boundary() {
        assert!(extract_mentions("mail me at user@example.com").is_empty());
        assert!(extract_mentions("just an @ sign").is_empty());
    }

    #[test]
    fn paragraph_mention_at_start() {
        assert_eq!(
            extract_paragraph_mention("@alice please review"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn paragraph_mention_tolerates_one_interjection() {
        assert_eq!(
            extract_paragraph_mention("Hey @alice, please review"),
            Some("alice".to_string())
        );
        assert_eq!(extract_paragraph_mention("Well then hey @alice"), None);
    }

    #[test]
    fn paragraph_mention_skips_empty_paragraphs() {
        assert_eq!(
            extract_paragraph_mention("\n\n  \n\n@bob take this one"),
            Some("bob".to_string())
        );
    }

    #[test]
    fn paragraph_mention_strips_trailing_punctuation() {
        assert_eq!(
            extract_paragraph_mention("@alice."),
            Some("alice".to_string())
        );
    }

    #[test]
    fn mid_sentence_mention_is_not_paragraph_begin() {
        assert_eq!(extract_paragraph_mention("I think @x should go first"), None);
    }

    #[test]
    fn later_paragraph_mentions_do_not_count() {
        assert_eq!(
            extract_paragraph_mention("Summary of the plan.\n\n@alice your part is below"),
            None
        );
    }
}
