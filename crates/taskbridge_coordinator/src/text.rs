//! Chat-surface text helpers.
//!
//! The chat adapter renders task state into messages and embed fields; these
//! helpers enforce the surface's hard caps. Splitting prefers the last
//! newline inside the cap so code blocks break between lines, with a hard
//! split as the fallback.

use taskbridge_protocol::defaults::{CHAT_MESSAGE_CAP, EMBED_FIELD_CAP, PROMPT_DISPLAY_CAP};

/// Split a long output into chat-sized chunks; overflow spills to secondary
/// thread messages.
pub fn split_message(text: &str) -> Vec<String> {
    split_with_cap(text, CHAT_MESSAGE_CAP)
}

/// Cap one embed field's worth of text.
pub fn clamp_embed_field(text: &str) -> String {
    truncate_chars(text, EMBED_FIELD_CAP)
}

/// Short prompt preview shown in task embeds.
pub fn prompt_preview(prompt: &str) -> String {
    truncate_chars(prompt, PROMPT_DISPLAY_CAP)
}

/// Truncate to `cap` characters, ending in an ellipsis when cut.
pub fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let mut out: String = text.chars().take(cap.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn split_with_cap(text: &str, cap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    loop {
        if rest.chars().count() <= cap {
            chunks.push(rest.to_string());
            return chunks;
        }

        // Byte offset of the first char past the cap.
        let cap_byte = rest
            .char_indices()
            .nth(cap)
            .map(|(offset, _)| offset)
            .unwrap_or(rest.len());
        let window = &rest[..cap_byte];

        match window.rfind('\n') {
            Some(newline) => {
                chunks.push(rest[..newline].to_string());
                rest = &rest[newline + 1..];
            }
            None => {
                chunks.push(window.to_string());
                rest = &rest[cap_byte..];
            }
        }
    }
}
