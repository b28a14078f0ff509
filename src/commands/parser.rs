//! Parser for bot commands in comment text.
//!
//! A pure parser that extracts structured commands from unstructured comment
//! text, so the webhook layer can stay free of string matching.

use super::types::Command;

/// Parses the first bot command found in comment text.
///
/// # Parsing Rules
///
/// - The trigger `@{bot_name}` is case-insensitive (like forge mentions)
/// - The trigger must be at a word boundary (not preceded by alphanumerics)
/// - Command names (`merge`, `cancel`) are case-insensitive
/// - Whitespace between tokens is flexible
/// - If multiple commands are present, the first valid one wins
/// - Returns `None` if no valid command is found
pub fn parse_command(text: &str, bot_name: &str) -> Option<Command> {
    let trigger = format!("@{}", bot_name);
    let mut search_start = 0;
    while let Some(abs_pos) = find_trigger(text, search_start, &trigger) {
        let after_trigger = &text[abs_pos + trigger.len()..];

        if let Some(cmd) = try_parse_after_trigger(after_trigger) {
            return Some(cmd);
        }

        search_start = abs_pos + trigger.len();
    }
    None
}

/// Finds the next occurrence of the trigger (case-insensitive) at a valid
/// word boundary. Returns the byte position of the `@` character if found.
fn find_trigger(text: &str, start: usize, trigger: &str) -> Option<usize> {
    let mut search_pos = start;

    while search_pos < text.len() {
        let at_pos = text[search_pos..].find('@')?;
        let abs_pos = search_pos + at_pos;

        // May be None if the end lands inside a multi-byte UTF-8 character
        if let Some(candidate) = text.get(abs_pos..abs_pos + trigger.len())
            && candidate.eq_ignore_ascii_case(trigger)
        {
            // Left boundary: start of string or a non-alphanumeric character
            let valid_boundary = abs_pos == 0
                || text[..abs_pos]
                    .chars()
                    .next_back()
                    .is_some_and(|c| !c.is_alphanumeric());
            if valid_boundary {
                return Some(abs_pos);
            }
        }

        search_pos = abs_pos + 1;
    }
    None
}

/// Attempts to parse a command from text immediately following the trigger.
fn try_parse_after_trigger(text: &str) -> Option<Command> {
    // At least one whitespace character must separate trigger and command
    let text = text.strip_prefix(|c: char| c.is_ascii_whitespace())?;
    let text = text.trim_start();

    let cmd_word = text
        .split_whitespace()
        .next()
        .unwrap_or("");

    match cmd_word.to_ascii_lowercase().as_str() {
        "merge" => Some(Command::Merge),
        "cancel" => Some(Command::Cancel),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: &str = "merge-queue";

    #[test]
    fn parses_merge_and_cancel() {
        assert_eq!(parse_command("@merge-queue merge", BOT), Some(Command::Merge));
        assert_eq!(parse_command("@merge-queue cancel", BOT), Some(Command::Cancel));
    }

    #[test]
    fn trigger_is_case_insensitive() {
        assert_eq!(parse_command("@Merge-Queue merge", BOT), Some(Command::Merge));
        assert_eq!(parse_command("@MERGE-QUEUE MERGE", BOT), Some(Command::Merge));
    }

    #[test]
    fn trigger_must_be_at_word_boundary() {
        assert_eq!(parse_command("foo@merge-queue merge", BOT), None);
        assert_eq!(parse_command("see @merge-queue merge", BOT), Some(Command::Merge));
        assert_eq!(parse_command("(@merge-queue merge)", BOT), Some(Command::Merge));
    }

    #[test]
    fn command_embedded_in_longer_comment() {
        let text = "LGTM!\n\n@merge-queue merge\n\nthanks";
        assert_eq!(parse_command(text, BOT), Some(Command::Merge));
    }

    #[test]
    fn first_valid_command_wins() {
        let text = "@merge-queue merge and then @merge-queue cancel";
        assert_eq!(parse_command(text, BOT), Some(Command::Merge));
    }

    #[test]
    fn invalid_first_mention_does_not_block_later_ones() {
        let text = "@merge-queue please @merge-queue cancel";
        assert_eq!(parse_command(text, BOT), Some(Command::Cancel));
    }

    #[test]
    fn unknown_commands_are_ignored() {
        assert_eq!(parse_command("@merge-queue dance", BOT), None);
        assert_eq!(parse_command("@merge-queue", BOT), None);
        assert_eq!(parse_command("no command here", BOT), None);
    }

    #[test]
    fn custom_bot_name() {
        assert_eq!(parse_command("@merge-queue merge", "landing-bot"), None);
        assert_eq!(parse_command("@landing-bot merge", "landing-bot"), Some(Command::Merge));
    }

    #[test]
    fn multibyte_text_does_not_panic() {
        assert_eq!(parse_command("émoji 🎉 @merge-queue merge", BOT), Some(Command::Merge));
        assert_eq!(parse_command("@🎉", BOT), None);
    }
}
