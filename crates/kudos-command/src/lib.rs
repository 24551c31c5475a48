//! `/kudos` command parsing.
//!
//! Pure and deterministic: no I/O, identical input always yields
//! identical output. Mention recognition is polymorphic over the chat
//! platform's native bracketed-ID syntax, with a shared legacy `@name`
//! fallback.

use kudos_types::Identity;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Command prefix trimmed from the raw text when present.
pub const KUDOS_COMMAND: &str = "/kudos";

/// Errors returned when a command payload cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("command format: {usage}")]
    MissingArguments { usage: &'static str },
    #[error("user must be mentioned with @name or {mention_form}")]
    UnrecognizedMention { mention_form: &'static str },
}

/// Target mention plus normalized free-text description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub target: Identity,
    pub description: String,
}

/// One chat platform's bracketed-ID mention form.
pub trait MentionSyntax {
    /// Extracts the platform-local external user id when `token` is a
    /// platform-native mention, e.g. `<@U123>` or `<users/123>`.
    fn explicit_id(&self, token: &str) -> Option<String>;

    /// Human-readable mention form echoed in usage hints.
    fn mention_form(&self) -> &'static str;

    /// Usage line echoed back on malformed commands.
    fn usage(&self) -> &'static str {
        "/kudos @user description"
    }
}

/// Slack `<@U1234567890>` mentions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlackMentions;

impl MentionSyntax for SlackMentions {
    fn explicit_id(&self, token: &str) -> Option<String> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^<@([A-Z0-9]+)>$").expect("slack mention pattern")
        });
        pattern
            .captures(token)
            .map(|captures| captures[1].to_string())
    }

    fn mention_form(&self) -> &'static str {
        "<@USER_ID>"
    }
}

/// Google Chat `<users/USER_ID>` mentions.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleChatMentions;

impl MentionSyntax for GoogleChatMentions {
    fn explicit_id(&self, token: &str) -> Option<String> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^<users/([^>]+)>$").expect("google chat mention pattern")
        });
        pattern
            .captures(token)
            .map(|captures| captures[1].to_string())
    }

    fn mention_form(&self) -> &'static str {
        "<users/USER_ID>"
    }
}

/// Parses a `/kudos` command into a target mention and description.
///
/// The command prefix is optional because some platforms strip it before
/// delivery (Google Chat's `argumentText`) while others keep it in the
/// payload text. Runs of whitespace in the description collapse to
/// single spaces.
pub fn parse_command(
    syntax: &dyn MentionSyntax,
    raw_text: &str,
) -> Result<ParsedCommand, CommandParseError> {
    let text = raw_text.trim();
    let text = text.strip_prefix(KUDOS_COMMAND).unwrap_or(text).trim();

    let mut tokens = text.split_whitespace();
    let mention_token = tokens.next().ok_or(CommandParseError::MissingArguments {
        usage: syntax.usage(),
    })?;
    let description = tokens.collect::<Vec<_>>().join(" ");
    if description.is_empty() {
        return Err(CommandParseError::MissingArguments {
            usage: syntax.usage(),
        });
    }

    let target = if let Some(external_id) = syntax.explicit_id(mention_token) {
        Identity::External(external_id)
    } else if let Some(username) = mention_token.strip_prefix('@') {
        if username.is_empty() {
            return Err(CommandParseError::UnrecognizedMention {
                mention_form: syntax.mention_form(),
            });
        }
        Identity::Username(username.to_string())
    } else {
        return Err(CommandParseError::UnrecognizedMention {
            mention_form: syntax.mention_form(),
        });
    };

    Ok(ParsedCommand {
        target,
        description,
    })
}
