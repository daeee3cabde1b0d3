//! Chat commands users can send the bot when no alert conversation is in flight.

use std::time::Duration;

use crate::{
    messages,
    store::MAX_IGNORE_REASON_CHARS,
    utils::{parse_duration, MAX_IGNORE_DURATION},
};

/// Prefix that forces command handling mid-conversation.
pub const COMMAND_PREFIX: char = '!';

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Hi,
    Help,
    /// Create a test alert for the sender.
    Test,
    /// Ignore the last answered alert title for a while.
    Ignore { duration: Duration, reason: String },
    /// Known command, unusable arguments; carries the usage text.
    BadArgs(&'static str),
    Unknown(String),
}

#[derive(Clone, Copy)]
enum Kind {
    Hi,
    Help,
    Test,
    Ignore,
}

struct CommandSpec {
    kind: Kind,
    names: &'static [&'static str],
    usage: &'static str,
    summary: &'static str,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        kind: Kind::Hi,
        names: &["hi", "hello", "hey"],
        usage: "hi",
        summary: "say hello",
    },
    CommandSpec {
        kind: Kind::Help,
        names: &["help", "commands"],
        usage: "help",
        summary: "show this message",
    },
    CommandSpec {
        kind: Kind::Test,
        names: &["test"],
        usage: "test",
        summary: "send yourself a test alert",
    },
    CommandSpec {
        kind: Kind::Ignore,
        names: &["ignore"],
        usage: "ignore <duration> [reason]",
        summary: "stop alerting you about your last answered alert for a while (max 7d)",
    },
];

/// Parse a DM into a command. Returns `None` for blank input.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let text = text.strip_prefix(COMMAND_PREFIX).unwrap_or(text).trim();
    if text.is_empty() {
        return None;
    }

    let (name, args) = match text.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (text, ""),
    };
    let name = name.to_lowercase();
    let name = name.trim_end_matches(&['!', '?', '.', ','][..]);

    let kind = COMMANDS
        .iter()
        .find(|c| c.names.contains(&name))
        .map(|c| c.kind);
    let cmd = match kind {
        Some(Kind::Hi) => Command::Hi,
        Some(Kind::Help) => Command::Help,
        Some(Kind::Test) => Command::Test,
        Some(Kind::Ignore) => parse_ignore(args),
        None => Command::Unknown(name.to_string()),
    };
    Some(cmd)
}

fn parse_ignore(args: &str) -> Command {
    let (raw_duration, reason) = match args.split_once(char::is_whitespace) {
        Some((d, r)) => (d, r.trim()),
        None => (args, ""),
    };

    if reason.chars().count() > MAX_IGNORE_REASON_CHARS {
        return Command::BadArgs(messages::IGNORE_REASON_TOO_LONG);
    }
    match parse_duration(raw_duration) {
        Ok(duration) if duration <= MAX_IGNORE_DURATION => Command::Ignore {
            duration,
            reason: reason.to_string(),
        },
        _ => Command::BadArgs(messages::IGNORE_USAGE),
    }
}

/// `help` output listing every command.
pub fn help_text() -> String {
    let mut lines = vec!["Here's what I understand:".to_string()];
    for spec in COMMANDS {
        let aliases = if spec.names.len() > 1 {
            format!(" (also {})", spec.names[1..].join(", "))
        } else {
            String::new()
        };
        lines.push(format!("• `{}`{aliases}: {}", spec.usage, spec.summary));
    }
    lines.push(format!(
        "While I'm asking you about an alert, prefix a command with `{COMMAND_PREFIX}` (e.g. `{COMMAND_PREFIX}help`)."
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands_case_insensitively() {
        assert_eq!(parse_command("Hi!"), Some(Command::Hi));
        assert_eq!(parse_command("  HELP "), Some(Command::Help));
        assert_eq!(parse_command("!test"), Some(Command::Test));
        assert_eq!(parse_command("   "), None);
        assert_eq!(
            parse_command("dance now"),
            Some(Command::Unknown("dance".to_string()))
        );
    }

    #[test]
    fn parses_ignore_with_reason() {
        assert_eq!(
            parse_command("ignore 4h on call this week"),
            Some(Command::Ignore {
                duration: Duration::from_secs(4 * 3600),
                reason: "on call this week".to_string(),
            })
        );
        assert_eq!(
            parse_command("ignore 30m"),
            Some(Command::Ignore {
                duration: Duration::from_secs(1800),
                reason: String::new(),
            })
        );
    }

    #[test]
    fn ignore_rejects_bad_or_too_long_durations() {
        assert!(matches!(parse_command("ignore"), Some(Command::BadArgs(_))));
        assert!(matches!(
            parse_command("ignore forever"),
            Some(Command::BadArgs(_))
        ));
        assert!(matches!(parse_command("ignore 8d"), Some(Command::BadArgs(_))));
    }

    #[test]
    fn ignore_reason_fits_the_store() {
        let long = format!("ignore 4h {}", "x".repeat(MAX_IGNORE_REASON_CHARS + 1));
        assert_eq!(
            parse_command(&long),
            Some(Command::BadArgs(messages::IGNORE_REASON_TOO_LONG))
        );
        let fits = format!("ignore 4h {}", "x".repeat(MAX_IGNORE_REASON_CHARS));
        assert!(matches!(parse_command(&fits), Some(Command::Ignore { .. })));
    }

    #[test]
    fn every_listed_name_parses() {
        for spec in COMMANDS {
            for name in spec.names {
                let parsed = parse_command(name);
                assert!(
                    !matches!(parsed, Some(Command::Unknown(_))),
                    "{name} is listed in help but not parsed"
                );
            }
        }
    }

    #[test]
    fn help_lists_every_command() {
        let help = help_text();
        for spec in COMMANDS {
            assert!(help.contains(spec.usage));
        }
    }
}
