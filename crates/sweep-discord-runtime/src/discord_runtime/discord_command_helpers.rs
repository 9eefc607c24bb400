//! Chat command parsing and reply rendering.

use sweep_engine::{MessageId, RunSnapshot, RunSummary, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepCommand {
    Delete {
        author: UserId,
        start_from: Option<MessageId>,
    },
    Cancel,
    Status,
    Help,
    Invalid {
        message: String,
    },
}

pub(super) const REPLY_ALREADY_RUNNING: &str =
    "A deletion process is already in progress in this channel. Please wait until it finishes.";
pub(super) const REPLY_CANCEL_REQUESTED: &str =
    "Cancellation requested for the deletion process in this channel.";
pub(super) const REPLY_NO_ACTIVE_RUN: &str =
    "No deletion process is currently in progress in this channel.";
pub(super) const REPLY_MISSING_PERMISSION: &str = "You don't have permission to delete messages.";

pub fn sweep_command_usage(prefix: &str) -> String {
    [
        "Supported commands:".to_string(),
        format!("- `{prefix}d <@user|user_id> [message_id]` delete a user's messages in this channel"),
        format!("- `{prefix}cancel` stop the deletion in progress"),
        format!("- `{prefix}status` show progress of the deletion in progress"),
        format!("- `{prefix}help`"),
    ]
    .join("\n")
}

/// Accepts `<@id>`, `<@!id>` or a bare id.
pub fn parse_user_reference(raw: &str) -> Option<UserId> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix("<@")
        .and_then(|rest| rest.strip_suffix('>'))
        .map(|rest| rest.strip_prefix('!').unwrap_or(rest))
        .unwrap_or(trimmed);
    inner.parse::<UserId>().ok().filter(|id| id.get() > 0)
}

/// Returns `None` for messages that are not addressed to the bot.
pub fn parse_sweep_command(content: &str, prefix: &str) -> Option<SweepCommand> {
    let trimmed = content.trim();
    let body = trimmed.strip_prefix(prefix)?;
    if body.starts_with(char::is_whitespace) {
        return None;
    }
    let mut pieces = body.split_whitespace();
    let command = pieces.next()?;
    let args = pieces.collect::<Vec<_>>();

    let parsed = match command {
        "d" => match args.as_slice() {
            [user] => match parse_user_reference(user) {
                Some(author) => SweepCommand::Delete {
                    author,
                    start_from: None,
                },
                None => invalid_delete_usage(prefix),
            },
            [user, message_id] => {
                match (parse_user_reference(user), message_id.parse::<MessageId>()) {
                    (Some(author), Ok(start_from)) => SweepCommand::Delete {
                        author,
                        start_from: Some(start_from),
                    },
                    _ => invalid_delete_usage(prefix),
                }
            }
            _ => invalid_delete_usage(prefix),
        },
        "cancel" => no_args(&args, SweepCommand::Cancel, prefix, "cancel"),
        "status" => no_args(&args, SweepCommand::Status, prefix, "status"),
        "help" => no_args(&args, SweepCommand::Help, prefix, "help"),
        _ => return None,
    };
    Some(parsed)
}

fn invalid_delete_usage(prefix: &str) -> SweepCommand {
    SweepCommand::Invalid {
        message: format!("Usage: {prefix}d <@user|user_id> [message_id]"),
    }
}

fn no_args(args: &[&str], command: SweepCommand, prefix: &str, name: &str) -> SweepCommand {
    if args.is_empty() {
        command
    } else {
        SweepCommand::Invalid {
            message: format!("Usage: {prefix}{name}"),
        }
    }
}

pub(super) fn render_status(snapshot: Option<&RunSnapshot>) -> String {
    let Some(snapshot) = snapshot else {
        return REPLY_NO_ACTIVE_RUN.to_string();
    };
    let cursor = snapshot
        .cursor
        .map(|id| id.to_string())
        .unwrap_or_else(|| "newest".to_string());
    format!(
        "Deleting messages from <@{}>: status={} examined={} deleted={} failed={} cursor={} elapsed={}s{}",
        snapshot.author_id,
        snapshot.status.as_str(),
        snapshot.counters.examined,
        snapshot.counters.deleted,
        snapshot.counters.failed,
        cursor,
        snapshot.elapsed_ms / 1_000,
        if snapshot.cancel_requested {
            " (cancellation requested)"
        } else {
            ""
        }
    )
}

pub(super) fn render_summary(summary: &RunSummary) -> String {
    format!(
        "Deleted {} messages from <@{}> in {:.2} seconds ({}, examined {}).",
        summary.counters.deleted,
        summary.author_id,
        summary.elapsed.as_secs_f64(),
        summary.outcome.as_str(),
        summary.counters.examined,
    )
}

#[cfg(test)]
mod tests {
    use sweep_engine::{MessageId, UserId};

    use super::{parse_sweep_command, parse_user_reference, sweep_command_usage, SweepCommand};

    #[test]
    fn unit_parse_user_reference_accepts_mentions_and_raw_ids() {
        assert_eq!(parse_user_reference("<@42>"), Some(UserId(42)));
        assert_eq!(parse_user_reference("<@!42>"), Some(UserId(42)));
        assert_eq!(parse_user_reference("42"), Some(UserId(42)));
        assert_eq!(parse_user_reference("<#42>"), None);
        assert_eq!(parse_user_reference("alice"), None);
        assert_eq!(parse_user_reference("0"), None);
    }

    #[test]
    fn functional_parse_delete_command_with_optional_start() {
        assert_eq!(
            parse_sweep_command("!d <@7>", "!"),
            Some(SweepCommand::Delete {
                author: UserId(7),
                start_from: None,
            })
        );
        assert_eq!(
            parse_sweep_command("  !d 7 900  ", "!"),
            Some(SweepCommand::Delete {
                author: UserId(7),
                start_from: Some(MessageId(900)),
            })
        );
        assert!(matches!(
            parse_sweep_command("!d", "!"),
            Some(SweepCommand::Invalid { .. })
        ));
        assert!(matches!(
            parse_sweep_command("!d 7 nope", "!"),
            Some(SweepCommand::Invalid { .. })
        ));
    }

    #[test]
    fn functional_parse_control_commands_and_ignore_other_messages() {
        assert_eq!(parse_sweep_command("!cancel", "!"), Some(SweepCommand::Cancel));
        assert_eq!(parse_sweep_command("!status", "!"), Some(SweepCommand::Status));
        assert_eq!(parse_sweep_command("?help", "?"), Some(SweepCommand::Help));
        assert!(matches!(
            parse_sweep_command("!cancel now", "!"),
            Some(SweepCommand::Invalid { .. })
        ));
        assert_eq!(parse_sweep_command("hello there", "!"), None);
        assert_eq!(parse_sweep_command("!unknown", "!"), None);
        assert_eq!(parse_sweep_command("!", "!"), None);
        assert_eq!(parse_sweep_command("! cancel", "!"), None);
    }

    #[test]
    fn unit_usage_mentions_every_command() {
        let usage = sweep_command_usage("!");
        for command in ["!d", "!cancel", "!status", "!help"] {
            assert!(usage.contains(command), "missing {command}");
        }
    }
}
