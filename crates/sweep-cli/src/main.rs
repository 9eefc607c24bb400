mod bootstrap_helpers;
mod cli_args;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use sweep_discord_runtime::{
    run_discord_bot, run_purge, PurgeRequest, CHECKPOINTS_FILE_NAME,
};
use sweep_engine::{Checkpoint, CheckpointStore, JsonFileCheckpointStore, RunSummary};

use bootstrap_helpers::{init_tracing, resolve_bot_token, runtime_config_from_args};
use cli_args::{CheckpointsCommand, Cli, CliCommand};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match &cli.command {
        CliCommand::Bot => {
            let token = resolve_bot_token(
                cli.runtime.discord_token.as_deref(),
                std::env::var("TOKEN").ok(),
            )?;
            tracing::info!(
                state_dir = %cli.runtime.state_dir.display(),
                prefix = %cli.runtime.command_prefix,
                "starting sweep discord bot"
            );
            run_discord_bot(runtime_config_from_args(&cli.runtime, token)).await
        }
        CliCommand::Purge(purge) => {
            let token = resolve_bot_token(
                cli.runtime.discord_token.as_deref(),
                std::env::var("TOKEN").ok(),
            )?;
            let config = runtime_config_from_args(&cli.runtime, token);
            let summary = run_purge(
                &config,
                PurgeRequest {
                    channel_id: purge.channel,
                    author_id: purge.author,
                    start_from: purge.start_from,
                },
            )
            .await?;
            println!("{}", render_purge_summary(&summary));
            Ok(())
        }
        CliCommand::Checkpoints { command } => {
            let store = JsonFileCheckpointStore::open(
                cli.runtime.state_dir.join(CHECKPOINTS_FILE_NAME),
            )
            .with_context(|| {
                format!(
                    "failed to open checkpoints in {}",
                    cli.runtime.state_dir.display()
                )
            })?;
            run_checkpoints_command(&store, command).await
        }
    }
}

async fn run_checkpoints_command(
    store: &JsonFileCheckpointStore,
    command: &CheckpointsCommand,
) -> Result<()> {
    match command {
        CheckpointsCommand::List => {
            let checkpoints = store.list().await.context("failed to list checkpoints")?;
            println!("{}", render_checkpoint_table(store.path(), &checkpoints));
        }
        CheckpointsCommand::Clear { channel } => {
            let removed = store
                .clear(*channel)
                .await
                .with_context(|| format!("failed to clear checkpoint for channel {channel}"))?;
            if removed {
                println!("cleared checkpoint for channel {channel}");
            } else {
                println!("no checkpoint stored for channel {channel}");
            }
        }
    }
    Ok(())
}

fn render_purge_summary(summary: &RunSummary) -> String {
    format!(
        "purge {}: channel={} author={} examined={} deleted={} skipped={} failed={} rate_limited={} elapsed={:.2}s final_cursor={}",
        summary.outcome.as_str(),
        summary.channel_id,
        summary.author_id,
        summary.counters.examined,
        summary.counters.deleted,
        summary.counters.skipped,
        summary.counters.failed,
        summary.counters.rate_limited,
        summary.elapsed.as_secs_f64(),
        summary
            .final_cursor
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string()),
    )
}

fn render_checkpoint_table(path: &Path, checkpoints: &[Checkpoint]) -> String {
    if checkpoints.is_empty() {
        return format!("no checkpoints in {}", path.display());
    }
    let mut lines = vec![format!("checkpoints in {}:", path.display())];
    for checkpoint in checkpoints {
        let updated = chrono::DateTime::from_timestamp_millis(checkpoint.updated_unix_ms as i64)
            .map(|timestamp| timestamp.to_rfc3339())
            .unwrap_or_else(|| checkpoint.updated_unix_ms.to_string());
        lines.push(format!(
            "channel={} author={} resume_before={} examined={} deleted={} updated={}",
            checkpoint.channel_id,
            checkpoint.author_id,
            checkpoint.message_id,
            checkpoint.examined,
            checkpoint.deleted,
            updated,
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use sweep_engine::{
        Checkpoint, CheckpointStore, ChannelId, JsonFileCheckpointStore, MessageId, UserId,
    };
    use tempfile::tempdir;

    use super::{render_checkpoint_table, run_checkpoints_command};
    use crate::cli_args::CheckpointsCommand;

    #[test]
    fn unit_render_checkpoint_table_handles_empty_and_rows() {
        assert_eq!(
            render_checkpoint_table(Path::new("state/checkpoints.json"), &[]),
            "no checkpoints in state/checkpoints.json"
        );
        let mut checkpoint = Checkpoint::new(ChannelId(55), MessageId(900), UserId(8), 12, 3);
        checkpoint.updated_unix_ms = 0;
        let table = render_checkpoint_table(Path::new("state/checkpoints.json"), &[checkpoint]);
        assert!(table.contains("channel=55 author=8 resume_before=900 examined=12 deleted=3"));
        assert!(table.contains("updated=1970-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn functional_checkpoints_clear_removes_only_target_channel() {
        let temp = tempdir().expect("tempdir");
        let store = JsonFileCheckpointStore::open(temp.path().join("checkpoints.json"))
            .expect("store");
        store
            .save(Checkpoint::new(ChannelId(1), MessageId(10), UserId(8), 1, 1))
            .await
            .expect("save first");
        store
            .save(Checkpoint::new(ChannelId(2), MessageId(20), UserId(8), 2, 2))
            .await
            .expect("save second");

        run_checkpoints_command(
            &store,
            &CheckpointsCommand::Clear {
                channel: ChannelId(1),
            },
        )
        .await
        .expect("clear");
        let remaining = store.list().await.expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].channel_id, ChannelId(2));
    }
}
