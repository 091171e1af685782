//! CLI entry point: parses flags, builds an `Engine`, and drives one
//! torrent or magnet link to completion, reporting progress as it goes.
use bitengine::config::{Args, Config};
use bitengine::engine::{Engine, TaskState};
use clap::Parser;
use std::path::Path;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::from(&args);
    let engine = Engine::new(config);

    let info_hash = if args.source.starts_with("magnet:") {
        let link = engine.add_magnet(&args.source).await;
        match link {
            Ok(link) => link.info_hash,
            Err(e) => {
                eprintln!("cannot start download from magnet link: {e}");
                return Err(e.into());
            }
        }
    } else {
        engine.add_torrent_file(Path::new(&args.source)).await?
    };

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Some(row) = engine.status(&info_hash).await else {
            break;
        };
        println!(
            "{} [{}] {:.1}% ({} peers)",
            row.name,
            state_label(row.state),
            row.progress,
            row.connected_peers
        );
        if matches!(row.state, TaskState::Completed | TaskState::Failed | TaskState::Stalled) {
            break;
        }
    }

    Ok(())
}

fn state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::Queued => "queued",
        TaskState::Downloading => "downloading",
        TaskState::Paused => "paused",
        TaskState::Stalled => "stalled",
        TaskState::Completed => "completed",
        TaskState::Failed => "failed",
    }
}
