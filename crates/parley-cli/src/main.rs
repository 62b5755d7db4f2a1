//! # parley
//!
//! Terminal client for a Parley hub. `parley watch` signs in with a bearer
//! token and logs connection changes, presence, notifications, messages and
//! calls until Ctrl-C. `parley settings` prints the effective settings.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use parley_api::{HttpApiClient, StaticTokenProvider, TokenProvider};
use parley_core::ids::UserId;
use parley_core::logging::{init_json_subscriber, init_subscriber};
use parley_realtime::{ConnectionError, ParleyError, RealtimeSession};
use parley_settings::ParleySettings;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Parley realtime client.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Parley realtime client", version)]
struct Cli {
    /// Settings file (default `~/.parley/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and log realtime activity until Ctrl-C.
    Watch {
        /// Bearer token for the hub and the API.
        #[arg(long)]
        token: String,

        /// Hub URL (overrides settings).
        #[arg(long)]
        hub: Option<String>,

        /// Users whose presence to follow.
        #[arg(long, value_delimiter = ',')]
        users: Vec<String>,

        /// The signed-in user's id.
        #[arg(long)]
        me: Option<String>,

        /// Log one JSON object per line.
        #[arg(long)]
        json: bool,
    },
    /// Print the effective settings as JSON.
    Settings,
}

fn load_settings(path: Option<&Path>) -> Result<ParleySettings> {
    let path = path.map_or_else(parley_settings::settings_path, Path::to_path_buf);
    parley_settings::load_settings_from_path(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))
}

/// Log every item of `rx` with `log` until the sender goes away.
fn follow<T, F>(tasks: &mut JoinSet<()>, mut rx: broadcast::Receiver<T>, log: F)
where
    T: Clone + Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let _ = tasks.spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => log(item),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn watch(
    settings: ParleySettings,
    token: String,
    users: Vec<String>,
    me: Option<String>,
) -> Result<()> {
    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(token));
    let api = Arc::new(
        HttpApiClient::new(&settings.api, Arc::clone(&tokens)).context("invalid API settings")?,
    );

    let mut builder = RealtimeSession::builder(settings, api.clone(), tokens).with_push(api);
    if let Some(me) = me {
        builder = builder.with_local_user(me);
    }
    let session = builder.build();

    let mut tasks = JoinSet::new();
    follow(&mut tasks, session.connection().subscribe_state(), |t| {
        info!(from = %t.from, to = %t.to, epoch = t.epoch, "connection");
    });
    follow(&mut tasks, session.notifications().subscribe(), |change| {
        info!(added = change.added.len(), read_changed = change.read_changed.len(), unread = change.unread, "notifications");
    });
    follow(&mut tasks, session.conversations().subscribe(), |update| {
        info!(conversation_id = %update.conversation_id, unread = update.activity.unread, preview = update.activity.preview.as_deref(), "message");
    });
    follow(&mut tasks, session.calls().subscribe(), |update| {
        info!(call_id = %update.call_id, from = %update.transition.from, to = %update.transition.to, "call");
    });
    follow(&mut tasks, session.subscribe_resync(), |report| {
        info!(epoch = report.epoch, complete = report.is_complete(), "resync");
    });

    match session.start().await {
        Ok(()) => {}
        Err(ParleyError::Connection(ConnectionError::Transport(error))) => {
            warn!(%error, "hub unreachable, retrying in the background");
        }
        Err(error) => bail!("could not start session: {error}"),
    }

    for user in users {
        let user = UserId::new(user);
        let mut rx = session.presence().subscribe(&user);
        let _ = tasks.spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                info!(user_id = %user, %status, "presence");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");
    session.shutdown().await;
    tasks.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.settings.as_deref())?;

    match cli.command {
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Watch {
            token,
            hub,
            users,
            me,
            json,
        } => {
            if json {
                init_json_subscriber(&settings.logging.level);
            } else {
                init_subscriber(&settings.logging.level);
            }
            if let Some(hub) = hub {
                settings.hub.url = hub;
            }
            watch(settings, token, users, me).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_watch_arguments() {
        let cli = Cli::parse_from([
            "parley",
            "watch",
            "--token",
            "t",
            "--users",
            "alice,bob",
            "--hub",
            "ws://hub.test/hub",
        ]);
        match cli.command {
            Command::Watch { token, users, hub, me, json } => {
                assert_eq!(token, "t");
                assert_eq!(users, vec!["alice", "bob"]);
                assert_eq!(hub.as_deref(), Some("ws://hub.test/hub"));
                assert!(me.is_none());
                assert!(!json);
            }
            Command::Settings => panic!("expected watch"),
        }
    }

    #[test]
    fn watch_requires_token() {
        assert!(Cli::try_parse_from(["parley", "watch"]).is_err());
    }

    #[test]
    fn settings_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"calls": {"ringTimeoutMs": 1000}}"#).unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.calls.ring_timeout_ms, 1000);
        assert_eq!(settings.notifications.page_size, ParleySettings::default().notifications.page_size);
    }

    #[test]
    fn broken_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_settings(Some(&path)).is_err());
    }
}
