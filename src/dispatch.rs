// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Command routing.
//!
//! The registry is built once and handed to each [`Dispatcher`] by
//! reference. Parsing and rendering of the chat-side command surface stay with
//! the caller; this module only turns a named invocation with string options
//! into a typed [`CommandReply`].
//!
//! | Command         | Options                      | Routes to                          |
//! |-----------------|------------------------------|------------------------------------|
//! | `leaderboard`   | `page`, `channel`, `date`    | [`TallyService::leaderboard`]      |
//! | `sync-full`     | `workers`                    | [`TallyService::full_resync`]      |
//! | `sync-messages` |                              | [`TallyService::incremental_sync`] |
//! | `sync-missing`  |                              | [`TallyService::catch_up`]         |

use std::collections::HashMap;
use std::fmt;

use tracing::{info, warn};

use crate::activity::{parse_date, LeaderboardFilter};
use crate::leaderboard::{LeaderboardPage, LeaderboardQuery};
use crate::metrics;
use crate::service::TallyService;
use crate::sync::{SyncError, SyncMode, SyncReport, SyncRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Leaderboard,
    SyncFull,
    SyncMessages,
    SyncMissing,
}

impl CommandKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Leaderboard => "leaderboard",
            Self::SyncFull => "sync-full",
            Self::SyncMessages => "sync-messages",
            Self::SyncMissing => "sync-missing",
        }
    }

    const ALL: [CommandKind; 4] = [Self::Leaderboard, Self::SyncFull, Self::SyncMessages, Self::SyncMissing];
}

/// Immutable name → command mapping.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandKind>,
}

impl CommandRegistry {
    /// The four built-in commands.
    #[must_use]
    pub fn standard() -> Self {
        Self::with_commands(&CommandKind::ALL)
    }

    /// A registry exposing only `kinds`.
    #[must_use]
    pub fn with_commands(kinds: &[CommandKind]) -> Self {
        Self {
            commands: kinds.iter().map(|kind| (kind.name(), *kind)).collect(),
        }
    }

    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<CommandKind> {
        self.commands.get(name).copied()
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.commands.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// One command as received from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub name: String,
    /// `None` when invoked from a direct message.
    pub guild_id: Option<String>,
    pub user_id: String,
    pub options: HashMap<String, String>,
}

impl Invocation {
    pub fn new(name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guild_id: None,
            user_id: user_id.into(),
            options: HashMap::new(),
        }
    }

    #[must_use]
    pub fn in_guild(mut self, guild_id: impl Into<String>) -> Self {
        self.guild_id = Some(guild_id.into());
        self
    }

    #[must_use]
    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str).map(str::trim).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Leaderboard(LeaderboardPage),
    SyncCompleted(SyncReport),
    /// Another sync holds the guild's lock.
    SyncBusy { holder: String },
    /// Catch-up requested before any sync recorded an anchor.
    NoAnchor,
    /// Catch-up requested while a full or incremental sync is unfinished.
    RebuildPending { mode: SyncMode },
    SyncFailed(String),
    /// Leaderboard backends are down.
    Unavailable(String),
    InvalidOption { option: &'static str, reason: String },
    GuildOnly,
    UnknownCommand(String),
}

impl CommandReply {
    /// Metric label for the reply.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Leaderboard(_) | Self::SyncCompleted(_) => "success",
            Self::SyncBusy { .. } => "busy",
            Self::NoAnchor => "no_anchor",
            Self::RebuildPending { .. } => "rebuild_pending",
            Self::SyncFailed(_) => "failed",
            Self::Unavailable(_) => "unavailable",
            Self::InvalidOption { .. } | Self::GuildOnly | Self::UnknownCommand(_) => "rejected",
        }
    }
}

impl fmt::Display for CommandReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaderboard(page) => write!(
                f,
                "Leaderboard page {}/{} ({} users)",
                page.page, page.total_pages, page.total_users
            ),
            Self::SyncCompleted(report) => write!(
                f,
                "{} sync finished: {} messages across {} locations",
                report.mode, report.messages_counted, report.locations_processed
            ),
            Self::SyncBusy { holder } => write!(f, "A sync is already running (started by {holder})"),
            Self::NoAnchor => write!(f, "No sync has completed yet; run sync-full or sync-messages first"),
            Self::RebuildPending { mode } => write!(
                f,
                "The last {mode} sync did not finish; rerun {} before sync-missing",
                match mode {
                    SyncMode::Full => "sync-full",
                    _ => "sync-messages",
                }
            ),
            Self::SyncFailed(reason) => write!(f, "Sync failed: {reason}"),
            Self::Unavailable(reason) => write!(f, "Leaderboard unavailable: {reason}"),
            Self::InvalidOption { option, reason } => write!(f, "Invalid {option}: {reason}"),
            Self::GuildOnly => write!(f, "This command only works inside a server"),
            Self::UnknownCommand(name) => write!(f, "Unknown command '{name}'"),
        }
    }
}

/// Routes invocations through a registry to a service.
pub struct Dispatcher<'a> {
    registry: &'a CommandRegistry,
    service: &'a TallyService,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a CommandRegistry, service: &'a TallyService) -> Self {
        Self { registry, service }
    }

    /// Handle one invocation. Never fails; every outcome is a reply.
    #[tracing::instrument(skip_all, fields(command = %invocation.name, user_id = %invocation.user_id))]
    pub async fn dispatch(&self, invocation: &Invocation) -> CommandReply {
        let kind = self.registry.resolve(&invocation.name);
        let reply = match kind {
            None => CommandReply::UnknownCommand(invocation.name.clone()),
            Some(kind) => match invocation.guild_id.as_deref() {
                None => CommandReply::GuildOnly,
                Some(guild_id) => self.route(kind, guild_id, invocation).await,
            },
        };
        // label by registered name only; typed names are unbounded
        metrics::record_command(kind.as_ref().map_or("unknown", CommandKind::name), reply.outcome());
        reply
    }

    async fn route(&self, kind: CommandKind, guild_id: &str, invocation: &Invocation) -> CommandReply {
        match kind {
            CommandKind::Leaderboard => self.leaderboard(guild_id, invocation).await,
            CommandKind::SyncFull => {
                let mut request = SyncRequest::new(guild_id).notify(&invocation.user_id);
                if let Some(raw) = invocation.get("workers") {
                    match raw.parse::<usize>() {
                        Ok(n) if n > 0 => request = request.with_parallelism(n),
                        _ => {
                            return CommandReply::InvalidOption {
                                option: "workers",
                                reason: format!("'{raw}' is not a positive number"),
                            }
                        }
                    }
                }
                sync_reply(self.service.full_resync(&request).await)
            }
            CommandKind::SyncMessages => {
                let request = SyncRequest::new(guild_id).notify(&invocation.user_id);
                sync_reply(self.service.incremental_sync(&request).await)
            }
            CommandKind::SyncMissing => {
                let request = SyncRequest::new(guild_id).notify(&invocation.user_id);
                sync_reply(self.service.catch_up(&request).await)
            }
        }
    }

    async fn leaderboard(&self, guild_id: &str, invocation: &Invocation) -> CommandReply {
        let query = match parse_leaderboard(guild_id, invocation) {
            Ok(query) => query,
            Err(reply) => return reply,
        };
        match self.service.leaderboard(&query).await {
            Ok(page) => CommandReply::Leaderboard(page),
            Err(e) => {
                warn!(guild_id = %guild_id, error = %e, "Leaderboard query failed");
                CommandReply::Unavailable(e.to_string())
            }
        }
    }
}

fn parse_leaderboard(guild_id: &str, invocation: &Invocation) -> Result<LeaderboardQuery, CommandReply> {
    let mut query = LeaderboardQuery::new(guild_id, invocation.user_id.clone());

    if let Some(raw) = invocation.get("page") {
        let page = raw.parse::<u32>().map_err(|_| CommandReply::InvalidOption {
            option: "page",
            reason: format!("'{raw}' is not a page number"),
        })?;
        query = query.page(page);
    }

    let mut filter = LeaderboardFilter::default();
    if let Some(channel) = invocation.get("channel") {
        if channel.contains(':') {
            return Err(CommandReply::InvalidOption {
                option: "channel",
                reason: format!("'{channel}' is not a channel id"),
            });
        }
        filter.channel_id = Some(channel.to_string());
    }
    if let Some(raw) = invocation.get("date") {
        let date = parse_date(raw).map_err(|_| CommandReply::InvalidOption {
            option: "date",
            reason: format!("'{raw}' is not a YYYY-MM-DD date"),
        })?;
        filter.date = Some(date);
    }
    Ok(query.filter(filter))
}

fn sync_reply(result: Result<SyncReport, SyncError>) -> CommandReply {
    match result {
        Ok(report) => {
            info!(guild_id = %report.guild_id, mode = %report.mode, "Sync command finished");
            CommandReply::SyncCompleted(report)
        }
        Err(SyncError::Busy { holder }) => CommandReply::SyncBusy { holder },
        Err(SyncError::NoAnchor) => CommandReply::NoAnchor,
        Err(SyncError::RebuildPending { mode }) => CommandReply::RebuildPending { mode },
        Err(e) => CommandReply::SyncFailed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::MessageEvent;
    use crate::config::TallyConfig;
    use crate::platform::memory::InMemoryPlatform;
    use std::sync::Arc;

    fn service(platform: Arc<InMemoryPlatform>) -> TallyService {
        TallyService::in_memory(TallyConfig::default(), platform)
    }

    #[test]
    fn test_registry_resolves_builtins() {
        let registry = CommandRegistry::standard();
        assert_eq!(registry.resolve("sync-full"), Some(CommandKind::SyncFull));
        assert_eq!(registry.resolve("sync-missing"), Some(CommandKind::SyncMissing));
        assert_eq!(registry.resolve("sync"), None);
        assert_eq!(
            registry.names(),
            vec!["leaderboard", "sync-full", "sync-messages", "sync-missing"]
        );
    }

    #[tokio::test]
    async fn test_unknown_and_dm_invocations_rejected() {
        let registry = CommandRegistry::with_commands(&[CommandKind::Leaderboard]);
        let service = service(Arc::new(InMemoryPlatform::new()));
        let dispatcher = Dispatcher::new(&registry, &service);

        let reply = dispatcher.dispatch(&Invocation::new("sync-full", "u1").in_guild("g")).await;
        assert_eq!(reply, CommandReply::UnknownCommand("sync-full".into()));

        let reply = dispatcher.dispatch(&Invocation::new("leaderboard", "u1")).await;
        assert_eq!(reply, CommandReply::GuildOnly);
    }

    #[tokio::test]
    async fn test_command_metric_uses_registered_names() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let _recorder = ::metrics::set_default_local_recorder(&recorder);

        let registry = CommandRegistry::standard();
        let service = service(Arc::new(InMemoryPlatform::new()));
        let dispatcher = Dispatcher::new(&registry, &service);
        for name in ["leaderboard", "lb-typo-1", "lb-typo-2", "drop everything"] {
            dispatcher.dispatch(&Invocation::new(name, "u1").in_guild("g")).await;
        }

        let mut commands: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == "tally_engine_commands_total")
            .filter_map(|(key, _, _, _)| {
                key.key()
                    .labels()
                    .find(|label| label.key() == "command")
                    .map(|label| label.value().to_string())
            })
            .collect();
        commands.sort();
        assert_eq!(commands, vec!["leaderboard", "unknown"]);
    }

    #[tokio::test]
    async fn test_leaderboard_options_validated() {
        let registry = CommandRegistry::standard();
        let service = service(Arc::new(InMemoryPlatform::new()));
        let dispatcher = Dispatcher::new(&registry, &service);
        let base = Invocation::new("leaderboard", "u1").in_guild("g");

        let reply = dispatcher.dispatch(&base.clone().option("date", "2024-02-30")).await;
        assert!(matches!(reply, CommandReply::InvalidOption { option: "date", .. }));

        let reply = dispatcher.dispatch(&base.clone().option("page", "two")).await;
        assert!(matches!(reply, CommandReply::InvalidOption { option: "page", .. }));

        // blank options are ignored
        let reply = dispatcher.dispatch(&base.option("channel", "  ")).await;
        assert!(matches!(reply, CommandReply::Leaderboard(ref p) if !p.from_snapshot && p.page == 1));
    }

    #[tokio::test]
    async fn test_leaderboard_reflects_live_counts() {
        let registry = CommandRegistry::standard();
        let service = service(Arc::new(InMemoryPlatform::new()));
        for (i, author) in ["u1", "u2", "u1"].iter().enumerate() {
            service
                .record_message(&MessageEvent {
                    guild_id: Some("g".into()),
                    message_id: format!("{}", 10 + i),
                    channel_id: "c1".into(),
                    author_id: (*author).into(),
                    author_is_bot: false,
                    created_at: "2024-01-01T00:00:00Z".parse().unwrap(),
                })
                .await;
        }

        let dispatcher = Dispatcher::new(&registry, &service);
        let reply = dispatcher.dispatch(&Invocation::new("leaderboard", "u2").in_guild("g")).await;
        let CommandReply::Leaderboard(page) = reply else {
            panic!("expected a leaderboard page, got {reply:?}");
        };
        assert_eq!(page.rows[0].user_id, "u1");
        assert_eq!(page.rows[0].total, 2);
        assert_eq!(page.requester_rank, Some(2));
    }

    #[tokio::test]
    async fn test_sync_missing_without_anchor() {
        let registry = CommandRegistry::standard();
        let service = service(Arc::new(InMemoryPlatform::new()));
        let dispatcher = Dispatcher::new(&registry, &service);

        let reply = dispatcher.dispatch(&Invocation::new("sync-missing", "u1").in_guild("g")).await;
        assert_eq!(reply, CommandReply::NoAnchor);
        assert_eq!(reply.outcome(), "no_anchor");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_missing_after_failed_incremental() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.add_location("g", "100", "general");
        let t = "2024-01-01T00:00:00Z".parse().unwrap();
        platform.post("g", "100", "u1", false, t);
        let registry = CommandRegistry::standard();
        let service = service(platform.clone());
        let dispatcher = Dispatcher::new(&registry, &service);

        dispatcher.dispatch(&Invocation::new("sync-full", "admin").in_guild("g")).await;
        platform.break_location("100", crate::platform::PlatformError::Fatal("closed".into()));
        let reply = dispatcher.dispatch(&Invocation::new("sync-messages", "admin").in_guild("g")).await;
        assert_eq!(reply.outcome(), "failed");

        let reply = dispatcher.dispatch(&Invocation::new("sync-missing", "admin").in_guild("g")).await;
        assert_eq!(reply, CommandReply::RebuildPending { mode: SyncMode::Incremental });
        assert_eq!(reply.outcome(), "rebuild_pending");
        assert!(reply.to_string().contains("sync-messages"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_full_routes_to_engine() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.add_location("g", "100", "general");
        let t = "2024-01-01T00:00:00Z".parse().unwrap();
        platform.post("g", "100", "u1", false, t);
        platform.post("g", "100", "u2", false, t);
        let registry = CommandRegistry::standard();
        let service = service(platform);
        let dispatcher = Dispatcher::new(&registry, &service);

        let reply = dispatcher
            .dispatch(&Invocation::new("sync-full", "admin").in_guild("g").option("workers", "2"))
            .await;
        let CommandReply::SyncCompleted(report) = reply else {
            panic!("expected completion, got {reply:?}");
        };
        assert_eq!(report.mode, SyncMode::Full);
        assert_eq!(report.messages_counted, 2);

        let reply = dispatcher
            .dispatch(&Invocation::new("sync-full", "admin").in_guild("g").option("workers", "0"))
            .await;
        assert!(matches!(reply, CommandReply::InvalidOption { option: "workers", .. }));
    }

    #[test]
    fn test_busy_reply_names_holder() {
        let reply = sync_reply(Err(SyncError::Busy { holder: "admin".into() }));
        assert_eq!(reply.to_string(), "A sync is already running (started by admin)");
        assert_eq!(reply.outcome(), "busy");
    }
}
