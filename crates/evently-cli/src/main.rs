mod cli;
mod demo;

use std::io;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cli::{MissedActionArg, Opts, OptsCmd};
use clap::Parser;
use evently_core::{ManualOverrides, Profile, Slot, SlotExpander, SlotKey};
use evently_engine::{Engine, EngineConfig, EngineError, EventPublisher, MissedAction, PublishDetails, PublishFailure, PublishedEvent, RemoteEvent};
use evently_util_error::BoxedError;
use serde::Deserialize;
use snafu::{FromString, ResultExt, Snafu, Whatever};
use time::OffsetDateTime;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_TARGET: &str = "evently::cli";

type WhateverResult<T> = std::result::Result<T, Whatever>;

#[derive(Debug, Snafu)]
pub enum CliError {
    #[snafu(transparent)]
    Engine { source: EngineError },
    #[snafu(display("Miscellaneous error: {source}"))]
    Whatever { source: Whatever },
}

pub type CliResult<T> = std::result::Result<T, CliError>;

#[snafu::report]
#[tokio::main]
async fn main() -> CliResult<()> {
    init_logging().context(WhateverSnafu)?;

    let opts = Opts::parse();
    let value = handle_cmd(opts).await?;
    println!("{}", serde_json::to_string_pretty(&value).expect("Can't fail"));
    Ok(())
}

/// A publisher that never accepts an attempt; wired in for every subcommand
/// except `demo`, since the Control API surface this binary exercises never
/// actually needs to publish anything itself.
struct UnwiredPublisher;

#[async_trait]
impl EventPublisher for UnwiredPublisher {
    async fn publish_event(&self, _details: &PublishDetails) -> Result<PublishedEvent, PublishFailure> {
        Err(PublishFailure::new("no publisher configured for this invocation"))
    }
}

/// A slot expander that never produces anything; pattern syntax and
/// timezone math are the caller's concern (`spec.md §1`), and this binary
/// doesn't implement one beyond the demo's fixed-interval stand-in.
struct UnwiredExpander;

#[async_trait]
impl SlotExpander for UnwiredExpander {
    async fn expand(&self, _profile: &Profile, _horizon: OffsetDateTime) -> Result<Vec<Slot>, BoxedError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteEventInput {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    starts_at: OffsetDateTime,
    #[serde(default)]
    title: Option<String>,
}

async fn handle_cmd(opts: Opts) -> CliResult<serde_json::Value> {
    let pending_path = opts.global.state_dir.join("pending.json");
    let automation_path = opts.global.state_dir.join("automation.json");

    match opts.cmd {
        OptsCmd::Demo {
            fail_after,
            seconds,
            interval_secs,
        } => {
            let now = OffsetDateTime::now_utc();
            let publisher = Arc::new(demo::MockPublisher::new(fail_after));
            let expander = Arc::new(demo::FixedIntervalSlotExpander::new(
                now + time::Duration::seconds(interval_secs),
                time::Duration::seconds(interval_secs),
            ));

            let engine = Engine::spawn(EngineConfig::default(), publisher, expander, pending_path.clone(), automation_path).await?;

            engine.update_pending_for_profile("demo-target", "demo-profile", demo_profile()).await?;

            tokio::time::sleep(StdDuration::from_secs(seconds)).await;
            engine.shutdown();

            // The engine's in-memory state is private to `evently_engine`;
            // re-reading the document it just persisted gives an accurate
            // readout without exposing internals for a one-off summary.
            let store = evently_core::PendingStore::load(pending_path, EngineConfig::default().deleted_display_limit)
                .await
                .map_err(EngineError::from)?;
            let published = store.iter_pending().filter(|r| r.status == evently_core::PendingStatus::Published).count();

            Ok(serde_json::json!({
                "ranForSeconds": seconds,
                "pendingCount": store.iter_visible_pending(None).count(),
                "deletedCount": store.iter_deleted().count(),
                "missedCount": store.missed_count(None),
                "publishedCount": published,
            }))
        }
        OptsCmd::SetKnownTargets { ids } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            let ids = ids.map(|ids| ids.into_iter().collect());
            let dropped = engine.set_known_targets(ids).await?;
            Ok(serde_json::json!({"ok": true, "dropped": dropped}))
        }
        OptsCmd::UpdatePendingForProfile {
            target_id,
            profile_key,
            profile,
        } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            let profile = read_json::<Profile>(&profile).await?;
            engine.update_pending_for_profile(&target_id, &profile_key, profile).await?;
            Ok(serde_json::json!({"ok": true}))
        }
        OptsCmd::RecordManualEvent {
            target_id,
            profile_key,
            starts_at,
        } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            let starts_at = parse_rfc3339(&starts_at).context(WhateverSnafu)?;
            engine.record_manual_event(&target_id, &profile_key, starts_at).await?;
            Ok(serde_json::json!({"ok": true}))
        }
        OptsCmd::ReconcilePublished { target_id, remote } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            let remote: Vec<RemoteEventInput> = read_json(&remote).await?;
            let remote: Vec<RemoteEvent> = remote
                .into_iter()
                .map(|r| RemoteEvent {
                    event_id: r.event_id,
                    starts_at: r.starts_at,
                    title: r.title,
                })
                .collect();
            let dropped = engine.reconcile_published(&target_id, &remote).await?;
            Ok(serde_json::json!({"ok": true, "dropped": dropped}))
        }
        OptsCmd::ApplyOverrides { slot_key, overrides } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            let overrides: ManualOverrides = read_json(&overrides).await?;
            let slot_key = SlotKey::from(slot_key.as_str());
            engine.apply_overrides(&slot_key, overrides).await?;
            Ok(serde_json::json!({"ok": true}))
        }
        OptsCmd::ActOnMissed { slot_key, action } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            let slot_key = SlotKey::from(slot_key.as_str());
            let action = match action {
                MissedActionArg::PostNow => MissedAction::PostNow,
                MissedActionArg::Reschedule => MissedAction::Reschedule,
                MissedActionArg::Cancel => MissedAction::Cancel,
            };
            let outcome = engine.act_on_missed(&slot_key, action).await?;
            Ok(serde_json::json!({"ok": true, "outcome": format!("{outcome:?}")}))
        }
        OptsCmd::RestoreDeleted { target_id, profile_key } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            let restored = engine.restore_deleted(&target_id, &profile_key).await?;
            Ok(serde_json::json!({"ok": true, "restored": restored}))
        }
        OptsCmd::PurgeProfile { target_id, profile_key } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            engine.purge_profile(&target_id, &profile_key).await?;
            Ok(serde_json::json!({"ok": true}))
        }
        OptsCmd::SetDisplayLimit { limit } => {
            let engine = spawn_unwired(pending_path, automation_path).await?;
            engine.set_display_limit(limit).await?;
            Ok(serde_json::json!({"ok": true}))
        }
    }
}

async fn spawn_unwired(pending_path: std::path::PathBuf, automation_path: std::path::PathBuf) -> CliResult<Arc<Engine>> {
    Ok(Engine::spawn(EngineConfig::default(), Arc::new(UnwiredPublisher), Arc::new(UnwiredExpander), pending_path, automation_path).await?)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> CliResult<T> {
    let bytes = tokio::fs::read(path)
        .await
        .with_whatever_context(|_| format!("failed to read {}", path.display()))
        .context(WhateverSnafu)?;
    serde_json::from_slice(&bytes)
        .with_whatever_context(|_| format!("failed to parse {} as JSON", path.display()))
        .context(WhateverSnafu)
}

fn parse_rfc3339(input: &str) -> WhateverResult<OffsetDateTime> {
    OffsetDateTime::parse(input, &time::format_description::well_known::Rfc3339).with_whatever_context(|_| format!("{input:?} is not an RFC 3339 instant"))
}

fn demo_profile() -> Profile {
    Profile {
        target_id: "demo-target".into(),
        profile_key: "demo-profile".into(),
        patterns: serde_json::json!({"title": "Demo Show"}),
        timezone: "UTC".into(),
        duration_minutes: 60,
        automation: evently_core::AutomationSettings {
            enabled: true,
            timing_mode: evently_core::TimingMode::Before,
            days_offset: 0,
            hours_offset: 0,
            minutes_offset: 5,
            monthly_day: 1,
            monthly_hour: 0,
            monthly_minute: 0,
            repeat_mode: evently_core::RepeatMode::Indefinite,
            repeat_count: None,
        },
    }
}

pub fn init_logging() -> WhateverResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| Whatever::without_source("Failed to initialize logging".to_string()))?;

    Ok(())
}
