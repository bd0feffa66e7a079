use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub cmd: OptsCmd,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Directory the two durable documents (`pending.json`,
    /// `automation.json`) live in. Created on first use.
    #[arg(long, env = "EVENTLY_STATE_DIR", default_value = "./evently-state")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum OptsCmd {
    /// Runs the engine against a mock publisher and a fixed-interval slot
    /// source for a short, observable window.
    Demo {
        /// How many publishes the mock publisher accepts before it starts
        /// simulating a rate limit, to exercise the gate's backoff ladder.
        #[arg(long, default_value_t = 3)]
        fail_after: u32,
        /// How long to let the engine run before shutting down.
        #[arg(long, default_value_t = 20)]
        seconds: u64,
        /// Spacing between generated demo slots, in seconds.
        #[arg(long, default_value_t = 30)]
        interval_secs: i64,
    },
    /// `SetKnownTargets`: intersects both pools against the given ids.
    /// Omit `--id` entirely to perform no pruning at all.
    SetKnownTargets {
        #[arg(long = "id")]
        ids: Option<Vec<String>>,
    },
    /// `UpdatePendingForProfile`: registers/replaces a profile from a JSON
    /// file and (re)expands its pending records.
    UpdatePendingForProfile {
        target_id: String,
        profile_key: String,
        /// Path to a JSON-encoded `evently_core::Profile`.
        #[arg(long)]
        profile: PathBuf,
    },
    /// `RecordManualEvent`: pulls the profile's activation anchor earlier.
    RecordManualEvent {
        target_id: String,
        profile_key: String,
        /// RFC 3339 instant.
        #[arg(long)]
        starts_at: String,
    },
    /// `ReconcilePublished`: drops `published` records missing from the
    /// given remote-event snapshot.
    ReconcilePublished {
        target_id: String,
        /// Path to a JSON array of `{eventId?, startsAt, title?}`.
        #[arg(long)]
        remote: PathBuf,
    },
    /// `ApplyOverrides`: stores a `ManualOverrides` bag against a slot key.
    ApplyOverrides {
        slot_key: String,
        /// Path to a JSON-encoded `evently_core::ManualOverrides`.
        #[arg(long)]
        overrides: PathBuf,
    },
    /// `ActOnMissed`: acts on a `missed` record.
    ActOnMissed {
        slot_key: String,
        #[arg(value_enum)]
        action: MissedActionArg,
    },
    /// `RestoreDeleted`: restores every still-restorable deleted record for
    /// a profile.
    RestoreDeleted { target_id: String, profile_key: String },
    /// `PurgeProfile`: hard-removes every trace of a profile.
    PurgeProfile { target_id: String, profile_key: String },
    /// Sets the deleted pool's advisory `settings.displayLimit`.
    SetDisplayLimit { limit: usize },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value(rename_all = "camelCase")]
pub enum MissedActionArg {
    PostNow,
    Reschedule,
    Cancel,
}
