use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

use commands::audit::{RecordArgs, VerifyArgs};
use commands::channels::{AuditFlags, ChannelAction};
use commands::rollout::RolloutArgs;

#[derive(Parser)]
#[command(
    name = "shipline",
    about = "shipline — canary/stable release rollout with a tamper-evident audit ledger",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Log output format on stderr.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan, and optionally apply, the next rollout step.
    ///
    /// Reads the channel store and rollout policy, evaluates gate reports
    /// and the canary observation window, and prints a JSON report. Exits
    /// with 2 when a strict run fails.
    Rollout(RolloutArgs),
    /// Verify or append to the audit ledger.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Inspect gate reports.
    Gates {
        #[command(subcommand)]
        action: GatesAction,
    },
    /// Manual channel operations.
    Channels {
        #[command(flatten)]
        audit: AuditFlags,
        #[command(subcommand)]
        action: ChannelAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Verify hash-chain integrity and continuity against the snapshot.
    Verify(VerifyArgs),
    /// Append one entry to the ledger.
    Record(RecordArgs),
}

#[derive(Subcommand)]
enum GatesAction {
    /// Show the newest report matching a glob.
    Latest {
        /// Glob pattern of report files.
        #[arg(short, long)]
        pattern: String,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let code = match cli.command {
        Commands::Rollout(args) => commands::rollout::run(args)?,
        Commands::Audit { action } => match action {
            AuditAction::Verify(args) => commands::audit::verify(args)?,
            AuditAction::Record(args) => commands::audit::record(args)?,
        },
        Commands::Gates { action } => match action {
            GatesAction::Latest { pattern } => commands::gates::latest(&pattern)?,
        },
        Commands::Channels { audit, action } => commands::channels::run(&audit, action)?,
    };
    Ok(ExitCode::from(code))
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("shipline=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}
