use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use sealbox_storage::EnvelopeFormat;

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "sealbox",
    about = "Keep database and mail credentials encrypted at rest",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Envelope format for writes (`legacy` or `sealed`); overrides the config file.
    #[arg(long, global = true)]
    pub format: Option<EnvelopeFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Database connection settings.
    #[command(subcommand)]
    Db(DbCommand),
    /// SMTP mail settings.
    #[command(subcommand)]
    Mail(MailCommand),
    /// Save the sample settings and read them back.
    Demo,
    /// Describe a stored file's envelope without printing its contents.
    Inspect {
        file: PathBuf,
    },
    /// Rewrite a stored file in the configured envelope format.
    Reseal {
        file: PathBuf,
        #[arg(long, value_enum)]
        kind: RecordKind,
    },
    /// Round-trip a probe record through the configured store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DbCommand {
    /// Encrypt and save database settings.
    Set {
        #[arg(long)]
        server: String,
        #[arg(long)]
        database: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
        #[command(flatten)]
        target: Target,
    },
    /// Load and print database settings.
    Show {
        #[command(flatten)]
        target: Target,
        /// Print the password instead of a mask.
        #[arg(long)]
        reveal: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum MailCommand {
    /// Encrypt and save SMTP settings.
    Set {
        #[arg(long)]
        server: String,
        #[arg(long, default_value_t = 25)]
        port: u16,
        #[arg(long)]
        address: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        no_ssl: bool,
        /// Send message bodies as plain text.
        #[arg(long)]
        plain_text: bool,
        #[command(flatten)]
        target: Target,
    },
    /// Load and print SMTP settings.
    Show {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        reveal: bool,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Eq, Default)]
pub struct Target {
    /// Settings file; defaults to the data directory.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Db,
    Mail,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
