use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Import and update study entities in the registry", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create every entity found in the study's source files
    Import(ImportArgs),
    /// Patch entities created by a previous import
    Update(UpdateArgs),
    /// Delete a study and everything that references it
    DropData(ConfigArgs),
    /// Parse a mapping file and check it against a schema registry
    CheckMappings(CheckMappingsArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    /// Run configuration file (YAML or JSON)
    #[arg(short, long)]
    pub config: PathBuf,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[command(flatten)]
    pub run: ConfigArgs,
    /// Skip natural keys already in the identifier cache from an earlier run
    #[arg(long)]
    pub resume: bool,
    /// Map at most N rows per entity type (overrides the config)
    #[arg(long)]
    pub nrows: Option<usize>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub run: ConfigArgs,
    /// Map at most N rows per entity type (overrides the config)
    #[arg(long)]
    pub nrows: Option<usize>,
}

#[derive(Debug, Args)]
pub struct CheckMappingsArgs {
    /// Mapping file (YAML or JSON)
    #[arg(short, long)]
    pub mappings: PathBuf,
    /// Schema registry to validate field names against
    #[arg(short, long)]
    pub schemas: Option<PathBuf>,
}
