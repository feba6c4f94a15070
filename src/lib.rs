pub mod cache;
pub mod cli;
pub mod config;
pub mod documents;
pub mod entity;
pub mod etl;
pub mod extract;
pub mod family;
pub mod io_utils;
pub mod link;
pub mod loader;
pub mod mapper;
pub mod mapping;
pub mod report;
pub mod schema_registry;
pub mod store;
pub mod transform;
pub mod value;

use std::{env, sync::OnceLock};

use anyhow::{Result, bail};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    cli::{Cli, Commands},
    etl::RunOptions,
    loader::Operation,
    report::LoadReport,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("study_etl", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Import(args) => {
            let options = RunOptions {
                resume: args.resume,
                nrows: args.nrows,
            };
            let report = etl::run(Operation::Create, &args.run.config, options)?;
            finish(&report)
        }
        Commands::Update(args) => {
            let options = RunOptions {
                resume: false,
                nrows: args.nrows,
            };
            let report = etl::run(Operation::Update, &args.run.config, options)?;
            finish(&report)
        }
        Commands::DropData(args) => {
            let removed = etl::drop_data(&args.config)?;
            println!("Removed {removed} row(s)");
            Ok(())
        }
        Commands::CheckMappings(args) => {
            for line in etl::check_mappings(&args.mappings, args.schemas.as_deref())? {
                println!("{line}");
            }
            info!("Mapping {:?} is valid", args.mappings);
            Ok(())
        }
    }
}

fn finish(report: &LoadReport) -> Result<()> {
    print!("{}", report.render());
    let failed = report.total_failed();
    if failed > 0 {
        bail!("{failed} payload(s) were rolled back");
    }
    Ok(())
}
