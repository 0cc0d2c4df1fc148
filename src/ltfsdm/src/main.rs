mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ltfsdm_lib::{ServerConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "ltfsdm", version, about = "tape data management client")]
struct Cli {
    /// Backend configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the backend.
    Start,
    /// Stop the backend.
    Stop {
        /// Force the stop: workers abandon their current file.
        #[arg(short = 'x')]
        forced: bool,
        /// Drain the request queue before stopping.
        #[arg(short = 'f')]
        finish: bool,
    },
    /// Add a file system to management.
    Add {
        fs: PathBuf,
    },
    /// Migrate files to one tape pool per replica.
    Migrate {
        /// Target state: r(esident), p(remigrated), or m(igrated).
        #[arg(short = 's', default_value = "m")]
        state: String,
        /// Comma-separated list of 1..3 pools.
        #[arg(short = 'P', required = true)]
        pools: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Recall migrated files back to disk.
    Recall {
        /// Target state: r(esident) or p(remigrated).
        #[arg(short = 's', default_value = "r")]
        state: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Show requests, jobs, files, file systems, drives, tapes, or pools.
    Info {
        #[command(subcommand)]
        what: InfoCommand,
    },
    /// Check whether the backend is running.
    Status,
    /// Re-read the tape inventory.
    Retrieve,
    /// Manage tape pools.
    Pool {
        #[command(subcommand)]
        cmd: PoolCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
enum InfoCommand {
    Requests {
        #[arg(short = 'n')]
        req_num: Option<i64>,
    },
    Jobs {
        #[arg(short = 'n')]
        req_num: Option<i64>,
    },
    Files {
        paths: Vec<String>,
    },
    Fs,
    Drives,
    Tapes,
    Pools,
}

#[derive(Subcommand)]
enum PoolCommand {
    Create {
        #[arg(short = 'P')]
        pool: String,
    },
    Delete {
        #[arg(short = 'P')]
        pool: String,
    },
    Add {
        #[arg(short = 'P')]
        pool: String,
        #[arg(short = 't', required = true)]
        tapes: Vec<String>,
    },
    Remove {
        #[arg(short = 'P')]
        pool: String,
        #[arg(short = 't', required = true)]
        tapes: Vec<String>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match ServerConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("starting runtime failed: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        match cli.command {
            Command::Start => commands::start(&config, &cli.config).await,
            Command::Stop { forced, finish } => commands::stop(&config, forced, finish).await,
            Command::Add { fs } => commands::add(&config, &fs).await,
            Command::Migrate {
                state,
                pools,
                paths,
            } => commands::migrate(&config, &state, &pools, &paths).await,
            Command::Recall { state, paths } => commands::recall(&config, &state, &paths).await,
            Command::Info { what } => match what {
                InfoCommand::Requests { req_num } => {
                    commands::info_requests(&config, req_num).await
                }
                InfoCommand::Jobs { req_num } => commands::info_jobs(&config, req_num).await,
                InfoCommand::Files { paths } => commands::info_files(&config, &paths),
                InfoCommand::Fs => commands::info_fs(&config),
                InfoCommand::Drives => commands::info_drives(&config).await,
                InfoCommand::Tapes => commands::info_tapes(&config).await,
                InfoCommand::Pools => commands::info_pools(&config).await,
            },
            Command::Status => commands::status(&config).await,
            Command::Retrieve => commands::retrieve(&config).await,
            Command::Pool { cmd } => match cmd {
                PoolCommand::Create { pool } => commands::pool_create(&config, &pool).await,
                PoolCommand::Delete { pool } => commands::pool_delete(&config, &pool).await,
                PoolCommand::Add { pool, tapes } => {
                    commands::pool_add(&config, &pool, tapes).await
                }
                PoolCommand::Remove { pool, tapes } => {
                    commands::pool_remove(&config, &pool, tapes).await
                }
            },
            Command::Version => {
                println!("ltfsdm {}", env!("CARGO_PKG_VERSION"));
                0
            }
        }
    });

    std::process::exit(code);
}
