mod daemon;
mod dispatcher;
mod fileops;
mod migration;
mod recall;
mod scheduler;
mod tape_handler;
mod tape_mover;
mod worker_pool;

use std::env;
use std::path::PathBuf;

use log::error;
use ltfsdm_lib::{ServerConfig, DEFAULT_CONFIG_PATH};

fn usage() -> String {
    format!(
        "usage: ltfsdmd [-c <config>]\n\
         defaults:\n\
         -c {}",
        DEFAULT_CONFIG_PATH
    )
}

fn parse_args() -> Result<PathBuf, String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Err(usage()),
            "-c" | "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for -c".to_string())?;
                config_path = PathBuf::from(value);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    Ok(config_path)
}

fn main() {
    env_logger::init();
    let config_path = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    let config = match ServerConfig::load_or_default(&config_path) {
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

    if let Err(e) = runtime.block_on(daemon::run(config)) {
        error!("ltfsdmd failed: {}", e);
        std::process::exit(1);
    }
}


#[cfg(test)]
mod dispatcher_tests;
