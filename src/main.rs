use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::App;

mod config;
mod database;
mod mqtt;
mod payload;
mod pipeline;
mod record;
mod supervisor;
mod topic;

use crate::config::Configuration;
use crate::supervisor::{StartupError, Supervisor};

static DEFAULT_CONFIGURATION_PATH: &str = "resources/heatlogd.yml";

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from_yaml(cli_yaml).get_matches();

    let log_configuration_path = matches.value_of("log-config").unwrap_or("resources/log.yml");
    if let Err(err) = log4rs::init_file(log_configuration_path, Default::default()) {
        eprintln!("Could not create logger from yaml configuration \'{}\': {}", log_configuration_path, err);
        exit(100);
    }

    let configuration = match Configuration::load(matches.value_of("config"),
                                                  DEFAULT_CONFIGURATION_PATH,
                                                  |key| std::env::var(key).ok()) {
        Ok(configuration) => configuration,
        Err(err) => {
            log::error!(target: "heatlogd", "Cannot load the configuration: \'{}\'", err);
            exit(101);
        }
    };

    let terminate_programm = Arc::new(AtomicBool::new(false));
    let terminate_handler = Arc::clone(&terminate_programm);
    if let Err(err) = ctrlc::set_handler(move || {
        log::info!(target: "heatlogd", "Termination signal received!");
        terminate_handler.store(true, Ordering::SeqCst);
    }) {
        log::error!(target: "heatlogd", "Could not set the termination handler: \'{}\'", err);
        exit(102);
    }

    let supervisor = Supervisor::new(configuration, terminate_programm);
    match supervisor.run() {
        Ok(stats) => {
            log::info!(target: "heatlogd", "Handled messages: {}", stats);
        }
        Err(err @ StartupError::Store(_)) => {
            log::error!(target: "heatlogd", "Failed to connect to database: \'{}\'", err);
            exit(201);
        }
        Err(err @ StartupError::Transport(_)) => {
            log::error!(target: "heatlogd", "Failed to set up the mqtt client: \'{}\'", err);
            exit(202);
        }
    }

    log::info!(target: "heatlogd", "Exiting");
    exit(0);
}
