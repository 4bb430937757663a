use clap::Parser;
use log::{error, info};

use crate::config;
use crate::control::ControlChannel;
use crate::entries::{self, SystemResolver};
use crate::logging;
use crate::reload::FileConfigSource;
use crate::server::Server;
use crate::services::ProcessSpawner;
use crate::signal_handler::SignalWatcher;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Internet super-server")]
pub struct CliArgs {
    /// The service table
    #[arg(default_value = config::DEFAULT_CONF_PATH)]
    pub conf_path: PathBuf,

    /// TOML file with settings for the daemon itself
    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    /// Overrides the level from the settings file
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Parse the service table, print it and exit
    #[arg(short, long)]
    pub dry_run: bool,

    /// Where named services are looked up
    #[arg(long, default_value = crate::platform::servent::DEFAULT_SERVICES_DB)]
    pub services_db: PathBuf,
}

/// Run the daemon until it is told to shut down. Returns the exit code.
pub fn run_inetd() -> i32 {
    let cli_args = CliArgs::parse();

    let (log_conf, conf) = match config::load_config(&cli_args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}: {e}", config::prog_name());
            return 1;
        }
    };
    if let Err(e) = logging::setup_logging(&log_conf) {
        eprintln!("{}: {e}", conf.prog_name);
        return 1;
    }

    if conf.dry_run {
        return list_services(&conf);
    }

    let control = match ControlChannel::new() {
        Ok(control) => control,
        Err(e) => {
            error!("Could not create the control channel: {e}");
            return 1;
        }
    };
    let signals = match SignalWatcher::start(control.handle()) {
        Ok(signals) => signals,
        Err(e) => {
            error!("Couldnt setup listening to the signals: {e}");
            return 1;
        }
    };

    let source = FileConfigSource::new(
        conf.conf_path.clone(),
        SystemResolver::new(conf.services_db.clone()),
    );
    let server = Server::new(
        &conf,
        Box::new(source),
        control,
        ProcessSpawner::new(&conf.prog_name),
    );
    let result = server.run();
    signals.stop();

    match result {
        Ok(()) => {
            info!("{} checking out", conf.prog_name);
            0
        }
        Err(e) => {
            error!("{e}");
            1
        }
    }
}

fn list_services(conf: &config::Config) -> i32 {
    let resolver = SystemResolver::new(conf.services_db.clone());
    match entries::parse_file(&conf.conf_path, &resolver) {
        Ok(parsed) => {
            for error in &parsed.errors {
                error!("{}: {error}", conf.conf_path.display());
            }
            for spec in &parsed.specs {
                println!("{} ({})", spec, spec.listen);
            }
            i32::from(!parsed.errors.is_empty())
        }
        Err(e) => {
            error!("Could not read {}: {e}", conf.conf_path.display());
            1
        }
    }
}
