use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use log::{error, info};
use rpki_rtr_server::config::{configure, Config};
use rpki_rtr_server::db::JsonDb;
use rpki_rtr_server::error::Error;
use rpki_rtr_server::orchestrator::Server;

fn main() {
    let config = match configure() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };
    if let Err(err) = run(config) {
        error!("{}", err);
        process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Error> {
    let vrps = config.vrps.clone().ok_or_else(|| {
        Error::Config("missing VRP file".into())
    })?;
    let db = JsonDb::new(vrps, config.history);
    let mut server = Server::start(config, db)?;

    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        info!("Caught signal, shutting down.");
        flag.store(true, Ordering::SeqCst);
    }).map_err(|err| {
        Error::Config(format!("cannot install signal handler: {}", err))
    })?;

    server.run(&stop);
    server.shutdown();
    Ok(())
}
