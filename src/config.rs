//! Configuration.
//!
//! The server is configured through the command line. [`Opt`] describes the
//! options, [`Config`] is the resolved configuration used by the
//! [`Server`](crate::orchestrator::Server).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use log::LevelFilter;
use structopt::StructOpt;
use crate::error::Error;
use crate::pdu::Timing;


/// The default address to listen on for RTR connections.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:3323";

/// The default number of database worker threads.
pub const DEFAULT_DB_THREADS: &str = "4";

/// The default number of seconds between cache refreshes.
pub const DEFAULT_REFRESH_SECONDS: &str = "600";

/// The default number of deltas kept by the database.
pub const DEFAULT_HISTORY: &str = "10";


//------------ Opt -----------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rtrd",
    about = "Serves validated ROA payloads to routers via RPKI-RTR.",
)]
pub struct Opt {
    /// Verbose mode (-v, -vv, -vvv)
    #[structopt(
        short = "v",
        long = "verbose",
        parse(from_occurrences),
        conflicts_with = "quiet"
    )]
    pub verbose: u8,

    /// Quiet mode (only errors)
    #[structopt(short = "q", long = "quiet", conflicts_with = "verbose")]
    pub quiet: bool,

    /// Address to listen on for RTR connections
    #[structopt(long = "listen", short = "l", default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Number of database worker threads
    #[structopt(long = "db-threads", default_value = DEFAULT_DB_THREADS)]
    pub db_threads: usize,

    /// Seconds between reloading the VRPs
    #[structopt(
        long = "refresh",
        value_name = "seconds",
        default_value = DEFAULT_REFRESH_SECONDS
    )]
    pub refresh: u64,

    /// Number of deltas to keep for serial queries
    #[structopt(long = "history", default_value = DEFAULT_HISTORY)]
    pub history: usize,

    /// Refresh interval announced to routers in seconds
    #[structopt(long = "rtr-refresh", value_name = "seconds")]
    pub rtr_refresh: Option<u32>,

    /// Retry interval announced to routers in seconds
    #[structopt(long = "rtr-retry", value_name = "seconds")]
    pub rtr_retry: Option<u32>,

    /// Expire interval announced to routers in seconds
    #[structopt(long = "rtr-expire", value_name = "seconds")]
    pub rtr_expire: Option<u32>,

    /// JSON file with the VRPs to serve
    #[structopt(long = "vrps", parse(from_os_str))]
    pub vrps: PathBuf,
}

impl Opt {
    /// Returns the log levels for our own and for everyone else’s messages.
    pub fn log_levels(&self) -> (LevelFilter, LevelFilter) {
        if self.quiet {
            (LevelFilter::Error, LevelFilter::Error)
        }
        else {
            match self.verbose {
                0 => (LevelFilter::Warn, LevelFilter::Warn),
                1 => (LevelFilter::Info, LevelFilter::Warn),
                2 => (LevelFilter::Debug, LevelFilter::Warn),
                3 => (LevelFilter::Trace, LevelFilter::Warn),
                _ => (LevelFilter::Trace, LevelFilter::Trace),
            }
        }
    }
}


//------------ Config --------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Config {
    /// The address to listen on.
    pub listen: SocketAddr,

    /// The number of database worker threads.
    pub db_threads: usize,

    /// The time between two cache refreshes.
    pub refresh: Duration,

    /// The number of deltas the database keeps.
    pub history: usize,

    /// The timing values sent to routers.
    pub timing: Timing,

    /// The JSON file with the VRPs.
    pub vrps: Option<PathBuf>,
}

impl Config {
    /// Resolves the command line options into a configuration.
    pub fn from_opt(opt: &Opt) -> Result<Self, Error> {
        let defaults = Timing::default();
        let res = Config {
            listen: opt.listen,
            db_threads: opt.db_threads,
            refresh: Duration::from_secs(opt.refresh),
            history: opt.history,
            timing: Timing {
                refresh: opt.rtr_refresh.unwrap_or(defaults.refresh),
                retry: opt.rtr_retry.unwrap_or(defaults.retry),
                expire: opt.rtr_expire.unwrap_or(defaults.expire),
            },
            vrps: Some(opt.vrps.clone()),
        };
        res.check()?;
        Ok(res)
    }

    /// Checks that the configuration is usable.
    pub fn check(&self) -> Result<(), Error> {
        if self.db_threads == 0 {
            return Err(Error::Config(
                "need at least one database thread".into()
            ))
        }
        if self.history == 0 {
            return Err(Error::Config("history must not be empty".into()))
        }
        if self.refresh < Duration::from_secs(1) {
            return Err(Error::Config(
                "refresh interval must be at least one second".into()
            ))
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: SocketAddr::from(([127, 0, 0, 1], 3323)),
            db_threads: 4,
            refresh: Duration::from_secs(600),
            history: 10,
            timing: Timing::default(),
            vrps: None,
        }
    }
}


//------------ Logging -------------------------------------------------------

fn log_without_target(
    out: fern::FormatCallback,
    message: &std::fmt::Arguments,
    record: &log::Record,
) {
    out.finish(format_args!(
        "{} {}: {}",
        chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
        record.level(),
        message,
    ))
}

fn log_with_target(
    out: fern::FormatCallback,
    message: &std::fmt::Arguments,
    record: &log::Record,
) {
    out.finish(format_args!(
        "{} {} [{}] {}",
        chrono::Local::now().format("%Y/%m/%d %H:%M:%S"),
        record.level(),
        record.target(),
        message,
    ))
}

/// Sets up logging to stderr according to the options.
pub fn init_logging(opt: &Opt) -> Result<(), Error> {
    let (own_level, other_level) = opt.log_levels();
    fern::Dispatch::new()
        .format(move |out, message, record| {
            if own_level <= LevelFilter::Debug {
                log_without_target(out, message, record)
            }
            else {
                log_with_target(out, message, record)
            }
        })
        .level(other_level)
        .level_for("rpki_rtr_server", own_level)
        .level_for("rtrd", own_level)
        .chain(std::io::stderr())
        .apply()
        .map_err(|err| {
            Error::Config(format!("cannot set up logging: {}", err))
        })
}

/// Parses the command line, sets up logging, and returns the configuration.
pub fn configure() -> Result<Config, Error> {
    let opt = Opt::from_args();
    init_logging(&opt)?;
    Config::from_opt(&opt)
}


//============ Testing =======================================================
