use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lazy_static::lazy_static;

lazy_static! {
    pub static ref ENV_VARS: EnvVars = EnvVars::from_env();
}

#[derive(Clone, Debug)]
pub struct EnvVars {
    /// Deadline for processing a single block before its queue entry is
    /// cancelled and restacked.
    ///
    /// Set by the environment variable `SEINE_BLOCK_TIMEOUT_SECS` (expressed
    /// in seconds). The default value is 30 seconds; values below 10 seconds
    /// are raised to 10.
    pub block_timeout: Duration,
    /// How long the dispatcher sleeps between polls of an empty block queue.
    ///
    /// Set by the environment variable `SEINE_QUEUE_POLL_INTERVAL_MS`
    /// (expressed in milliseconds). The default value is 1000ms.
    pub queue_poll_interval: Duration,
    /// Width of the bounded queue that provider and store I/O inside a block
    /// runs through.
    ///
    /// Set by the environment variable `SEINE_CONCURRENCY`. The default
    /// value is 10.
    pub concurrency: usize,
    /// Per-attempt deadline for a single provider RPC call.
    ///
    /// Set by the environment variable `SEINE_JSON_RPC_TIMEOUT_SECS`
    /// (expressed in seconds). The default value is 180 seconds.
    pub json_rpc_timeout: Duration,
    /// Scratch root for staged block and receipt artefacts.
    ///
    /// Set by the environment variable `SEINE_STAGING_DIR`. The default
    /// value is `staging`.
    pub staging_dir: PathBuf,
    /// Emit a fetch retry log line every this many attempts.
    ///
    /// Set by the environment variable `SEINE_RETRY_LOG_AFTER`. The default
    /// value is 10.
    pub retry_log_after: u64,
}

impl EnvVars {
    pub fn from_env() -> Self {
        EnvVars {
            block_timeout: Duration::from_secs(
                parsed("SEINE_BLOCK_TIMEOUT_SECS", 30u64).max(10),
            ),
            queue_poll_interval: Duration::from_millis(parsed(
                "SEINE_QUEUE_POLL_INTERVAL_MS",
                1000u64,
            )),
            concurrency: parsed("SEINE_CONCURRENCY", 10usize),
            json_rpc_timeout: Duration::from_secs(parsed("SEINE_JSON_RPC_TIMEOUT_SECS", 180u64)),
            staging_dir: PathBuf::from(parsed(
                "SEINE_STAGING_DIR",
                "staging".to_owned(),
            )),
            retry_log_after: parsed("SEINE_RETRY_LOG_AFTER", 10u64),
        }
    }
}

/// Read and parse one configuration variable, falling back to `default`
/// when it is unset. A value that is present but malformed is a
/// configuration error, and the process refuses to start.
fn parsed<T: FromStr>(name: &str, default: T) -> T
where
    T::Err: fmt::Display,
{
    let Some(raw) = std::env::var_os(name) else {
        return default;
    };
    raw.to_str()
        .unwrap_or_else(|| panic!("{} is not valid UTF-8", name))
        .trim()
        .parse()
        .unwrap_or_else(|e| panic!("invalid value for {}: {}", name, e))
}
