use std::env;

use slog::{o, Drain, FilterLevel, Logger};

/// Build the root logger: compact terminal output behind an async drain,
/// filtered through the `SEINE_LOG` environment variable.
pub fn logger(show_debug: bool) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::LogBuilder::new(drain)
        .filter(
            None,
            if show_debug {
                FilterLevel::Debug
            } else {
                FilterLevel::Info
            },
        )
        .parse(
            env::var("SEINE_LOG")
                .unwrap_or_default()
                .as_str(),
        )
        .build();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// A logger that swallows everything. For tests.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Factory for component loggers hanging off one root logger.
#[derive(Clone)]
pub struct LoggerFactory {
    parent: Logger,
}

impl LoggerFactory {
    pub fn new(logger: Logger) -> Self {
        Self { parent: logger }
    }

    pub fn with_parent(&self, parent: Logger) -> Self {
        Self { parent }
    }

    pub fn component_logger(&self, component: &str) -> Logger {
        self.parent.new(o!("component" => component.to_string()))
    }

    /// A component logger additionally scoped to one chain.
    pub fn chain_logger(&self, component: &str, chain_id: u64) -> Logger {
        self.parent
            .new(o!("component" => component.to_string(), "chain_id" => chain_id))
    }
}
