//! Log initialization shared by the simulator binary and the tests.

use colored::Color::{Green, Red, Yellow};
use logforth::append::{Stderr, Stdout};
use logforth::diagnostic::ThreadLocalDiagnostic;
use logforth::filter::env_filter::EnvFilterBuilder;
use logforth::layout::TextLayout;
use std::sync::Once;

static INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, Default)]
pub enum LogOutput {
    #[default]
    Stderr,
    Stdout,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directives, e.g. "info" or "info,kvslots::input_cache=debug".
    /// RUST_LOG wins when set.
    pub level: String,
    pub output: LogOutput,
    /// info=green, warn=yellow, error=red
    pub colored: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stderr,
            colored: true,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn stdout(mut self) -> Self {
        self.output = LogOutput::Stdout;
        self
    }

    pub fn no_color(mut self) -> Self {
        self.colored = false;
        self
    }
}

/// The host store logs every removal and copy at debug; keep it quiet unless
/// asked for by name.
const DEFAULT_MODULE_LEVELS: [(&str, &str); 1] = [("kvslots::host_store", "info")];

fn apply_default_module_levels(mut filter: String) -> String {
    for (module, level) in DEFAULT_MODULE_LEVELS {
        if filter.contains(&format!("{module}=")) {
            continue;
        }
        if !filter.is_empty() {
            filter.push(',');
        }
        filter.push_str(module);
        filter.push('=');
        filter.push_str(level);
    }
    filter
}

fn colored_layout() -> TextLayout {
    TextLayout::default()
        .info_color(Green)
        .warn_color(Yellow)
        .error_color(Red)
}

/// Install the global logger. Only the first call has any effect.
pub fn init(config: LoggingConfig) {
    INIT.call_once(|| {
        let LoggingConfig {
            level,
            output,
            colored,
        } = config;

        let filter = EnvFilterBuilder::from_env_or("RUST_LOG", apply_default_module_levels(level)).build();
        let builder = logforth::starter_log::builder();
        let builder = match output {
            LogOutput::Stdout => {
                let append = if colored {
                    Stdout::default().with_layout(colored_layout())
                } else {
                    Stdout::default()
                };
                builder.dispatch(|d| {
                    d.filter(filter)
                        .diagnostic(ThreadLocalDiagnostic::default())
                        .append(append)
                })
            }
            LogOutput::Stderr => {
                let append = if colored {
                    Stderr::default().with_layout(colored_layout())
                } else {
                    Stderr::default()
                };
                builder.dispatch(|d| {
                    d.filter(filter)
                        .diagnostic(ThreadLocalDiagnostic::default())
                        .append(append)
                })
            }
        };
        builder.apply();
    });
}

/// Uncolored stderr logging, for tests.
pub fn init_stderr(level: &str) {
    init(LoggingConfig::new(level).no_color());
}

pub fn init_default() {
    init(LoggingConfig::default());
}
