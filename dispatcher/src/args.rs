use std::{borrow::Cow, fmt, io::IsTerminal, path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand, ValueEnum};
use config::Config;
use logforth::filter::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dispatcher", version, about = "Operator harness for the LLM dispatch layer")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "DISPATCH_CONFIG_PATH", default_value = "./dispatch.toml")]
    pub config: PathBuf,
    /// Set the logging level of the workspace crates.
    #[arg(long = "log", env = "DISPATCH_LOG", default_value_t = LogLevel::default())]
    pub log_level: LogLevel,
    /// Set the style of log output
    #[arg(long, env = "DISPATCH_LOG_STYLE", default_value_t = LogStyle::default())]
    pub log_style: LogStyle,
    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn config(&self) -> anyhow::Result<Config> {
        let config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            Config::default()
        };

        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Dispatch one chat request and print the completion
    Chat {
        /// System prompt
        #[arg(long)]
        system: String,
        /// User prompt
        #[arg(long)]
        user: String,
        /// Completion token limit, defaults to the configured one
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Print the ranked free OpenRouter models
    Models {
        /// Also print this many of the cheapest paid models
        #[arg(long, default_value_t = 0)]
        paid: usize,
    },
    /// Copy the mirrored bucket states into the live store
    Warm,
    /// Run one limiter admission and print the decision
    Allow {
        /// Bucket key, such as `groq:1f2e...`
        bucket_key: String,
        /// Tokens to consume
        #[arg(long, default_value_t = 1)]
        cost: i64,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogStyle {
    /// Colorized text, used as the default with TTY output
    Color,
    /// Standard text, used as the default with non-TTY output
    Text,
    /// JSON objects
    Json,
}

impl Default for LogStyle {
    fn default() -> Self {
        if std::io::stderr().is_terminal() {
            LogStyle::Color
        } else {
            LogStyle::Text
        }
    }
}

impl AsRef<str> for LogStyle {
    fn as_ref(&self) -> &str {
        match self {
            LogStyle::Color => "color",
            LogStyle::Text => "text",
            LogStyle::Json => "json",
        }
    }
}

impl fmt::Display for LogStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub(crate) enum LogLevel {
    /// Disable logging
    Off,
    /// Only log errors
    Error,
    /// Log errors, and warnings
    Warn,
    /// Log errors, warnings, and info messages
    #[default]
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log errors, warnings, info, debug, and trace messages
    Trace,
}

impl LogLevel {
    pub fn env_filter(self) -> anyhow::Result<EnvFilter> {
        let filter = match self {
            LogLevel::Off => Cow::Borrowed("off"),
            // Other crates stay at warn.
            level => Cow::Owned(format!(
                "warn,dispatcher={level},config={level},rate_limit={level},llm={level}"
            )),
        };

        Ok(EnvFilter::from_str(&filter)?)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}
