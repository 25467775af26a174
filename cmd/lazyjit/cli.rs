use std::path::PathBuf;

use clap::Parser as ClapParser;
use lazyjit_core::{JitConfig, JitError};
use tracing::Level;

#[derive(ClapParser, Debug, Clone)]
#[command(
    name = "lazyjit",
    version,
    about = "Runs IR modules on a lazy, reoptimizing JIT"
)]
pub struct Options {
    #[arg(
        short = 'i',
        long = "input",
        value_name = "MODULE_FILES",
        value_delimiter = ',',
        num_args = 1..,
        required = true,
        help = "Comma separated list of module files (`.json`).",
        help_heading = "Input options",
        env = "LAZYJIT_INPUT"
    )]
    pub inputs: Vec<PathBuf>,
    #[arg(
        short = 'b',
        long = "backend-args",
        value_name = "ARGS",
        allow_hyphen_values = true,
        help = "Space separated back-end arguments.",
        long_help = "Accepted: -opt=<pipeline>, -reopt=<pipeline>, -threshold=<calls>. Explicit flags take precedence.",
        help_heading = "JIT options",
        env = "LAZYJIT_BACKEND_ARGS"
    )]
    pub backend_args: Option<String>,
    #[arg(
        long = "opt",
        value_name = "PIPELINE",
        help = "Pipeline for first-time compilation, e.g. `default<O1>`.",
        help_heading = "JIT options",
        env = "LAZYJIT_OPT"
    )]
    pub optimize_pipeline: Option<String>,
    #[arg(
        long = "reopt",
        value_name = "PIPELINE",
        help = "Pipeline used when a hot module is recompiled.",
        help_heading = "JIT options",
        env = "LAZYJIT_REOPT"
    )]
    pub reoptimize_pipeline: Option<String>,
    #[arg(
        long = "threshold",
        value_name = "CALLS",
        help = "Calls into a module before it is reoptimized. 0 reoptimizes on the first call.",
        help_heading = "JIT options",
        env = "LAZYJIT_THRESHOLD"
    )]
    pub threshold: Option<u64>,
    #[arg(
        long = "max-version",
        value_name = "VERSION",
        help = "Highest version a module may be reoptimized to. Unbounded by default.",
        help_heading = "JIT options",
        env = "LAZYJIT_MAX_VERSION"
    )]
    pub max_version: Option<u32>,
    #[arg(
        long = "workers",
        default_value_t = 1,
        value_name = "COUNT",
        value_parser = clap::value_parser!(u16).range(1..=64),
        help = "Background reoptimization workers.",
        help_heading = "JIT options",
        env = "LAZYJIT_WORKERS"
    )]
    pub workers: u16,
    #[arg(
        long = "entry",
        default_value = "main",
        value_name = "SYMBOL",
        help = "Function to run. Its first invocation is reported to telemetry.",
        help_heading = "JIT options",
        env = "LAZYJIT_ENTRY"
    )]
    pub entry: String,
    #[arg(
        long = "log-level",
        default_value_t = Level::WARN,
        value_name = "LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        env = "LAZYJIT_LOG_LEVEL"
    )]
    pub log_level: Level,
    #[arg(value_name = "APP_NAME", required = true, help = "Application name, passed as argv[0].")]
    pub app_name: String,
    #[arg(
        value_name = "APP_ARGS",
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Integer arguments passed to the entry function."
    )]
    pub app_args: Vec<String>,
}

impl Options {
    /// JIT configuration: defaults, then `--backend-args`, then explicit flags.
    pub fn jit_config(&self) -> Result<JitConfig, JitError> {
        let mut config = JitConfig::default();
        if let Some(args) = &self.backend_args {
            let args: Vec<&str> = args.split_whitespace().collect();
            config.apply_backend_args(&args)?;
        }
        if let Some(pipeline) = &self.optimize_pipeline {
            config.optimize_pipeline.clone_from(pipeline);
        }
        if let Some(pipeline) = &self.reoptimize_pipeline {
            config.reoptimize_pipeline.clone_from(pipeline);
        }
        if let Some(threshold) = self.threshold {
            config.reoptimize_threshold = threshold;
        }
        config.max_reoptimize_version = self.max_version;
        config.reoptimize_workers = usize::from(self.workers);
        config.entry_symbol = Some(self.entry.clone());
        Ok(config)
    }
}
