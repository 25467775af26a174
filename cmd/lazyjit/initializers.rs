use std::{io::IsTerminal, sync::Arc};

use eyre::WrapErr;
use lazyjit_core::Jit;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, Layer, filter::Directive, fmt, layer::SubscriberExt};

use crate::{cli::Options, frontend::AotFrontEnd};

/// Logs go to stderr; stdout belongs to the running program.
pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(include_target)
        .with_ansi(std::io::stderr().is_terminal())
        .with_filter(log_filter);

    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber was already installed");
    }
}

/// Build the JIT and hand it every module of the front end.
pub fn init_jit(opts: &Options, front_end: AotFrontEnd) -> eyre::Result<Jit> {
    let config = opts
        .jit_config()
        .wrap_err("invalid back-end arguments")?;
    let modules = front_end.load_modules()?;

    let jit = lazyjit_backend::reference_jit()
        .config(config)
        .module_provider(Arc::new(front_end))
        .build()
        .wrap_err("failed to start the JIT")?;

    for module in modules {
        let name = module.name.clone();
        jit.add_module(module)
            .wrap_err_with(|| format!("failed to add module `{name}`"))?;
    }
    info!(
        modules = jit.metrics().modules_added,
        data_layout = %jit.data_layout(),
        "JIT initialized"
    );
    Ok(jit)
}
