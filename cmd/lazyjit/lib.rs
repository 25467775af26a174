pub mod cli;
pub mod frontend;
pub mod initializers;

use eyre::{WrapErr, bail};
use tracing::{debug, info};

use crate::{cli::Options, frontend::AotFrontEnd, initializers::init_jit};

/// Load the inputs, run the entry function and end the session.
///
/// Returns the process exit code: the entry's result, truncated to its low
/// 32 bits.
pub fn run(opts: &Options) -> eyre::Result<i32> {
    let front_end = AotFrontEnd::new(opts.inputs.clone())?;
    let jit = init_jit(opts, front_end)?;

    let entry = jit
        .lookup(&opts.entry)
        .wrap_err_with(|| format!("entry function `{}` is unavailable", opts.entry))?;
    let Some(arity) = entry.arity() else {
        bail!("entry symbol `{}` is not a function", opts.entry);
    };
    let args = entry_arguments(&opts.app_args, arity)?;
    debug!(entry = %opts.entry, app = %opts.app_name, ?args, "Calling entry function");

    let result = entry
        .call(&args)
        .wrap_err_with(|| format!("`{}` trapped", opts.entry))?;
    jit.end_session().wrap_err("failed to end the session")?;

    let metrics = jit.metrics();
    info!(
        result,
        materializations = metrics.materializations,
        reoptimizations = metrics.reoptimizations,
        "Program finished"
    );
    Ok(exit_code(result))
}

/// Arguments for an entry of the given arity: the argument count (program
/// name included) followed by the integer application arguments. Extra
/// arguments are dropped, missing ones are zero.
pub fn entry_arguments(app_args: &[String], arity: u32) -> eyre::Result<Vec<i64>> {
    let Ok(arity) = usize::try_from(arity) else {
        bail!("entry arity {arity} is not addressable");
    };
    if arity == 0 {
        return Ok(Vec::new());
    }

    let mut args = Vec::with_capacity(arity);
    args.push(i64::try_from(app_args.len() + 1)?);
    for raw in app_args.iter().take(arity - 1) {
        let value: i64 = raw
            .parse()
            .wrap_err_with(|| format!("application argument `{raw}` is not an integer"))?;
        args.push(value);
    }
    args.resize(arity, 0);
    Ok(args)
}

pub fn exit_code(result: i64) -> i32 {
    result as i32
}
