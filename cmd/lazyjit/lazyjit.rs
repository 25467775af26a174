use clap::Parser;
use lazyjit::{cli::Options, initializers::init_tracing, run};

fn main() -> eyre::Result<()> {
    let opts = Options::parse();
    init_tracing(&opts);

    let code = run(&opts)?;
    std::process::exit(code);
}
