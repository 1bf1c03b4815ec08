use clap::Parser;
use miette::Result;

use js_deflat::cli::{self, Cli};

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    cli::run(&cli)?;
    Ok(())
}
