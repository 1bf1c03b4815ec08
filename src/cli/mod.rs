//! Command-line interface: argument parsing and the file-to-file driver.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::deflat::Deflattener;
use crate::error::Result;
use crate::solver::{EnumerationBackend, NullBackend, SolverBackend};

#[derive(Parser)]
#[command(name = "js-deflat")]
#[command(about = "Recover structured control flow from flattened JavaScript")]
#[command(version)]
pub struct Cli {
    /// Input JavaScript file
    pub input: PathBuf,

    /// Output JavaScript file (written only on success)
    pub output: PathBuf,

    /// 1-based line on which the dispatcher `for` statement starts
    #[arg(short, long, default_value_t = 1)]
    pub line: usize,

    /// Write the reduced block graph as Graphviz DOT (optional)
    #[arg(long)]
    pub dot: Option<PathBuf>,

    /// Opaque-predicate solver backend
    #[arg(long, value_enum, default_value_t = SolverChoice::Auto)]
    pub solver: SolverChoice,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SolverChoice {
    /// z3 when built with the `z3` feature, bounded enumeration otherwise
    Auto,
    /// Bounded-domain enumeration
    Enum,
    /// No solving; every fork is retained
    Off,
}

pub fn make_backend(choice: SolverChoice) -> Box<dyn SolverBackend> {
    match choice {
        SolverChoice::Auto => {
            #[cfg(feature = "z3")]
            {
                Box::new(crate::solver::z3::Z3Backend::new())
            }
            #[cfg(not(feature = "z3"))]
            {
                Box::new(EnumerationBackend::new())
            }
        }
        SolverChoice::Enum => Box::new(EnumerationBackend::new()),
        SolverChoice::Off => Box::new(NullBackend),
    }
}

pub fn run(cli: &Cli) -> Result<()> {
    let source = std::fs::read_to_string(&cli.input)?;

    let mut deflattener =
        Deflattener::new(make_backend(cli.solver)).capture_dot(cli.dot.is_some());

    let Some(output) = deflattener.deflatten(&source, cli.line)? else {
        // Not finding the pattern is a report, not a failure.
        eprintln!(
            "no flattened dispatcher starts on line {} of {}; output not written",
            cli.line,
            cli.input.display()
        );
        return Ok(());
    };

    if let Some(dot_path) = &cli.dot {
        if let Some(dot) = deflattener.take_dot() {
            std::fs::write(dot_path, dot)?;
        }
    }
    std::fs::write(&cli.output, output)?;
    Ok(())
}
