//! js-deflat: control-flow deflattening for obfuscated JavaScript.
//!
//! This library undoes the "flattened loop" obfuscation, where a function
//! body is chopped into a `for`/`switch` dispatcher driven by an opaque
//! switching variable. It symbolically executes the dispatcher into a
//! basic-block graph, prunes opaque predicates with a satisfiability
//! backend, recovers structured control flow, and re-emits JavaScript.

pub mod cli;
pub mod deflat;
pub mod error;
pub mod solver;

pub use deflat::{Deflattener, FlattenedLoop};
pub use error::{Error, Result};
pub use solver::{EnumerationBackend, NullBackend, SolverBackend};
