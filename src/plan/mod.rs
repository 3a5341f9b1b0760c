//! The plan pipeline: interpreter → validator → executor.
//!
//! A plan starts as declarative script text. The [`interpreter`] parses it
//! and produces an ordered list of typed [`instruction::Instruction`]s plus
//! a return value, with **no side effects on the backend**. The
//! [`validator`] walks the list against a symbolic environment seeded from
//! the live enclave. The [`executor`] then drives the instructions serially
//! against the service network, streaming response lines to the client.
//!
//! Values that are unknowable at interpretation time (service IPs, exec
//! output) travel as future-reference tokens — magic strings resolved
//! immediately before each instruction runs (see [`future_ref`]).

pub mod executor;
pub mod future_ref;
pub mod instruction;
pub mod interpreter;
mod lexer;
mod parser;
pub mod validator;
pub mod value;

pub use executor::{ErrorKind, PlanExecutor, ResponseLine};
pub use instruction::{Instruction, InstructionPosition};
pub use interpreter::{Interpreter, Plan};
pub use validator::{PlanValidator, ValidatorEnvironment};

use crate::error::Result;
use std::collections::HashMap;

/// File name reported for positions when a raw script is run directly.
pub const DEFAULT_SCRIPT_FILENAME: &str = "main.plan";

/// Source of script-adjacent content: imported files, upload sources,
/// package members. Remote packaging is out of scope; whatever fetches the
/// content hands the runtime one of these.
pub trait ContentProvider: Send + Sync {
    /// Fetches the bytes behind a locator. Unknown locators are errors.
    fn get(&self, locator: &str) -> Result<Vec<u8>>;
}

/// Content provider over an in-memory map. Used for tests and for packages
/// uploaded as archives.
#[derive(Debug, Default)]
pub struct InMemoryContentProvider {
    entries: HashMap<String, Vec<u8>>,
}

impl InMemoryContentProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, locator: impl Into<String>, content: Vec<u8>) {
        self.entries.insert(locator.into(), content);
    }
}

impl ContentProvider for InMemoryContentProvider {
    fn get(&self, locator: &str) -> Result<Vec<u8>> {
        self.entries
            .get(locator)
            .cloned()
            .ok_or_else(|| crate::error::Error::ArtifactNotFound(locator.to_string()))
    }
}
