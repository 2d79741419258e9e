//! Sandboxed multi-language grading engine.
//!
//! A `Grader` loads a submission once through a language `Toolchain`, runs
//! every test case against the loaded artifact inside a `Sandbox`, and folds
//! the outcomes into a `GradeReport`.

pub mod codec;
pub mod config;
pub mod drivers;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod loader;
pub mod sandbox;


pub use config::LanguageConfigManager;
pub use error::{CompileError, GradeError, SandboxError};
pub use executor::Grader;
pub use sandbox::Sandbox;
