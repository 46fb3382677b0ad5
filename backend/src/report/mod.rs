//! Narrative report generation: prompt, remote model with bounded retries,
//! deterministic fallback and section assembly.

mod assembler;
mod client;
mod fallback;
mod generator;
mod prompt;

pub use assembler::{Draft, MISSING_SECTION, assemble};
pub use client::{GenerationError, GenerationParams, HuggingFaceClient, TextGenerator};
pub use fallback::{FALLBACK_MODEL, fallback_report};
pub use generator::{ReportGenerator, RetryPolicy};
pub use prompt::{build_prompt, percent};
