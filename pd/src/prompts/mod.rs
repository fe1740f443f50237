//! Prompt Template System
//!
//! Template loading chain:
//! 1. `{override-dir}/{name}.pmt`
//! 2. Embedded fallback compiled from `prompts/`
//!
//! Templates use Handlebars syntax for variable substitution.

pub mod embedded;
mod loader;

pub use loader::PromptLoader;
