//! Outbound service clients.

pub mod api;
pub mod completion;
pub mod explanation;
pub mod prompt;

pub use api::{ApiClient, CacheRecord};
pub use completion::CompletionClient;
pub use explanation::ExplanationService;
pub use prompt::{build_prompt, parse_sections};
