//! LM provider adapters.
//!
//! The core speaks to language-model backends through the narrow
//! [`LmProvider`] trait. The only concrete adapter is [`OllamaProvider`];
//! the [`LmHub`] hands out lazily-created, shared instances keyed by
//! backend URL.

pub mod hub;
pub mod ollama;
mod traits;

pub use hub::LmHub;
pub use ollama::OllamaProvider;
pub use traits::{LmProvider, LmRequest};
