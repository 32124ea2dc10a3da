//! Shared domain types for the colloquy runtime.
//!
//! Everything that crosses a crate boundary lives here: the client/server
//! event codec, the provider-agnostic chat types, streaming aliases, the
//! persisted entities, configuration, and the shared error type.

pub mod chat;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod stream;
