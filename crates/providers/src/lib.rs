//! LLM provider implementations and model routing for tidewire.
//!
//! All providers implement the `tidewire_core::Provider` trait.
//! The [`ModelRouter`] picks a model per task role and the provider serving it.

pub mod openai_compat;
pub mod router;
pub mod scripted;

pub use openai_compat::OpenAiCompatProvider;
pub use router::{build_from_config, ModelRouter, Resolution};
pub use scripted::{ScriptStep, ScriptedProvider};
