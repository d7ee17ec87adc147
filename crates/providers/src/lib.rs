//! LLM Provider implementations for Blade.
//!
//! All providers implement the `blade_core::Provider` trait.
//! The factory builds the right provider from a model entry.

pub mod factory;
pub mod openai_compat;

pub use factory::{DefaultProviderFactory, ProviderFactory, default_base_url};
pub use openai_compat::OpenAiCompatProvider;
