//! LLM client trait, provider implementations, and call plumbing.
//!
//! Every LLM entry point in the crate goes through [`LlmClient::infer`] and
//! shares the same throttling, backoff and strict-JSON parsing helpers, so
//! rate limits and malformed replies are handled uniformly.

mod client;
mod json;
mod throttle;

pub use client::{GeminiClient, LlmClient, LlmConfig, MockLlm, OpenAiCompatClient};
pub use json::{extract_json_array, extract_json_object};
pub use throttle::{cancel_pair, retry_with_backoff, CancelFlag, CancelHandle, Throttle};
