//! vibe-agent: build static sites with an LLM, one sandboxed file at a time.
//!
//! - `sandbox`: path containment for tenant roots
//! - `store`: atomic file operations over one tenant root
//! - `tools`: the four file tools the model may call
//! - `llm`: completion client abstraction and the Claude streaming client
//! - `orchestrator`: the bounded step loop that produces wire events

pub mod llm;
pub mod orchestrator;
pub mod sandbox;
pub mod store;
pub mod tools;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
