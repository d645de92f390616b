//! vibe-server: multi-tenant hosting for generated static sites.
//!
//! - `config`: flags and environment
//! - `db`: user/project catalog
//! - `project_id`: id generation and validation
//! - `tenant`: `<project>.<base-domain>` host routing and static serving
//! - `web`: JSON API and the streaming chat endpoint

pub mod config;
pub mod db;
pub mod project_id;
pub mod tenant;
pub mod web;
