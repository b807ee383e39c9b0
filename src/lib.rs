//! Mail Triage: unattended mailbox triage with a tool-calling classifier.

pub mod config;
pub mod error;
pub mod folders;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod tools;
