//! Durable saga workflow engine.
//!
//! Workflows are ordered lists of compensable steps. The engine persists a
//! resume point after every step, so a crashed process can pick each workflow
//! back up exactly where it stopped, and unwinds completed steps in reverse
//! order when a step fails fatally.

pub mod api;
pub mod cli;
pub mod engine;
pub mod services;
pub mod storage;
pub mod workflows;
