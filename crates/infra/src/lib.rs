//! Infrastructure layer: job queue, stores, mail, config and the job handlers.

pub mod automation;
pub mod broadcast;
pub mod config;
pub mod jobs;
pub mod mail;
pub mod store;

#[cfg(test)]
mod integration_tests;
