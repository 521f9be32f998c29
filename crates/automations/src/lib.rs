//! Automation workflows: step trees that move contacts from a trigger through
//! actions and rules to an end.
//!
//! This crate is pure domain: step records, their typed configuration, tree
//! validation and branch selection. Running steps against a store lives in
//! `mailpulse-infra`.

pub mod automation;
pub mod config;
pub mod outcome;
pub mod progress;
pub mod step;
pub mod tree;

pub use automation::Automation;
pub use config::{IfElseConfig, SendEmailConfig, TagConfig, TriggerConfig, WaitConfig};
pub use outcome::{select_child, StepOutcome};
pub use progress::{ContactAutomationStep, ContactStepStatus};
pub use step::{subtype, AutomationStep, StepConfigError, StepType, BRANCH_DEFAULT, BRANCH_ELSE, BRANCH_THEN};
pub use tree::{AutomationTree, TreeError};
