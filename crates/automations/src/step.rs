//! Automation step records.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use mailpulse_core::{AutomationId, StepId};

/// Branch followed by steps with a single outgoing edge.
pub const BRANCH_DEFAULT: u32 = 0;
/// If/else branch taken when the rule's predicate matches.
pub const BRANCH_THEN: u32 = 0;
/// If/else branch taken when the rule's predicate does not match.
pub const BRANCH_ELSE: u32 = 1;

/// Built-in step subtypes.
pub mod subtype {
    pub const TRIGGER_SEGMENT: &str = "TRIGGER_SEGMENT";
    pub const ACTION_ADD_TAG: &str = "ACTION_ADD_TAG";
    pub const ACTION_REMOVE_TAG: &str = "ACTION_REMOVE_TAG";
    pub const ACTION_SEND_EMAIL: &str = "ACTION_SEND_EMAIL";
    pub const RULE_IF_ELSE: &str = "RULE_IF_ELSE";
    pub const RULE_WAIT: &str = "RULE_WAIT";
    pub const END: &str = "END";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    Trigger,
    Action,
    Rule,
    End,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Trigger => "TRIGGER",
            StepType::Action => "ACTION",
            StepType::Rule => "RULE",
            StepType::End => "END",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRIGGER" => Some(Self::Trigger),
            "ACTION" => Some(Self::Action),
            "RULE" => Some(Self::Rule),
            "END" => Some(Self::End),
            _ => None,
        }
    }
}

/// Subtype configuration could not be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {subtype} configuration on step {step_id}: {message}")]
pub struct StepConfigError {
    pub step_id: StepId,
    pub subtype: String,
    pub message: String,
}

/// One node of an automation tree.
///
/// Steps point at their parent by id; children are found by looking up steps whose
/// `parent_id` is this step. `branch_index` tells siblings of a multi-way rule apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationStep {
    pub id: StepId,
    pub automation_id: AutomationId,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub subtype: String,
    pub parent_id: Option<StepId>,
    #[serde(default)]
    pub branch_index: u32,
    #[serde(default)]
    pub config: JsonValue,
}

impl AutomationStep {
    pub fn new(
        automation_id: AutomationId,
        step_type: StepType,
        subtype: impl Into<String>,
        config: JsonValue,
    ) -> Self {
        Self {
            id: StepId::new(),
            automation_id,
            step_type,
            subtype: subtype.into(),
            parent_id: None,
            branch_index: BRANCH_DEFAULT,
            config,
        }
    }

    /// Attach this step under `parent` on the given branch.
    pub fn child_of(mut self, parent: &AutomationStep, branch_index: u32) -> Self {
        self.parent_id = Some(parent.id);
        self.branch_index = branch_index;
        self
    }

    pub fn with_id(mut self, id: StepId) -> Self {
        self.id = id;
        self
    }

    /// Decode the subtype-specific configuration.
    pub fn config_as<T: DeserializeOwned>(&self) -> Result<T, StepConfigError> {
        serde_json::from_value(self.config.clone()).map_err(|e| StepConfigError {
            step_id: self.id,
            subtype: self.subtype.clone(),
            message: e.to_string(),
        })
    }

    pub fn is_trigger(&self) -> bool {
        self.step_type == StepType::Trigger
    }
}
