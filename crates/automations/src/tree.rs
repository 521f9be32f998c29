//! Arena view over an automation's steps.
//!
//! Steps are stored flat, keyed by id, with parent pointers. The tree is rebuilt on
//! demand from that arena and validated before an automation is activated; workers
//! never hold it, they fetch single steps per job.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use mailpulse_core::{AutomationId, StepId};

use crate::step::{subtype, AutomationStep, StepType, BRANCH_DEFAULT, BRANCH_ELSE, BRANCH_THEN};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("automation has no trigger step")]
    MissingTrigger,

    #[error("automation has more than one trigger step")]
    MultipleTriggers,

    #[error("trigger step {0} must not have a parent")]
    TriggerHasParent(StepId),

    #[error("step {0} has no parent but is not the trigger")]
    DetachedStep(StepId),

    #[error("step {step} references missing parent {parent}")]
    MissingParent { step: StepId, parent: StepId },

    #[error("step {0} belongs to a different automation")]
    ForeignStep(StepId),

    #[error("duplicate step id {0}")]
    DuplicateStep(StepId),

    #[error("step {0} is part of a cycle")]
    Cycle(StepId),

    #[error("branch {branch} is not valid under step {parent}")]
    InvalidBranch { parent: StepId, branch: u32 },

    #[error("branch {branch} is used twice under step {parent}")]
    DuplicateBranch { parent: StepId, branch: u32 },
}

#[derive(Debug, Clone)]
pub struct AutomationTree {
    automation_id: AutomationId,
    trigger: StepId,
    steps: HashMap<StepId, AutomationStep>,
    children: HashMap<StepId, BTreeMap<u32, StepId>>,
}

impl AutomationTree {
    /// Build and validate a tree from the automation's flat step list.
    pub fn new(automation_id: AutomationId, steps: Vec<AutomationStep>) -> Result<Self, TreeError> {
        let mut arena = HashMap::with_capacity(steps.len());
        let mut trigger = None;

        for step in steps {
            if step.automation_id != automation_id {
                return Err(TreeError::ForeignStep(step.id));
            }
            if step.is_trigger() {
                if trigger.replace(step.id).is_some() {
                    return Err(TreeError::MultipleTriggers);
                }
                if step.parent_id.is_some() {
                    return Err(TreeError::TriggerHasParent(step.id));
                }
            } else if step.parent_id.is_none() {
                return Err(TreeError::DetachedStep(step.id));
            }
            let id = step.id;
            if arena.insert(id, step).is_some() {
                return Err(TreeError::DuplicateStep(id));
            }
        }

        let trigger = trigger.ok_or(TreeError::MissingTrigger)?;

        let mut children: HashMap<StepId, BTreeMap<u32, StepId>> = HashMap::new();
        for step in arena.values() {
            let Some(parent_id) = step.parent_id else {
                continue;
            };
            let parent = arena.get(&parent_id).ok_or(TreeError::MissingParent {
                step: step.id,
                parent: parent_id,
            })?;
            if !branch_allowed(parent, step.branch_index) {
                return Err(TreeError::InvalidBranch {
                    parent: parent_id,
                    branch: step.branch_index,
                });
            }
            let slots = children.entry(parent_id).or_default();
            if slots.insert(step.branch_index, step.id).is_some() {
                return Err(TreeError::DuplicateBranch {
                    parent: parent_id,
                    branch: step.branch_index,
                });
            }
        }

        // With exactly one root and every other step parented, a parent chain longer
        // than the arena can only loop.
        for step in arena.values() {
            let mut hops = 0usize;
            let mut cursor = step.parent_id;
            while let Some(id) = cursor {
                hops += 1;
                if hops > arena.len() {
                    return Err(TreeError::Cycle(step.id));
                }
                cursor = arena.get(&id).and_then(|s| s.parent_id);
            }
        }

        Ok(Self {
            automation_id,
            trigger,
            steps: arena,
            children,
        })
    }

    pub fn automation_id(&self) -> AutomationId {
        self.automation_id
    }

    pub fn trigger(&self) -> &AutomationStep {
        &self.steps[&self.trigger]
    }

    pub fn get(&self, id: &StepId) -> Option<&AutomationStep> {
        self.steps.get(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Children of `id`, ordered by branch index.
    pub fn children(&self, id: &StepId) -> Vec<&AutomationStep> {
        self.children
            .get(id)
            .map(|slots| slots.values().filter_map(|c| self.steps.get(c)).collect())
            .unwrap_or_default()
    }

    pub fn child_at(&self, id: &StepId, branch: u32) -> Option<&AutomationStep> {
        self.children
            .get(id)
            .and_then(|slots| slots.get(&branch))
            .and_then(|c| self.steps.get(c))
    }

    /// Steps in depth-first order starting at the trigger.
    pub fn walk(&self) -> Vec<&AutomationStep> {
        let mut out = Vec::with_capacity(self.steps.len());
        let mut stack = vec![self.trigger];
        while let Some(id) = stack.pop() {
            if let Some(step) = self.steps.get(&id) {
                out.push(step);
            }
            if let Some(slots) = self.children.get(&id) {
                stack.extend(slots.values().rev().copied());
            }
        }
        out
    }
}

fn branch_allowed(parent: &AutomationStep, branch: u32) -> bool {
    match parent.step_type {
        StepType::End => false,
        StepType::Trigger | StepType::Action => branch == BRANCH_DEFAULT,
        StepType::Rule => match parent.subtype.as_str() {
            subtype::RULE_IF_ELSE => branch == BRANCH_THEN || branch == BRANCH_ELSE,
            subtype::RULE_WAIT => branch == BRANCH_DEFAULT,
            // Rule kinds this build does not know about may fan out further.
            _ => true,
        },
    }
}
