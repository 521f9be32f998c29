//! What happens after a step has run for a contact.

use std::time::Duration;

use crate::step::{AutomationStep, BRANCH_DEFAULT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Follow the child on `branch`, optionally after `delay`.
    Continue {
        branch: u32,
        delay: Option<Duration>,
    },
    /// The contact's path ends here.
    Stop,
}

impl StepOutcome {
    /// Single-edge steps (actions) continue on branch 0 immediately.
    pub fn next() -> Self {
        Self::Continue {
            branch: BRANCH_DEFAULT,
            delay: None,
        }
    }

    pub fn branch(branch: u32) -> Self {
        Self::Continue {
            branch,
            delay: None,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self::Continue {
            branch: BRANCH_DEFAULT,
            delay: Some(delay),
        }
    }

    /// The branch followed out of the step, `None` for `Stop`.
    pub fn followed_branch(&self) -> Option<u32> {
        match self {
            Self::Continue { branch, .. } => Some(*branch),
            Self::Stop => None,
        }
    }
}

/// Pick the child whose `branch_index` equals `branch`.
pub fn select_child(children: &[AutomationStep], branch: u32) -> Option<&AutomationStep> {
    children.iter().find(|c| c.branch_index == branch)
}
