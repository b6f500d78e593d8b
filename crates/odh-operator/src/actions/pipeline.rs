use std::fmt::Debug;

use snafu::{Snafu, ensure};
use tracing::{debug, info, trace};

use crate::{
    actions::Action,
    errors::ActionError,
    types::{PlatformObject, ReconciliationRequest},
};

#[derive(Debug, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("pipeline {pipeline:?} has no actions"))]
    NoActions { pipeline: String },

    #[snafu(display("action {action:?} is registered twice in pipeline {pipeline:?}"))]
    DuplicateAction { pipeline: String, action: String },
}

/// An ordered list of actions run for every reconciliation.
pub struct Pipeline<T> {
    name: String,
    actions: Vec<Box<dyn Action<T>>>,
}

impl<T> Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "actions",
                &self.actions.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<T: PlatformObject> Pipeline<T> {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<T> {
        PipelineBuilder {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs the actions in order, returning the error of the first failing one.
    ///
    /// Actions after a failing one are never run, no matter whether the error
    /// asks for a retry or stops the reconciliation.
    pub async fn run(&self, rr: &mut ReconciliationRequest<T>) -> Result<(), ActionError> {
        for action in &self.actions {
            trace!(pipeline = %self.name, action = action.name(), "running action");

            let Err(err) = action.run(rr).await else {
                continue;
            };
            match &err {
                ActionError::Stop { .. } => info!(
                    pipeline = %self.name,
                    action = action.name(),
                    reason = %err.cause_message(),
                    "reconciliation stopped"
                ),
                ActionError::Retryable { .. } => debug!(
                    pipeline = %self.name,
                    action = action.name(),
                    error = &err as &dyn std::error::Error,
                    "action failed"
                ),
            }
            return Err(err);
        }

        Ok(())
    }
}

pub struct PipelineBuilder<T> {
    name: String,
    actions: Vec<Box<dyn Action<T>>>,
}

impl<T: PlatformObject> PipelineBuilder<T> {
    pub fn with_action(mut self, action: impl Action<T> + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn build(self) -> Result<Pipeline<T>, Error> {
        ensure!(!self.actions.is_empty(), NoActionsSnafu {
            pipeline: &self.name
        });

        for (index, action) in self.actions.iter().enumerate() {
            let duplicate = self.actions[..index]
                .iter()
                .any(|other| other.name() == action.name());
            ensure!(!duplicate, DuplicateActionSnafu {
                pipeline: &self.name,
                action: action.name(),
            });
        }

        Ok(Pipeline {
            name: self.name,
            actions: self.actions,
        })
    }
}
