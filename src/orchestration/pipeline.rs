//! # Staged Pipeline
//!
//! Ordered, named stages of steps for one operation type.
//!
//! ## Stages and Buffers
//!
//! Each stage carries a minimum buffer. When the cursor leaves one stage for the
//! next, the operation is requeued for at least that buffer instead of continuing in
//! the same tick, which gives external systems time to settle (e.g. waiting before
//! the first status poll of a freshly requested cluster).
//!
//! ## Cancellation
//!
//! A pipeline may declare a cancellation stage. Operations in `Canceling` run it
//! from its first step; when it completes the operation becomes `Canceled`. Without
//! one, cancellation completes immediately.
//!
//! ```rust
//! use runtime_lifecycle::models::{Operation, OperationType};
//! use runtime_lifecycle::orchestration::pipeline::StagedPipeline;
//! use runtime_lifecycle::orchestration::step::{Step, StepResult};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Noop;
//!
//! #[async_trait::async_trait]
//! impl Step for Noop {
//!     fn name(&self) -> &str {
//!         "Noop"
//!     }
//!
//!     async fn run(&self, operation: Operation) -> StepResult {
//!         StepResult::advance(operation)
//!     }
//! }
//!
//! let pipeline = StagedPipeline::builder(OperationType::Update)
//!     .stage("start", Duration::ZERO, vec![Arc::new(Noop) as Arc<dyn Step>])
//!     .build()
//!     .unwrap();
//! assert_eq!(pipeline.stage_names(), vec!["start"]);
//! ```

use crate::models::{OperationType, PipelineCursor};
use crate::orchestration::step::Step;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Name of the cancellation stage inside cursors
pub const CANCELLATION_STAGE: &str = "cancellation";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline for {0} has no stages")]
    Empty(OperationType),

    #[error("stage '{stage}' has no steps")]
    EmptyStage { stage: String },

    #[error("stage '{stage}' is declared twice")]
    DuplicateStage { stage: String },

    #[error("step '{step}' appears twice in stage '{stage}'")]
    DuplicateStep { stage: String, step: String },
}

pub struct Stage {
    name: String,
    buffer: Duration,
    steps: Vec<Arc<dyn Step>>,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    fn position_of(&self, step: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == step)
    }

    fn cursor_at(&self, index: usize) -> Option<PipelineCursor> {
        self.steps
            .get(index)
            .map(|step| PipelineCursor::new(self.name.clone(), step.name()))
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("buffer", &self.buffer)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Where the cursor goes after a completed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPosition {
    /// Next step; `buffer` is set when it belongs to a new stage
    Step {
        cursor: PipelineCursor,
        buffer: Option<Duration>,
    },
    /// The last step of the active track completed
    Finished,
}

#[derive(Debug)]
pub struct StagedPipeline {
    operation_type: OperationType,
    stages: Vec<Stage>,
    cancellation: Option<Stage>,
}

impl StagedPipeline {
    pub fn builder(operation_type: OperationType) -> StagedPipelineBuilder {
        StagedPipelineBuilder {
            operation_type,
            stages: Vec::new(),
            cancellation: None,
        }
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn has_cancellation_stage(&self) -> bool {
        self.cancellation.is_some()
    }

    fn track(&self, canceling: bool) -> &[Stage] {
        if canceling {
            self.cancellation.as_slice()
        } else {
            &self.stages
        }
    }

    /// First position of the main track, or of the cancellation stage
    pub fn first_cursor(&self, canceling: bool) -> Option<PipelineCursor> {
        self.track(canceling).first().and_then(|stage| stage.cursor_at(0))
    }

    /// Step addressed by `cursor`, `None` if the cursor is not part of the track
    pub fn step_at(&self, cursor: &PipelineCursor, canceling: bool) -> Option<&Arc<dyn Step>> {
        let stage = self
            .track(canceling)
            .iter()
            .find(|stage| stage.name == cursor.stage)?;
        stage
            .position_of(&cursor.step)
            .and_then(|index| stage.steps.get(index))
    }

    /// Position following `cursor`, `None` if the cursor is unknown
    pub fn next_after(&self, cursor: &PipelineCursor, canceling: bool) -> Option<NextPosition> {
        let track = self.track(canceling);
        let stage_index = track.iter().position(|stage| stage.name == cursor.stage)?;
        let stage = &track[stage_index];
        let step_index = stage.position_of(&cursor.step)?;

        if let Some(next) = stage.cursor_at(step_index + 1) {
            return Some(NextPosition::Step {
                cursor: next,
                buffer: None,
            });
        }

        Some(match track.get(stage_index + 1) {
            Some(next_stage) => match next_stage.cursor_at(0) {
                Some(cursor) => NextPosition::Step {
                    cursor,
                    buffer: Some(next_stage.buffer),
                },
                None => NextPosition::Finished,
            },
            None => NextPosition::Finished,
        })
    }
}

pub struct StagedPipelineBuilder {
    operation_type: OperationType,
    stages: Vec<Stage>,
    cancellation: Option<Stage>,
}

impl StagedPipelineBuilder {
    /// Append a stage; `buffer` applies when the cursor enters it from a previous stage
    pub fn stage(mut self, name: impl Into<String>, buffer: Duration, steps: Vec<Arc<dyn Step>>) -> Self {
        self.stages.push(Stage {
            name: name.into(),
            buffer,
            steps,
        });
        self
    }

    /// Steps run while the operation is canceling
    pub fn cancellation(mut self, steps: Vec<Arc<dyn Step>>) -> Self {
        self.cancellation = Some(Stage {
            name: CANCELLATION_STAGE.to_string(),
            buffer: Duration::ZERO,
            steps,
        });
        self
    }

    pub fn build(self) -> Result<StagedPipeline, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::Empty(self.operation_type));
        }

        let mut stage_names = HashSet::new();
        for stage in self.stages.iter().chain(self.cancellation.iter()) {
            if stage.steps.is_empty() {
                return Err(PipelineError::EmptyStage {
                    stage: stage.name.clone(),
                });
            }
            if !stage_names.insert(stage.name.as_str()) {
                return Err(PipelineError::DuplicateStage {
                    stage: stage.name.clone(),
                });
            }
            let mut step_names = HashSet::new();
            for step in &stage.steps {
                if !step_names.insert(step.name()) {
                    return Err(PipelineError::DuplicateStep {
                        stage: stage.name.clone(),
                        step: step.name().to_string(),
                    });
                }
            }
        }

        Ok(StagedPipeline {
            operation_type: self.operation_type,
            stages: self.stages,
            cancellation: self.cancellation,
        })
    }
}
