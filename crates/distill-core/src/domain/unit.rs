//! Conversational unit: the input datum the pipeline processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::UnitId;
use super::task::TaskType;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Preprocessed,
    Extracted,
    Derived,
    Observed,
}

impl PipelineStage {
    /// The task that must run after this stage completed, if any.
    pub fn next_task(self) -> Option<TaskType> {
        match self {
            PipelineStage::Preprocessed => Some(TaskType::Extract),
            PipelineStage::Extracted => Some(TaskType::ResolveAndDerive),
            PipelineStage::Derived => Some(TaskType::RunObservers),
            PipelineStage::Observed => None,
        }
    }
}

/// Resume point for a unit whose last completed stage is `stage`.
pub fn resume_task(stage: Option<PipelineStage>) -> Option<TaskType> {
    match stage {
        None => Some(TaskType::Preprocess),
        Some(stage) => stage.next_task(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationalUnit {
    pub id: UnitId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,

    /// Flipped exactly once, when the whole pipeline has completed.
    #[serde(default)]
    pub processed: bool,

    /// Last stage that completed. `None` for fresh units and for units
    /// written before stages were tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
}

impl ConversationalUnit {
    pub fn new(text: impl Into<String>, session_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: UnitId::new(),
            text: text.into(),
            speaker: None,
            session_id: session_id.into(),
            timestamp,
            processed: false,
            stage: None,
        }
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_walks_the_pipeline_in_order() {
        assert_eq!(resume_task(None), Some(TaskType::Preprocess));
        assert_eq!(resume_task(Some(PipelineStage::Preprocessed)), Some(TaskType::Extract));
        assert_eq!(
            resume_task(Some(PipelineStage::Extracted)),
            Some(TaskType::ResolveAndDerive)
        );
        assert_eq!(resume_task(Some(PipelineStage::Derived)), Some(TaskType::RunObservers));
        assert_eq!(resume_task(Some(PipelineStage::Observed)), None);
    }

    #[test]
    fn stages_are_ordered() {
        assert!(PipelineStage::Preprocessed < PipelineStage::Observed);
    }
}
