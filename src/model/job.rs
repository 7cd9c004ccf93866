use serde::{Deserialize, Serialize};

use super::FileDescriptor;

pub const JOB_TYPE_TRANSCODING: &str = "transcoding";
pub const JOB_TYPE_UPLOAD: &str = "upload";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Idle,
    Active,
}

impl JobState {
    pub fn as_i32(self) -> i32 {
        match self {
            JobState::Idle => 0,
            JobState::Active => 1,
        }
    }
}

/// Per-job settings blob, persisted next to the file descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub kind: String,
    pub file: FileDescriptor,
    pub config: JobConfig,
    pub retry: i32,
}
