use chrono::Utc;
use uuid::Uuid;

mod file;
mod job;

pub use file::{FileChannel, FileDescriptor};
pub use job::{Job, JobConfig, JobState, JOB_TYPE_TRANSCODING, JOB_TYPE_UPLOAD};

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
