use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Destination channel of an uploaded recording. Encoded as an integer on
/// the wire; anything unknown falls back to screen sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileChannel {
    Call,
    #[default]
    ScreenSharing,
}

impl FileChannel {
    pub fn as_i32(self) -> i32 {
        match self {
            FileChannel::Call => 1,
            FileChannel::ScreenSharing => 2,
        }
    }
}

impl From<i32> for FileChannel {
    fn from(value: i32) -> Self {
        match value {
            1 => FileChannel::Call,
            _ => FileChannel::ScreenSharing,
        }
    }
}

impl Serialize for FileChannel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for FileChannel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        i32::deserialize(deserializer).map(Into::into)
    }
}

/// Record carried through the whole pipeline, from session creation to the
/// remote upload. `path` is assigned exactly once by the scratch store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(default)]
    pub domain_id: i64,
    #[serde(default)]
    pub uploaded_by: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub channel: FileChannel,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
}
