use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use tokio::process::Command;

const STDERR_TAIL: usize = 512;

/// Wrapper around the external ffmpeg binary. Remuxes a recorded raw
/// container into MP4 without touching the video bitstream.
#[derive(Debug, Clone)]
pub struct Transcoder {
    bin: String,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self {
            bin: "ffmpeg".to_string(),
        }
    }

    pub fn with_binary(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    pub async fn run(&self, input: &str, output: &str) -> Result<()> {
        let result = Command::new(&self.bin)
            .arg("-nostdin")
            .arg("-y")
            .args(["-fflags", "+genpts"])
            .args(["-i", input])
            .args(["-c:v", "copy"])
            .args(["-movflags", "+faststart"])
            .args(["-f", "mp4"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("spawning {}", self.bin))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let mut start = stderr.len().saturating_sub(STDERR_TAIL);
            while !stderr.is_char_boundary(start) {
                start -= 1;
            }
            let tail = &stderr[start..];
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.bin,
                result.status,
                tail.trim()
            ));
        }
        Ok(())
    }
}
