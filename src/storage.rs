use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::auth::ACCESS_TOKEN_HEADER;
use crate::model::FileDescriptor;

pub const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

const UPLOAD_PATH: &str = "api/storage/file";

/// First frame of every upload stream.
#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    pub domain_id: i64,
    pub name: String,
    pub mime_type: String,
    pub uuid: String,
    pub created_at: i64,
    pub channel: i32,
    pub uploaded_by: i64,
    pub stream_response: bool,
    pub generate_thumbnail: bool,
}

impl UploadMetadata {
    pub fn from_file(file: &FileDescriptor) -> Self {
        Self {
            domain_id: file.domain_id,
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            uuid: file.uuid.clone(),
            created_at: file.created_at,
            channel: file.channel.as_i32(),
            uploaded_by: file.uploaded_by,
            stream_response: false,
            generate_thumbnail: true,
        }
    }
}

/// Client of the remote file service. An upload is a streaming multipart
/// request: the metadata frame goes first, the file body follows in
/// chunks fed through [`UploadStream`].
#[derive(Debug, Clone)]
pub struct FileStorage {
    base: Url,
    token: String,
    client: Client,
}

impl FileStorage {
    pub fn new(base: Url, token: String) -> Self {
        Self {
            base,
            token,
            client: Client::new(),
        }
    }

    pub async fn open_upload(&self, metadata: &UploadMetadata) -> Result<UploadStream> {
        let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(1);

        let mime = if metadata.mime_type.is_empty() {
            "application/octet-stream"
        } else {
            metadata.mime_type.as_str()
        };
        let form = Form::new()
            .part(
                "metadata",
                Part::text(serde_json::to_string(metadata)?).mime_str("application/json")?,
            )
            .part(
                "file",
                Part::stream(Body::wrap_stream(ReceiverStream::new(rx)))
                    .file_name(metadata.name.clone())
                    .mime_str(mime)?,
            );

        let url = self.base.join(UPLOAD_PATH)?;
        let request = self
            .client
            .post(url)
            .header(ACCESS_TOKEN_HEADER, &self.token)
            .multipart(form);

        let handle = tokio::spawn(async move {
            let response = request.send().await.context("sending upload stream")?;
            let status = response.status();
            if !status.is_success() {
                return Err(anyhow!("file service responded with {}", status));
            }
            Ok(())
        });

        Ok(UploadStream {
            sender: Some(tx),
            handle,
        })
    }
}

pub struct UploadStream {
    sender: Option<mpsc::Sender<std::result::Result<Bytes, std::io::Error>>>,
    handle: JoinHandle<Result<()>>,
}

impl UploadStream {
    /// Sends one binary chunk. Fails once the server side has gone away.
    pub async fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("upload stream is closed"))?;
        sender
            .send(Ok(chunk))
            .await
            .map_err(|_| anyhow!("upload stream aborted by the server"))
    }

    /// Closes the send half and waits for the server verdict.
    pub async fn finish(mut self) -> Result<()> {
        self.sender.take();
        self.handle.await.context("upload task failed")?
    }
}
