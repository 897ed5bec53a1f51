use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChatMessage, ContentPart, FilePayload, ImageUrl, InputAudio, MessageContent};

const FILE_PROTOCOL: &str = "file://";

#[derive(Debug, Error)]
pub enum InputError {
    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported attachment source '{0}'")]
    UnsupportedSource(String),
}

/// Every shape a case may use to describe what the user says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    Text(String),
    Message(ChatMessage),
    Messages(Vec<ChatMessage>),
}

impl InputSpec {
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            Self::Text(text) => vec![ChatMessage::user(text.clone())],
            Self::Message(message) => vec![message.clone()],
            Self::Messages(messages) => messages.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Message(_) => false,
            Self::Messages(messages) => messages.is_empty(),
        }
    }

    /// Short single-line rendering for logs.
    pub fn summary(&self, max_len: usize) -> String {
        let text = match self {
            Self::Text(text) => text.clone(),
            Self::Message(message) => message.text().unwrap_or_default(),
            Self::Messages(messages) => messages
                .last()
                .and_then(ChatMessage::text)
                .map(|text| format!("[{} messages] {text}", messages.len()))
                .unwrap_or_default(),
        };
        truncate(&text.replace('\n', " "), max_len)
    }
}

pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_len).collect();
    out.push_str("...");
    out
}

/// Loads `file://` attachment parts and inlines them as base64 payloads.
/// Relative paths resolve against `base_dir` when given.
pub async fn resolve_attachments(
    messages: Vec<ChatMessage>,
    base_dir: Option<&Path>,
) -> Result<Vec<ChatMessage>, InputError> {
    let mut resolved = Vec::with_capacity(messages.len());
    for mut message in messages {
        if let Some(MessageContent::Parts(parts)) = &mut message.content {
            let mut out = Vec::with_capacity(parts.len());
            for part in std::mem::take(parts) {
                out.push(resolve_part(part, base_dir).await?);
            }
            *parts = out;
        }
        resolved.push(message);
    }
    Ok(resolved)
}

async fn resolve_part(part: ContentPart, base_dir: Option<&Path>) -> Result<ContentPart, InputError> {
    match part {
        ContentPart::Image { source, detail } => {
            let (path, bytes) = read_source(&source, base_dir).await?;
            let mime = image_mime(&path).unwrap_or("image/png");
            Ok(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime};base64,{}", STANDARD.encode(bytes)),
                    detail,
                },
            })
        }
        ContentPart::Audio { source } => {
            let (path, bytes) = read_source(&source, base_dir).await?;
            let format = extension(&path).unwrap_or_else(|| "wav".to_string());
            Ok(ContentPart::InputAudio {
                input_audio: InputAudio {
                    data: STANDARD.encode(bytes),
                    format,
                },
            })
        }
        ContentPart::File {
            file:
                FilePayload {
                    filename,
                    file_data: None,
                    source: Some(source),
                },
        } => {
            let (path, bytes) = read_source(&source, base_dir).await?;
            let mime = file_mime(&path);
            let filename = filename.or_else(|| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            });
            Ok(ContentPart::File {
                file: FilePayload {
                    filename,
                    file_data: Some(format!("data:{mime};base64,{}", STANDARD.encode(bytes))),
                    source: None,
                },
            })
        }
        other => Ok(other),
    }
}

async fn read_source(source: &str, base_dir: Option<&Path>) -> Result<(PathBuf, Vec<u8>), InputError> {
    let Some(raw) = source.strip_prefix(FILE_PROTOCOL) else {
        return Err(InputError::UnsupportedSource(source.to_string()));
    };
    let mut path = PathBuf::from(raw);
    if path.is_relative() {
        if let Some(base) = base_dir {
            path = base.join(path);
        }
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|source| InputError::Attachment {
            path: path.clone(),
            source,
        })?;
    Ok((path, bytes))
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn image_mime(path: &Path) -> Option<&'static str> {
    match extension(path)?.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

fn file_mime(path: &Path) -> &'static str {
    match extension(path).as_deref() {
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("md") => "text/markdown",
        Some("yaml" | "yml") => "text/yaml",
        Some("txt" | "log" | "conf") => "text/plain",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}
