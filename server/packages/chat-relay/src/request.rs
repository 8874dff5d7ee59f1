use axum::extract::Multipart;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chat_relay_error::RelayError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

const MAX_TEMPERATURE: f32 = 2.0;

/// Body of `POST /v1/chat/stream` when sent as JSON. Multipart requests carry
/// the same fields as text parts.
#[derive(Debug, Default, Deserialize)]
pub struct ChatRequestBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(default)]
    pub request_type: Option<String>,
    #[serde(default)]
    pub selected_artifact_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    /// Base64 (standard alphabet) of the pre-processed bytes.
    pub bytes: String,
}

/// An uploaded file before pre-processing.
#[derive(Debug, Clone)]
pub struct RawUpload {
    pub filename: String,
    pub content_type: String,
    pub data: Bytes,
}

/// Shrinks uploads to the byte budget (e.g. downscaling large images) before
/// they are handed to the agent.
pub trait AttachmentPreprocessor: Send + Sync + 'static {
    fn prepare(&self, upload: RawUpload, budget: usize) -> BoxFuture<'_, Result<RawUpload, RelayError>>;
}

/// Hands uploads through unchanged; oversized files are then rejected by the
/// budget check.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPreprocessor;

impl AttachmentPreprocessor for PassthroughPreprocessor {
    fn prepare(&self, upload: RawUpload, _budget: usize) -> BoxFuture<'_, Result<RawUpload, RelayError>> {
        Box::pin(async move { Ok(upload) })
    }
}

/// A validated, normalized chat turn.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub model_id: Option<String>,
    pub temperature: Option<f32>,
    pub enabled_tools: Option<Vec<String>>,
    pub request_type: Option<String>,
    pub selected_artifact_id: Option<String>,
    pub system_prompt: Option<String>,
    pub files: Vec<Attachment>,
}

impl ChatRequest {
    pub fn from_body(body: ChatRequestBody) -> Result<Self, RelayError> {
        Self::normalize(body, Vec::new())
    }

    pub fn normalize(body: ChatRequestBody, files: Vec<Attachment>) -> Result<Self, RelayError> {
        let message = body
            .message
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty())
            .ok_or_else(|| RelayError::invalid_request("message is required"))?;

        let temperature = match body.temperature {
            Some(value) if !value.is_finite() => {
                return Err(RelayError::invalid_request("temperature must be a number"));
            }
            Some(value) => Some(value.clamp(0.0, MAX_TEMPERATURE)),
            None => None,
        };

        let enabled_tools = body.enabled_tools.map(|tools| {
            tools
                .into_iter()
                .map(|tool| tool.trim().to_string())
                .filter(|tool| !tool.is_empty())
                .collect::<Vec<_>>()
        });

        Ok(Self {
            message,
            session_id: non_blank(body.session_id),
            model_id: non_blank(body.model_id),
            temperature,
            enabled_tools,
            request_type: non_blank(body.request_type),
            selected_artifact_id: non_blank(body.selected_artifact_id),
            system_prompt: non_blank(body.system_prompt),
            files,
        })
    }

    pub async fn from_multipart(
        mut multipart: Multipart,
        preprocessor: &dyn AttachmentPreprocessor,
        budget: usize,
    ) -> Result<Self, RelayError> {
        let mut body = ChatRequestBody::default();
        let mut files = Vec::new();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| RelayError::invalid_request(format!("malformed multipart body: {err}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "files" {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(|err| RelayError::AttachmentRejected {
                    filename: filename.clone(),
                    message: err.to_string(),
                })?;
                let upload = RawUpload {
                    filename,
                    content_type,
                    data,
                };
                files.push(encode_attachment(preprocessor, upload, budget).await?);
                continue;
            }

            let value = field
                .text()
                .await
                .map_err(|err| RelayError::invalid_request(format!("unreadable field `{name}`: {err}")))?;
            match name.as_str() {
                "message" => body.message = Some(value),
                "session_id" => body.session_id = Some(value),
                "model_id" => body.model_id = Some(value),
                "temperature" => {
                    body.temperature = non_blank(Some(value))
                        .map(|raw| {
                            raw.parse::<f32>().map_err(|_| {
                                RelayError::invalid_request("temperature must be a number")
                            })
                        })
                        .transpose()?;
                }
                "enabled_tools" => body.enabled_tools = Some(parse_tool_list(&value)),
                "request_type" => body.request_type = Some(value),
                "selected_artifact_id" => body.selected_artifact_id = Some(value),
                "system_prompt" => body.system_prompt = Some(value),
                other => tracing::debug!(field = other, "multipart: ignoring unknown field"),
            }
        }

        Self::normalize(body, files)
    }

    pub fn enables(&self, tool: &str) -> bool {
        self.enabled_tools
            .as_ref()
            .is_some_and(|tools| tools.iter().any(|t| t == tool))
    }
}

async fn encode_attachment(
    preprocessor: &dyn AttachmentPreprocessor,
    upload: RawUpload,
    budget: usize,
) -> Result<Attachment, RelayError> {
    let original_bytes = upload.data.len();
    let prepared = preprocessor.prepare(upload, budget).await?;
    if prepared.data.len() > budget {
        return Err(RelayError::AttachmentRejected {
            filename: prepared.filename,
            message: format!(
                "{} bytes exceeds the {budget} byte budget",
                prepared.data.len()
            ),
        });
    }
    tracing::debug!(
        filename = %prepared.filename,
        original_bytes = original_bytes,
        prepared_bytes = prepared.data.len(),
        "attachment prepared"
    );
    Ok(Attachment {
        filename: prepared.filename,
        content_type: prepared.content_type,
        bytes: STANDARD.encode(&prepared.data),
    })
}

/// Accepts either a JSON array (`["browser","search"]`) or a comma list.
fn parse_tool_list(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(tools) = serde_json::from_str::<Vec<String>>(trimmed) {
            return tools;
        }
    }
    trimmed
        .split(',')
        .map(|tool| tool.trim().to_string())
        .filter(|tool| !tool.is_empty())
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
