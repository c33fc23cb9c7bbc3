use super::{GenerationProvider, GenerationRequest, LlmError, TextStream};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: Vec<InputMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct InputMessage<'a> {
    role: &'a str,
    content: Vec<InputContent<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputContent<'a> {
    InputFile { file_id: &'a str },
    InputText { text: &'a str },
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ResponsesStreamEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.completed")]
    Completed {},
    #[serde(rename = "response.failed")]
    Failed { response: Option<FailedResponse> },
    #[serde(rename = "error")]
    Error { message: Option<String> },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct FailedResponse {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
}

/// What one line of the provider's event stream means for the caller
#[derive(Debug, PartialEq, Eq)]
enum StreamStep {
    Text(String),
    Completed,
    Failed(String),
}

fn parse_sse_line(line: &str) -> Option<StreamStep> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(StreamStep::Completed);
    }

    match serde_json::from_str::<ResponsesStreamEvent>(data) {
        Ok(ResponsesStreamEvent::OutputTextDelta { delta }) => Some(StreamStep::Text(delta)),
        Ok(ResponsesStreamEvent::Completed {}) => Some(StreamStep::Completed),
        Ok(ResponsesStreamEvent::Failed { response }) => Some(StreamStep::Failed(
            response
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| "response failed".to_string()),
        )),
        Ok(ResponsesStreamEvent::Error { message }) => Some(StreamStep::Failed(
            message.unwrap_or_else(|| "stream error".to_string()),
        )),
        Ok(ResponsesStreamEvent::Other) => None,
        Err(e) => {
            tracing::debug!(error = %e, "skipping unparseable stream event");
            None
        }
    }
}

/// OpenAI Responses API client
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}{}", self.config.base_url.trim_end_matches('/'), path));
        if !self.config.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.config.api_key));
        }
        req
    }
}

async fn error_from(resp: reqwest::Response) -> LlmError {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    LlmError::Api {
        status,
        message: text,
    }
}

#[async_trait]
impl GenerationProvider for OpenAiProvider {
    async fn stream(&self, request: &GenerationRequest) -> Result<TextStream, LlmError> {
        let mut content = Vec::with_capacity(2);
        if let Some(file_id) = request.file_id.as_deref() {
            content.push(InputContent::InputFile { file_id });
        }
        content.push(InputContent::InputText {
            text: &request.input,
        });

        let body = ResponsesRequest {
            model: &request.model,
            instructions: &request.instructions,
            input: vec![InputMessage {
                role: "user",
                content,
            }],
            stream: true,
        };

        let resp = self.post("/responses").json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(LlmError::Http(e));
                        break 'read;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);

                    match parse_sse_line(line.trim()) {
                        Some(StreamStep::Text(delta)) => yield Ok(delta),
                        Some(StreamStep::Completed) => break 'read,
                        Some(StreamStep::Failed(message)) => {
                            yield Err(LlmError::Failed(message));
                            break 'read;
                        }
                        None => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn upload_file(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, LlmError> {
        let form = Form::new()
            .text("purpose", "user_data")
            .part("file", Part::bytes(bytes).file_name(file_name.to_string()));

        let resp = self.post("/files").multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(error_from(resp).await);
        }

        let file: FileObject = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        Ok(file.id)
    }
}
