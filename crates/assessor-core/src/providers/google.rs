//! Google Gemini provider

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::types::{
    ChatBlock, ChatMessage, ChatMessageContent, ChatResponse, ChatResponseBlock, ChatRole, ChatUsage, LlmProvider,
    StopReason, ToolDefinition,
};

/// Google Gemini provider
pub struct GoogleProvider {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl GoogleProvider {
    pub fn new(api_key: String, model: String, max_tokens: u32, temperature: f32) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key,
            model,
            max_tokens,
            temperature,
        })
    }

    /// Convert provider-agnostic messages to Gemini wire format
    fn to_gemini_contents(messages: &[ChatMessage]) -> Vec<GeminiContent> {
        messages
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                let role = match m.role {
                    ChatRole::Assistant => "model",
                    ChatRole::User | ChatRole::System => "user",
                };
                let parts = match &m.content {
                    ChatMessageContent::Text(t) => vec![GeminiPart::Text { text: t.clone() }],
                    ChatMessageContent::Blocks(blocks) => blocks
                        .iter()
                        .map(|b| match b {
                            ChatBlock::Text { text } => GeminiPart::Text { text: text.clone() },
                            ChatBlock::ToolCall { name, input, .. } => GeminiPart::FunctionCall {
                                function_call: GeminiFunctionCall {
                                    name: name.clone(),
                                    args: input.clone(),
                                },
                            },
                            ChatBlock::ToolResult { name, content, .. } => GeminiPart::FunctionResponse {
                                function_response: GeminiFunctionResponse {
                                    name: name.clone(),
                                    response: serde_json::json!({"result": content}),
                                },
                            },
                        })
                        .collect(),
                };
                GeminiContent {
                    role: role.to_string(),
                    parts,
                }
            })
            .collect()
    }

    /// Convert tool definitions to Gemini function declarations
    fn to_gemini_tools(tools: &[ToolDefinition]) -> Vec<GeminiToolDecl> {
        if tools.is_empty() {
            return vec![];
        }
        vec![GeminiToolDecl {
            function_declarations: tools
                .iter()
                .map(|t| GeminiFunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                })
                .collect(),
        }]
    }

    /// Convert Gemini response to provider-agnostic format
    fn from_gemini_response(resp: GeminiApiResponse) -> Result<ChatResponse> {
        let candidate = resp
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Gemini response had no candidates"))?;

        let mut blocks = Vec::new();
        let mut call_count = 0usize;

        // A candidate blocked by safety filters may come back without parts
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        for part in parts {
            match part {
                GeminiPart::Text { text } => {
                    blocks.push(ChatResponseBlock::Text { text });
                }
                GeminiPart::FunctionCall { function_call } => {
                    call_count += 1;
                    blocks.push(ChatResponseBlock::ToolCall {
                        id: format!("gemini_{}_{}", function_call.name, call_count),
                        name: function_call.name,
                        input: function_call.args,
                    });
                }
                GeminiPart::FunctionResponse { .. } => {}
            }
        }

        let stop_reason = if call_count > 0 {
            StopReason::ToolUse
        } else {
            match candidate.finish_reason.as_deref() {
                Some("STOP") | None => StopReason::EndTurn,
                Some("MAX_TOKENS") => StopReason::MaxTokens,
                Some(_) => StopReason::Unknown,
            }
        };

        let usage = resp.usage_metadata.map_or(ChatUsage::default(), |u| ChatUsage {
            input_tokens: u.prompt_token_count.unwrap_or(0),
            output_tokens: u.candidates_token_count.unwrap_or(0),
        });

        Ok(ChatResponse {
            blocks,
            stop_reason,
            usage,
        })
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn provider_name(&self) -> &str {
        "google"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition], system: &str) -> Result<ChatResponse> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let contents = Self::to_gemini_contents(messages);

        let mut body = serde_json::json!({
            "contents": contents,
            "systemInstruction": {
                "parts": [{"text": system}]
            },
            "generationConfig": {
                "maxOutputTokens": self.max_tokens,
                "temperature": self.temperature,
            },
        });

        let gemini_tools = Self::to_gemini_tools(tools);
        if !gemini_tools.is_empty() {
            body["tools"] = serde_json::to_value(&gemini_tools)?;
        }

        debug!("Gemini request: model={}, contents={}", self.model, contents.len());

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Gemini API")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("Gemini API request failed with status {}: {}", status, error_text));
        }

        let api_response: GeminiApiResponse = response
            .json()
            .await
            .context("Failed to parse Gemini API response")?;

        debug!("Gemini response: candidates={}", api_response.candidates.len());

        Self::from_gemini_response(api_response)
    }
}

// ── Gemini wire types ──

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiToolDecl {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiApiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiUsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(parts: Vec<GeminiPart>, finish: &str) -> GeminiCandidate {
        GeminiCandidate {
            content: Some(GeminiContent {
                role: "model".to_string(),
                parts,
            }),
            finish_reason: Some(finish.to_string()),
        }
    }

    #[test]
    fn test_to_gemini_contents_roles() {
        let msgs = vec![
            ChatMessage {
                role: ChatRole::System,
                content: ChatMessageContent::Text("sys".to_string()),
            },
            ChatMessage::user("Oi"),
            ChatMessage::assistant("Olá!"),
        ];
        let result = GoogleProvider::to_gemini_contents(&msgs);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].role, "user");
        assert_eq!(result[1].role, "model");
    }

    #[test]
    fn test_tool_result_uses_function_name() {
        let msgs = vec![ChatMessage {
            role: ChatRole::User,
            content: ChatMessageContent::Blocks(vec![ChatBlock::ToolResult {
                tool_call_id: "gemini_list_tasks_1".to_string(),
                name: "list_tasks".to_string(),
                content: "[]".to_string(),
            }]),
        }];
        let result = GoogleProvider::to_gemini_contents(&msgs);
        let json = serde_json::to_value(&result[0].parts[0]).unwrap();
        assert_eq!(json["functionResponse"]["name"], "list_tasks");
        assert_eq!(json["functionResponse"]["response"]["result"], "[]");
    }

    #[test]
    fn test_to_gemini_tools() {
        let tools = vec![ToolDefinition {
            name: "create_task".to_string(),
            description: "Create a task".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        let result = GoogleProvider::to_gemini_tools(&tools);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].function_declarations.len(), 1);
        assert!(GoogleProvider::to_gemini_tools(&[]).is_empty());
    }

    #[test]
    fn test_from_gemini_response_text() {
        let resp = GeminiApiResponse {
            candidates: vec![candidate(
                vec![GeminiPart::Text {
                    text: "Floculação é...".to_string(),
                }],
                "STOP",
            )],
            usage_metadata: Some(GeminiUsageMetadata {
                prompt_token_count: Some(10),
                candidates_token_count: Some(5),
            }),
        };
        let result = GoogleProvider::from_gemini_response(resp).unwrap();
        assert_eq!(result.stop_reason, StopReason::EndTurn);
        assert_eq!(result.usage.input_tokens, 10);
        assert_eq!(result.text(), "Floculação é...");
    }

    #[test]
    fn test_from_gemini_response_function_calls() {
        let resp = GeminiApiResponse {
            candidates: vec![candidate(
                vec![
                    GeminiPart::FunctionCall {
                        function_call: GeminiFunctionCall {
                            name: "record_memory".to_string(),
                            args: serde_json::json!({"session_id": "7"}),
                        },
                    },
                    GeminiPart::FunctionCall {
                        function_call: GeminiFunctionCall {
                            name: "record_memory".to_string(),
                            args: serde_json::json!({"session_id": "7"}),
                        },
                    },
                ],
                "STOP",
            )],
            usage_metadata: None,
        };
        let result = GoogleProvider::from_gemini_response(resp).unwrap();
        assert_eq!(result.stop_reason, StopReason::ToolUse);
        let ids: Vec<_> = result
            .blocks
            .iter()
            .filter_map(|b| match b {
                ChatResponseBlock::ToolCall { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_from_gemini_response_empty_candidate() {
        let json = r#"{"candidates":[{"finishReason":"STOP"}]}"#;
        let resp: GeminiApiResponse = serde_json::from_str(json).unwrap();
        let result = GoogleProvider::from_gemini_response(resp).unwrap();
        assert!(result.blocks.is_empty());
        assert_eq!(result.text(), "");
    }

    #[test]
    fn test_from_gemini_response_no_candidates() {
        let resp = GeminiApiResponse {
            candidates: vec![],
            usage_metadata: None,
        };
        assert!(GoogleProvider::from_gemini_response(resp).is_err());
    }

    #[test]
    fn test_google_provider_debug_hides_key() {
        let provider =
            GoogleProvider::new("AIza-secret".to_string(), "gemini-2.0-flash".to_string(), 4096, 0.3).unwrap();
        let debug = format!("{:?}", provider);
        assert!(!debug.contains("AIza-secret"));
    }
}
