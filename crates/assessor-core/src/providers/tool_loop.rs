//! Bounded tool-use loop over any [`LlmProvider`]

use anyhow::{Result, anyhow};
use tracing::{debug, info, warn};

use crate::tools::ToolExecutor;

use super::types::{
    ChatBlock, ChatMessage, ChatMessageContent, ChatResponseBlock, ChatRole, LlmProvider, StopReason, ToolDefinition,
};

/// Tool output longer than this is cut before going back to the model
pub const MAX_TOOL_OUTPUT: usize = 100_000;

/// Default cap on model round trips per call
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Run `messages` through the provider, executing tool calls until the model
/// ends its turn. Returns the final text, which may be empty when the model
/// only acted through tools.
pub async fn run_tool_loop(
    provider: &dyn LlmProvider,
    mut conversation: Vec<ChatMessage>,
    system: &str,
    tools: &[ToolDefinition],
    executor: Option<&dyn ToolExecutor>,
    max_iterations: usize,
) -> Result<String> {
    let mut iterations = 0;

    loop {
        iterations += 1;
        if iterations > max_iterations {
            warn!("Tool loop exceeded maximum iterations ({})", max_iterations);
            return Err(anyhow!("Tool loop exceeded maximum iterations ({})", max_iterations));
        }

        debug!("Tool loop iteration {} on {}", iterations, provider.model());

        let response = provider.chat(&conversation, tools, system).await?;

        if response.stop_reason != StopReason::ToolUse {
            if response.stop_reason == StopReason::MaxTokens {
                warn!("Response from {} hit the token limit", provider.model());
            }
            debug!(
                "Tool loop completed (iterations: {}, tokens: in={} out={})",
                iterations, response.usage.input_tokens, response.usage.output_tokens
            );
            return Ok(response.text());
        }

        let executor = executor.ok_or_else(|| anyhow!("Model requested tools but none are available"))?;

        let assistant_blocks: Vec<ChatBlock> = response
            .blocks
            .iter()
            .map(|b| match b {
                ChatResponseBlock::Text { text } => ChatBlock::Text { text: text.clone() },
                ChatResponseBlock::ToolCall { id, name, input } => ChatBlock::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                },
            })
            .collect();
        conversation.push(ChatMessage {
            role: ChatRole::Assistant,
            content: ChatMessageContent::Blocks(assistant_blocks),
        });

        let mut tool_results = Vec::new();
        for block in &response.blocks {
            if let ChatResponseBlock::ToolCall { id, name, input } = block {
                info!("Executing tool: {}", name);

                let mut content = match executor.execute(name, input.clone()).await {
                    Ok(output) => output,
                    Err(e) => {
                        warn!("Tool {} failed: {}", name, e);
                        format!("Error: {}", e)
                    }
                };

                if content.len() > MAX_TOOL_OUTPUT {
                    let mut cut = MAX_TOOL_OUTPUT;
                    while !content.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    content.truncate(cut);
                    content.push_str("\n[Output truncated]");
                }

                tool_results.push(ChatBlock::ToolResult {
                    tool_call_id: id.clone(),
                    name: name.clone(),
                    content,
                });
            }
        }

        if tool_results.is_empty() {
            warn!("Stop reason was tool use but no tool calls found");
            return Err(anyhow!("Stop reason was tool use but no tool calls found"));
        }

        conversation.push(ChatMessage {
            role: ChatRole::User,
            content: ChatMessageContent::Blocks(tool_results),
        });
    }
}
