use super::events::TurnEvent;
use super::sanitize::drop_unanswered_tool_calls;
use crate::db::{DBConnection, TurnCompletion};
use crate::model_registry::{ModelDescriptor, ModelKind};
use crate::models::messages::{text_of, ContentPart, MessageError, NewMessage, Role};
use crate::pricing::{turn_cost, Surcharges, TokenUsage};
use crate::providers::{
    result_text, ChatProvider, PromptMessage, ProviderEvent, ProviderRequest, ToolCallRequest,
};
use crate::tokens::{count_prompt_tokens, count_tokens};
use crate::tools::{Tool, ToolContext, ToolResult, Writer};
use crate::{ApiError, AppState};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const SYSTEM_PROMPT: &str =
    "You are a friendly assistant! Keep your responses concise and helpful.";

const TITLE_PROMPT: &str = "Generate a short title for a conversation that starts with the \
    user's message. Use at most 80 characters. Reply with the title only, without quotes or \
    a trailing period.";

const MAX_TITLE_CHARS: usize = 80;

/// How the selected model produces a turn.
pub enum Strategy {
    Chat {
        provider: Arc<dyn ChatProvider>,
        upstream_model: String,
        tools: &'static [&'static str],
    },
    Bot {
        tool: Arc<dyn Tool>,
        writer: Option<Writer>,
    },
}

impl Strategy {
    /// Fails with `ServiceUnavailable` when the provider or tool behind the model is not configured.
    pub fn resolve(state: &AppState, model: &ModelDescriptor) -> Result<Self, ApiError> {
        match &model.kind {
            ModelKind::Chat {
                provider,
                upstream_model,
                tools,
            } => {
                let adapter = state.providers.get(*provider).ok_or_else(|| {
                    warn!("Provider {:?} for model {} is not configured", provider, model.id);
                    ApiError::ServiceUnavailable
                })?;
                Ok(Strategy::Chat {
                    provider: adapter,
                    upstream_model: upstream_model.to_string(),
                    tools: *tools,
                })
            }
            ModelKind::Bot { tool, summarizer } => {
                let tool = state.tools.get(tool).cloned().ok_or_else(|| {
                    warn!("Tool {} for model {} is not configured", tool, model.id);
                    ApiError::ServiceUnavailable
                })?;
                let writer = match summarizer {
                    Some((provider, upstream_model)) => {
                        let adapter = state.providers.get(*provider).ok_or_else(|| {
                            warn!("Summarizer {:?} for {} is not configured", provider, model.id);
                            ApiError::ServiceUnavailable
                        })?;
                        Some(Writer {
                            provider: adapter,
                            model: upstream_model.to_string(),
                        })
                    }
                    None => None,
                };
                Ok(Strategy::Bot { tool, writer })
            }
        }
    }
}

/// Gives back a reservation taken when the turn started.
pub fn refund(db: &(dyn DBConnection + Send + Sync), user_id: Uuid, amount: &BigDecimal) {
    if *amount == BigDecimal::from(0) {
        return;
    }
    match db.credit_balance(user_id, amount) {
        Ok(balance) => debug!("Refunded {} cents to {}, balance {}", amount, user_id, balance),
        Err(e) => error!("Failed to refund {} cents to {}: {:?}", amount, user_id, e),
    }
}

/// Title for a new chat from its first message, falling back to a truncation of it.
pub async fn generate_title(state: &AppState, first_message: &str) -> String {
    match request_title(state, first_message).await {
        Some(title) => title,
        None => truncate_title(first_message),
    }
}

async fn request_title(state: &AppState, first_message: &str) -> Option<String> {
    let model = state.registry.get(&state.config.title_model)?;
    let ModelKind::Chat {
        provider,
        upstream_model,
        ..
    } = &model.kind
    else {
        return None;
    };
    let adapter = state.providers.get(*provider)?;

    let request = ProviderRequest {
        model: upstream_model.to_string(),
        system: Some(TITLE_PROMPT.to_string()),
        messages: vec![PromptMessage::user_text(first_message)],
        tools: Vec::new(),
        max_output_tokens: Some(32),
    };
    match adapter.complete(request).await {
        Ok(completion) => {
            let title = completion
                .text
                .trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .trim();
            if title.is_empty() {
                None
            } else {
                Some(truncate_title(title))
            }
        }
        Err(e) => {
            warn!("Title generation failed: {}", e);
            None
        }
    }
}

fn truncate_title(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.is_empty() {
        return "New chat".to_string();
    }
    line.chars().take(MAX_TITLE_CHARS).collect()
}

/// Everything a spawned turn needs. Runs to completion even when the client disconnects.
pub struct Turn {
    pub state: Arc<AppState>,
    pub user_id: Uuid,
    pub chat_id: Uuid,
    /// Id of the stored user message that opened the turn.
    pub message_id: Uuid,
    pub model: ModelDescriptor,
    pub strategy: Strategy,
    /// Chat history ending with the new user message.
    pub prompt: Vec<PromptMessage>,
    pub started_at: DateTime<Utc>,
    /// Part of the cost taken from the balance before the turn started.
    pub reserved: BigDecimal,
    pub events: mpsc::Sender<TurnEvent>,
}

#[derive(Debug, Default)]
struct Outcome {
    responses: Vec<PromptMessage>,
    usage: TokenUsage,
    surcharges: Surcharges,
    failed: bool,
}

#[derive(Default)]
struct StepOutput {
    text: String,
    calls: Vec<ToolCallRequest>,
    usage: Option<TokenUsage>,
}

impl Turn {
    pub async fn run(self) {
        self.emit(TurnEvent::Start {
            chat_id: self.chat_id,
            message_id: self.message_id,
            model: self.model.id.to_string(),
        })
        .await;

        let outcome = match &self.strategy {
            Strategy::Chat {
                provider,
                upstream_model,
                tools,
            } => self.run_chat(provider.clone(), upstream_model, tools).await,
            Strategy::Bot { tool, writer } => {
                match self.run_bot(tool.clone(), writer.clone()).await {
                    Some(outcome) => outcome,
                    None => return,
                }
            }
        };

        self.settle(outcome).await;
    }

    async fn emit(&self, event: TurnEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Client left chat {}, turn continues", self.chat_id);
        }
    }

    fn tool_context(&self, writer: Option<Writer>) -> ToolContext {
        ToolContext {
            user_id: self.user_id,
            chat_id: self.chat_id,
            db: self.state.db.clone(),
            writer,
        }
    }

    async fn run_chat(
        &self,
        provider: Arc<dyn ChatProvider>,
        upstream_model: &str,
        allowed: &[&str],
    ) -> Outcome {
        let mut outcome = Outcome::default();
        let specs = self.state.tools.specs(allowed);
        let ctx = self.tool_context(Some(Writer {
            provider: provider.clone(),
            model: upstream_model.to_string(),
        }));
        let mut prompt = self.prompt.clone();

        for step_no in 0..self.state.config.max_tool_steps.max(1) {
            let request = ProviderRequest {
                model: upstream_model.to_string(),
                system: Some(SYSTEM_PROMPT.to_string()),
                messages: prompt.clone(),
                tools: specs.clone(),
                max_output_tokens: None,
            };
            let mut rx = match provider.stream_chat(request).await {
                Ok(rx) => rx,
                Err(e) => {
                    error!("{} failed on step {}: {}", provider.name(), step_no, e);
                    outcome.failed = true;
                    break;
                }
            };

            let mut step = StepOutput::default();
            while let Some(event) = rx.recv().await {
                match event {
                    ProviderEvent::TextDelta(delta) => {
                        step.text.push_str(&delta);
                        self.emit(TurnEvent::TextDelta { delta }).await;
                    }
                    ProviderEvent::ToolCall(call) => step.calls.push(call),
                    ProviderEvent::Usage(usage) => {
                        *step.usage.get_or_insert_with(TokenUsage::default) += usage;
                    }
                    ProviderEvent::Finished(reason) => {
                        debug!("Step {} finished with {:?}", step_no, reason)
                    }
                    ProviderEvent::Error(message) => {
                        error!("{} stream failed on step {}: {}", provider.name(), step_no, message);
                        outcome.failed = true;
                        break;
                    }
                }
            }

            outcome.usage += step
                .usage
                .unwrap_or_else(|| estimate_usage(&prompt, &step.text, &step.calls));

            let mut parts = Vec::new();
            if !step.text.is_empty() {
                parts.push(ContentPart::text(step.text));
            }
            if outcome.failed || step.calls.is_empty() {
                outcome.responses.push(PromptMessage {
                    role: Role::Assistant,
                    parts,
                });
                break;
            }

            let mut results = Vec::with_capacity(step.calls.len());
            for call in step.calls {
                parts.push(ContentPart::ToolCall {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    args: call.args.clone(),
                });
                self.emit(TurnEvent::ToolCall {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    args: call.args.clone(),
                })
                .await;

                let result = match self.allowed_tool(allowed, &call.name) {
                    Some(tool) => {
                        outcome.surcharges.tool_calls += 1;
                        tool.execute(&ctx, call.args.clone()).await
                    }
                    None => {
                        warn!("Model {} called unavailable tool {}", self.model.id, call.name);
                        ToolResult::error(format!("Unknown tool: {}", call.name))
                    }
                };
                outcome.surcharges.images += result.images;
                outcome.usage += result.usage;

                self.emit(TurnEvent::ToolResult {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    result: result.output.clone(),
                    is_error: !result.success,
                })
                .await;
                results.push(ContentPart::ToolResult {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    result: result.output,
                    is_error: !result.success,
                });
            }

            let assistant = PromptMessage {
                role: Role::Assistant,
                parts,
            };
            let tool = PromptMessage {
                role: Role::Tool,
                parts: results,
            };
            prompt.push(assistant.clone());
            prompt.push(tool.clone());
            outcome.responses.push(assistant);
            outcome.responses.push(tool);
        }

        outcome
    }

    fn allowed_tool(&self, allowed: &[&str], name: &str) -> Option<Arc<dyn Tool>> {
        if !allowed.contains(&name) {
            return None;
        }
        self.state.tools.get(name).cloned()
    }

    /// Runs the bot tool on the user message. `None` when the tool failed and the
    /// reservation was returned.
    async fn run_bot(&self, tool: Arc<dyn Tool>, writer: Option<Writer>) -> Option<Outcome> {
        let parts = self
            .prompt
            .last()
            .map(|m| m.parts.clone())
            .unwrap_or_default();
        let args = tool.bot_args(&text_of(&parts), &parts);
        let call_id = format!("call_{}", Uuid::new_v4().simple());
        let tool_name = tool.name().to_string();

        self.emit(TurnEvent::ToolCall {
            tool_call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            args: args.clone(),
        })
        .await;

        let ctx = self.tool_context(writer);
        let result = tool.execute(&ctx, args.clone()).await;

        self.emit(TurnEvent::ToolResult {
            tool_call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            result: result.output.clone(),
            is_error: !result.success,
        })
        .await;

        if !result.success {
            warn!("Bot {} failed for user {}: {:?}", tool_name, self.user_id, result.error);
            refund(self.state.db.as_ref(), self.user_id, &self.reserved);
            self.emit(TurnEvent::busy()).await;
            return None;
        }

        Some(Outcome {
            responses: vec![
                PromptMessage {
                    role: Role::Assistant,
                    parts: vec![ContentPart::ToolCall {
                        tool_call_id: call_id.clone(),
                        tool_name: tool_name.clone(),
                        args,
                    }],
                },
                PromptMessage {
                    role: Role::Tool,
                    parts: vec![ContentPart::ToolResult {
                        tool_call_id: call_id,
                        tool_name,
                        result: result.output,
                        is_error: false,
                    }],
                },
            ],
            usage: result.usage,
            surcharges: Surcharges {
                tool_calls: 0,
                images: result.images,
            },
            failed: false,
        })
    }

    /// Prices the turn and commits it. The last response message carries the cost.
    async fn settle(self, outcome: Outcome) {
        let Outcome {
            responses,
            usage,
            surcharges,
            failed,
        } = outcome;
        let mut responses = drop_unanswered_tool_calls(responses);
        let cost = turn_cost(&self.model, usage, surcharges);

        if responses.is_empty() && cost == BigDecimal::from(0) {
            refund(self.state.db.as_ref(), self.user_id, &self.reserved);
            if failed {
                self.emit(TurnEvent::busy()).await;
            }
            return;
        }
        if responses.is_empty() {
            // Billed usage with nothing left to show still needs a row to carry it.
            responses.push(PromptMessage {
                role: Role::Assistant,
                parts: Vec::new(),
            });
        }

        let messages = match self.response_messages(responses, &cost, usage) {
            Ok(messages) => messages,
            Err(e) => {
                error!("Could not encode response of chat {}: {:?}", self.chat_id, e);
                refund(self.state.db.as_ref(), self.user_id, &self.reserved);
                self.emit(TurnEvent::busy()).await;
                return;
            }
        };

        let completion = TurnCompletion {
            user_id: self.user_id,
            chat_id: self.chat_id,
            messages,
            cost: cost.clone(),
            reserved: self.reserved.clone(),
        };

        match self.state.db.complete_turn(completion) {
            Ok(receipt) => {
                info!(
                    "Billed {} cents to user {} for chat {} ({} in / {} out)",
                    cost, self.user_id, self.chat_id, usage.input_tokens, usage.output_tokens
                );
                if failed {
                    self.emit(TurnEvent::busy()).await;
                }
                self.emit(TurnEvent::Finish {
                    cost_cents: cost,
                    balance_cents: receipt.balance_cents,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                })
                .await;
            }
            Err(e) => {
                error!("Failed to complete turn for chat {}: {:?}", self.chat_id, e);
                refund(self.state.db.as_ref(), self.user_id, &self.reserved);
                self.emit(TurnEvent::busy()).await;
            }
        }
    }

    fn response_messages(
        &self,
        responses: Vec<PromptMessage>,
        cost: &BigDecimal,
        usage: TokenUsage,
    ) -> Result<Vec<NewMessage>, MessageError> {
        let last = responses.len().saturating_sub(1);
        responses
            .into_iter()
            .enumerate()
            .map(|(i, message)| {
                let created_at = self.started_at + Duration::milliseconds(i as i64 + 1);
                let mut new_message = NewMessage::unbilled(
                    Uuid::new_v4(),
                    self.chat_id,
                    message.role,
                    &message.parts,
                    Some(self.model.label.to_string()),
                    created_at,
                )?;
                if i == last {
                    new_message.cost = cost.clone();
                    new_message.input_tokens = clamp_tokens(usage.input_tokens);
                    new_message.output_tokens = clamp_tokens(usage.output_tokens);
                }
                Ok(new_message)
            })
            .collect()
    }
}

fn clamp_tokens(tokens: i64) -> i32 {
    i32::try_from(tokens).unwrap_or(i32::MAX)
}

fn prompt_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.clone()),
            ContentPart::ToolCall { args, .. } => Some(args.to_string()),
            ContentPart::ToolResult { result, .. } => Some(result_text(result)),
            ContentPart::Image { .. } | ContentPart::File { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Usage estimate for a step whose provider did not report one.
fn estimate_usage(prompt: &[PromptMessage], text: &str, calls: &[ToolCallRequest]) -> TokenUsage {
    let rendered: Vec<String> = prompt.iter().map(|m| prompt_text(&m.parts)).collect();
    let input = count_prompt_tokens(
        std::iter::once(SYSTEM_PROMPT).chain(rendered.iter().map(String::as_str)),
    );
    let output = count_tokens(text)
        + calls
            .iter()
            .map(|c| count_tokens(&c.name) + count_tokens(&c.args.to_string()))
            .sum::<usize>();
    TokenUsage::new(input as i64, output as i64)
}
