//! The turn loop: admission, prompt assembly, streaming, tool dispatch,
//! the confirmation gate, and settlement.

use std::sync::Arc;

use chrono::Utc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_core::agent::{AgentDefinition, FINISH_SUBAGENT, SWITCH_TO_SUBAGENT};
use parley_core::config::{Config, ConfigHandle};
use parley_core::error::{ParleyError, Result};
use parley_core::types::{
    Chat, ChatMessage, ChatSnapshot, MessageRole, OrganizationFact, ToolCall, ToolState,
    UsageLimits, UserFact,
};
use parley_providers::{
    AssembledResponse, CompletionProvider, CompletionRequest, ProviderMessage, TokenUsage,
    ToolCallAssembler,
};
use parley_store::{
    ChatStore, DbPool, OrganizationFactStore, SqlChatStore, SqlOrganizationFactStore,
    SqlTokenLedger, SqlUserFactStore, TokenLedger, UserFactStore,
};
use parley_tools::org_note::MAX_FACTS_PER_ORGANIZATION;
use parley_tools::user_fact::MAX_FACTS_PER_USER;
use parley_tools::{ToolContext, ToolRegistry};

use crate::delegation::Delegation;
use crate::enrichment::{ContextEnricher, DefaultEnricher, Facts};
use crate::history::build_history;
use crate::prompt::{PromptParts, build_system_prompt};
use crate::quota::QuotaService;
use crate::registry::AgentRegistry;
use crate::{AgentEvent, ToolEventState, TurnContext, TurnOutcome, TurnStatus};

/// Tool message stored when a human rejects a proposed call.
pub const DECLINED_REPLY: &str = "User declined the tool call.";

const NOT_ALLOWED: &str = "tool not allowed for this agent";
const SKIPPED_AFTER_SWITCH: &str = "not executed: conversation was delegated to a subagent";
const SKIPPED_AFTER_FINISH: &str = "not executed: subagent already finished its task";

/// Collaborators the engine is built from.
pub struct EngineDeps {
    pub store: Arc<dyn ChatStore>,
    pub ledger: Arc<dyn TokenLedger>,
    pub facts: Arc<dyn UserFactStore>,
    pub org_facts: Arc<dyn OrganizationFactStore>,
    pub provider: Arc<dyn CompletionProvider>,
    pub tools: ToolRegistry,
    pub agents: Arc<AgentRegistry>,
    pub enricher: Arc<dyn ContextEnricher>,
    pub config: ConfigHandle,
}

/// Stateless between turns: everything a turn needs is read from and
/// written to the store.
pub struct Engine {
    pub(crate) store: Arc<dyn ChatStore>,
    pub(crate) facts: Arc<dyn UserFactStore>,
    pub(crate) org_facts: Arc<dyn OrganizationFactStore>,
    pub(crate) provider: Arc<dyn CompletionProvider>,
    pub(crate) tools: ToolRegistry,
    pub(crate) agents: Arc<AgentRegistry>,
    pub(crate) enricher: Arc<dyn ContextEnricher>,
    pub(crate) config: ConfigHandle,
    pub(crate) quota: QuotaService,
}

/// What the loop does after a batch of tool calls.
enum Step {
    Continue,
    Suspend,
}

impl Engine {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            quota: QuotaService::new(deps.ledger, deps.config.clone()),
            store: deps.store,
            facts: deps.facts,
            org_facts: deps.org_facts,
            provider: deps.provider,
            tools: deps.tools,
            agents: deps.agents,
            enricher: deps.enricher,
            config: deps.config,
        }
    }

    /// Wire the SQL stores, built-in tools and configured agents on one pool.
    pub fn from_pool(
        pool: DbPool,
        provider: Arc<dyn CompletionProvider>,
        config: ConfigHandle,
    ) -> Self {
        let facts: Arc<dyn UserFactStore> = Arc::new(SqlUserFactStore::new(pool.clone()));
        let org_facts: Arc<dyn OrganizationFactStore> =
            Arc::new(SqlOrganizationFactStore::new(pool.clone()));
        let agents = Arc::new(AgentRegistry::from_config(&config.snapshot()));
        Self::new(EngineDeps {
            store: Arc::new(SqlChatStore::new(pool.clone())),
            ledger: Arc::new(SqlTokenLedger::new(pool)),
            facts: facts.clone(),
            org_facts: org_facts.clone(),
            provider,
            tools: ToolRegistry::with_builtins(facts.clone(), org_facts.clone()),
            agents,
            enricher: Arc::new(DefaultEnricher::new(facts, org_facts)),
            config,
        })
    }

    /// The live agent definitions; reloaded in place when config changes.
    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one user turn. Without `chat_id` a new root chat is created.
    pub async fn send_message(
        &self,
        ctx: &TurnContext,
        chat_id: Option<Uuid>,
        content: &str,
    ) -> Result<TurnOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ParleyError::invalid("message content must not be empty"));
        }

        let mut current = match chat_id {
            Some(id) => {
                let chat = self.owned_chat(ctx.user_id, ctx.organization_id, id).await?;
                let chat = self.resolve_active_chat(chat).await?;
                if !chat.is_active() {
                    return Err(ParleyError::invalid(format!(
                        "chat {} is {}",
                        chat.id,
                        chat.status.as_str()
                    )));
                }
                Some(chat)
            }
            None => None,
        };

        let reservation = self
            .quota
            .reserve(ctx.user_id)
            .await?
            .ok_or(ParleyError::QuotaExceeded)?;

        let config = self.config.snapshot();
        let mut usage = TokenUsage::default();
        let result = self
            .start_turn(ctx, &mut current, content, &config, &mut usage)
            .await;
        self.quota.settle_or_log(reservation, usage.total_tokens).await;
        self.conclude(ctx, current.as_ref(), result).await
    }

    /// Approve or reject a proposed tool call and resume the loop.
    pub async fn decide_tool_call(
        &self,
        ctx: &TurnContext,
        chat_id: Uuid,
        tool_call_id: &str,
        approve: bool,
    ) -> Result<TurnOutcome> {
        let tool_call_id = tool_call_id.trim();
        if tool_call_id.is_empty() {
            return Err(ParleyError::invalid("tool_call_id must not be empty"));
        }

        let root = self.owned_chat(ctx.user_id, ctx.organization_id, chat_id).await?;
        let (mut chat, proposal) = match self.store.find_tool_proposal(root.id, tool_call_id).await? {
            Some(proposal) => (root, proposal),
            None => {
                let active = self.resolve_active_chat(root.clone()).await?;
                let found = if active.id == root.id {
                    None
                } else {
                    self.store.find_tool_proposal(active.id, tool_call_id).await?
                };
                match found {
                    Some(proposal) => (active, proposal),
                    None => {
                        return Err(ParleyError::not_found(format!("tool call {tool_call_id}")));
                    }
                }
            }
        };
        if proposal.tool_state != ToolState::Proposed {
            return Err(ParleyError::invalid(format!(
                "tool call {tool_call_id} is not awaiting a decision"
            )));
        }
        if !chat.is_active() {
            return Err(ParleyError::invalid(format!(
                "chat {} is {}",
                chat.id,
                chat.status.as_str()
            )));
        }

        let reservation = self
            .quota
            .reserve(ctx.user_id)
            .await?
            .ok_or(ParleyError::QuotaExceeded)?;

        // Claim the decision before acting on it; a concurrent decision loses here.
        let to = if approve { ToolState::Approved } else { ToolState::Rejected };
        let claimed = match self
            .store
            .transition_tool_state(proposal.id, ToolState::Proposed, to)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.quota.settle_or_log(reservation, 0).await;
                return Err(e.into());
            }
        };
        if !claimed {
            self.quota.settle_or_log(reservation, 0).await;
            return Err(ParleyError::invalid(format!(
                "tool call {tool_call_id} was already decided"
            )));
        }
        info!(chat_id = %chat.id, tool_call_id, approve, "Tool call decided");

        let config = self.config.snapshot();
        let mut usage = TokenUsage::default();
        let result = self
            .resume_turn(ctx, &mut chat, &proposal, approve, &config, &mut usage)
            .await;
        self.quota.settle_or_log(reservation, usage.total_tokens).await;
        self.conclude(ctx, Some(&chat), result).await
    }

    /// A chat with its full history.
    pub async fn get_chat(&self, user_id: Uuid, organization_id: Uuid, chat_id: Uuid) -> Result<ChatSnapshot> {
        let chat = self.owned_chat(user_id, organization_id, chat_id).await?;
        let messages = self.store.list_messages(chat.id, usize::MAX).await?;
        Ok(ChatSnapshot { chat, messages })
    }

    pub async fn list_chats(&self, user_id: Uuid, organization_id: Uuid, limit: u32) -> Result<Vec<Chat>> {
        Ok(self.store.list_chats(user_id, organization_id, limit).await?)
    }

    pub async fn delete_chat(&self, user_id: Uuid, organization_id: Uuid, chat_id: Uuid) -> Result<()> {
        let chat = self.owned_chat(user_id, organization_id, chat_id).await?;
        if !self.store.delete_chat(chat.id).await? {
            return Err(ParleyError::not_found(format!("chat {chat_id}")));
        }
        info!(%chat_id, "Chat deleted");
        Ok(())
    }

    pub async fn usage(&self, user_id: Uuid) -> Result<UsageLimits> {
        self.quota.limits(user_id).await
    }

    pub async fn list_facts(&self, user_id: Uuid) -> Result<Vec<UserFact>> {
        Ok(self.facts.list_facts(user_id, MAX_FACTS_PER_USER as u32).await?)
    }

    pub async fn delete_fact(&self, user_id: Uuid, fact_id: Uuid) -> Result<()> {
        if !self.facts.delete_fact(user_id, fact_id).await? {
            return Err(ParleyError::not_found(format!("fact {fact_id}")));
        }
        Ok(())
    }

    pub async fn list_organization_facts(&self, organization_id: Uuid) -> Result<Vec<OrganizationFact>> {
        Ok(self
            .org_facts
            .list_facts(organization_id, MAX_FACTS_PER_ORGANIZATION as u32)
            .await?)
    }

    pub async fn delete_organization_fact(&self, organization_id: Uuid, fact_id: Uuid) -> Result<()> {
        if !self.org_facts.delete_fact(organization_id, fact_id).await? {
            return Err(ParleyError::not_found(format!("organization fact {fact_id}")));
        }
        info!(%organization_id, %fact_id, "Organization fact deleted");
        Ok(())
    }

    async fn owned_chat(&self, user_id: Uuid, organization_id: Uuid, chat_id: Uuid) -> Result<Chat> {
        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(format!("chat {chat_id}")))?;
        if !chat.owned_by(user_id, organization_id) {
            return Err(ParleyError::Forbidden(format!("chat {chat_id} belongs to another user")));
        }
        Ok(chat)
    }

    async fn snapshot(&self, chat_id: Uuid) -> Result<ChatSnapshot> {
        let chat = self
            .store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| ParleyError::not_found(format!("chat {chat_id}")))?;
        let messages = self.store.list_messages(chat_id, usize::MAX).await?;
        Ok(ChatSnapshot { chat, messages })
    }

    async fn start_turn(
        &self,
        ctx: &TurnContext,
        current: &mut Option<Chat>,
        content: &str,
        config: &Config,
        usage: &mut TokenUsage,
    ) -> Result<TurnOutcome> {
        if current.is_none() {
            *current = Some(self.create_root_chat(ctx, config).await?);
        }
        let Some(chat) = current.as_mut() else {
            return Err(ParleyError::internal("turn has no chat"));
        };
        self.store.append_message(&ChatMessage::user(chat.id, content)).await?;
        self.run_loop(ctx, chat, config, usage).await
    }

    async fn create_root_chat(&self, ctx: &TurnContext, config: &Config) -> Result<Chat> {
        let agent_key = config.default_agent_key();
        if self.agents.get(&agent_key).is_none() {
            return Err(ParleyError::not_found(format!("agent {agent_key}")));
        }
        let title = format!("Chat {}", Utc::now().format("%Y-%m-%d %H:%M"));
        let chat = Chat::new_root(ctx.user_id, ctx.organization_id, &agent_key, &title);
        self.store.create_chat(&chat).await?;
        info!(chat_id = %chat.id, agent = %agent_key, "Chat created");
        Ok(chat)
    }

    async fn resume_turn(
        &self,
        ctx: &TurnContext,
        chat: &mut Chat,
        proposal: &ChatMessage,
        approve: bool,
        config: &Config,
        usage: &mut TokenUsage,
    ) -> Result<TurnOutcome> {
        let tool_call_id = proposal.tool_call_id.as_deref().unwrap_or_default();
        let mut call = match self.store.get_tool_call(chat.id, tool_call_id).await? {
            Some(call) => call,
            None => ToolCall::from_proposal(proposal)
                .ok_or_else(|| ParleyError::internal("proposal without tool call"))?,
        };

        if approve {
            self.dispatch(ctx, chat, &mut call).await?;
        } else {
            let declined = ChatMessage::tool_result(chat.id, &call.id, &call.name, DECLINED_REPLY, None);
            self.store.append_message(&declined).await?;
            call.fail("declined by user");
            self.store.save_tool_call(&call).await?;
            ctx.emit(tool_event(chat.id, ToolEventState::Error, &call, Some("declined by user".into())));
        }

        self.run_loop(ctx, chat, config, usage).await
    }

    async fn run_loop(
        &self,
        ctx: &TurnContext,
        chat: &mut Chat,
        config: &Config,
        usage: &mut TokenUsage,
    ) -> Result<TurnOutcome> {
        let max_iterations = config.max_iterations();

        for iteration in 0..max_iterations {
            if ctx.stop.is_cancelled() {
                return Err(ParleyError::GenerationStopped);
            }
            debug!(iteration, chat_id = %chat.id, "Agent loop iteration");
            ctx.emit(AgentEvent::Status {
                chat_id: chat.id,
                status: TurnStatus::AssistantThinking,
            });

            let agent = self
                .agents
                .get(&chat.agent_key)
                .ok_or_else(|| ParleyError::not_found(format!("agent {}", chat.agent_key)))?;
            let request = self.build_request(chat, &agent, config).await?;
            let response = self.stream_response(ctx, chat.id, &request).await?;

            usage.add(&response.usage);
            ctx.emit(AgentEvent::Usage {
                prompt_tokens: response.usage.prompt_tokens,
                completion_tokens: response.usage.completion_tokens,
                total_tokens: response.usage.total_tokens,
            });

            if response.tool_calls.is_empty() {
                let mut answer = ChatMessage::assistant(chat.id, &response.content);
                answer.token_usage = Some(usage.total_tokens);
                self.store.append_message(&answer).await?;

                let snapshot = self.snapshot(chat.id).await?;
                ctx.emit(AgentEvent::Status {
                    chat_id: chat.id,
                    status: TurnStatus::AssistantCompleted,
                });
                ctx.emit(AgentEvent::Final { snapshot: snapshot.clone() });
                info!(
                    chat_id = %chat.id,
                    iterations = iteration + 1,
                    total_tokens = usage.total_tokens,
                    "Turn completed"
                );
                return Ok(TurnOutcome::Completed(snapshot));
            }

            if let Step::Suspend = self.handle_tool_calls(ctx, chat, &agent, response).await? {
                let snapshot = self.snapshot(chat.id).await?;
                ctx.emit(AgentEvent::Status {
                    chat_id: chat.id,
                    status: TurnStatus::AwaitingConfirmation,
                });
                ctx.emit(AgentEvent::Final { snapshot: snapshot.clone() });
                return Ok(TurnOutcome::AwaitingConfirmation(snapshot));
            }
        }

        Err(ParleyError::internal(format!(
            "no final answer after {max_iterations} iterations"
        )))
    }

    async fn build_request(
        &self,
        chat: &Chat,
        agent: &AgentDefinition,
        config: &Config,
    ) -> Result<CompletionRequest> {
        let messages = self.store.list_messages(chat.id, config.history_limit()).await?;
        let query = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let facts = self
            .enricher
            .enrich_with_facts(chat.user_id, chat.organization_id)
            .await
            .unwrap_or_else(|e| {
                warn!(chat_id = %chat.id, error = %e, "Fact enrichment failed");
                Facts::default()
            });
        let snippets = self
            .enricher
            .enrich_with_rag(chat.organization_id, query, config.rag_limit())
            .await
            .unwrap_or_else(|e| {
                warn!(chat_id = %chat.id, error = %e, "Document enrichment failed");
                Vec::new()
            });
        let subagents = if agent.can_call_subagents {
            self.agents.subagents()
        } else {
            Vec::new()
        };

        let system = build_system_prompt(&PromptParts {
            agent,
            subagents: &subagents,
            facts: &facts.user,
            organization_facts: &facts.organization,
            snippets: &snippets,
            now: Utc::now(),
        });
        let mut prompt = vec![ProviderMessage::system(system)];
        prompt.extend(build_history(&messages));

        Ok(CompletionRequest {
            model: config.model(),
            messages: prompt,
            tools: self.tools.definitions_for(agent),
            temperature: config.temperature(),
            max_tokens: config.max_tokens(),
            reasoning_effort: config.reasoning_effort(),
        })
    }

    /// Stream one completion, forwarding deltas. Stop aborts the in-flight
    /// call; nothing is persisted from a partial response.
    async fn stream_response(
        &self,
        ctx: &TurnContext,
        chat_id: Uuid,
        request: &CompletionRequest,
    ) -> Result<AssembledResponse> {
        let mut stream = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => return Err(ParleyError::GenerationStopped),
            result = self.provider.stream(request) => {
                result.map_err(|e| ParleyError::Provider(format!("{e:#}")))?
            }
        };

        let mut assembler = ToolCallAssembler::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.stop.cancelled() => return Err(ParleyError::GenerationStopped),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| ParleyError::Provider(format!("{e:#}")))?;

            if let Some(delta) = chunk.content_delta.as_deref().filter(|d| !d.is_empty()) {
                ctx.emit(AgentEvent::ContentDelta {
                    chat_id,
                    delta: delta.to_string(),
                });
            }
            assembler.push(&chunk);
            if ctx.stop.is_cancelled() {
                return Err(ParleyError::GenerationStopped);
            }
        }

        assembler
            .finish()
            .map_err(|e| ParleyError::Provider(format!("{e:#}")))
    }

    /// Persist and act on each proposed call in order. `chat` follows
    /// delegation hops.
    async fn handle_tool_calls(
        &self,
        ctx: &TurnContext,
        chat: &mut Chat,
        agent: &AgentDefinition,
        response: AssembledResponse,
    ) -> Result<Step> {
        let origin = chat.clone();
        let mut skipped: Option<&str> = None;

        for (index, request) in response.tool_calls.into_iter().enumerate() {
            let content = if index == 0 { response.content.as_str() } else { "" };
            let allowed = agent.can_use_tool(&request.name);
            let gated = skipped.is_none() && allowed && self.tools.requires_confirmation(&request.name);

            let call_id = self.fresh_call_id(origin.id, &request.id).await?;
            let mut proposal =
                ChatMessage::tool_proposal(origin.id, content, &call_id, &request.name, request.arguments);
            if gated {
                proposal.tool_state = ToolState::Proposed;
            }
            self.store.append_message(&proposal).await?;
            let mut call = ToolCall::from_proposal(&proposal)
                .ok_or_else(|| ParleyError::internal("proposal without tool call"))?;
            self.store.save_tool_call(&call).await?;

            if let Some(reason) = skipped {
                self.record_result(ctx, &origin, &mut call, Err(reason.to_string())).await?;
                continue;
            }
            if !allowed {
                self.record_result(ctx, &origin, &mut call, Err(NOT_ALLOWED.to_string())).await?;
                continue;
            }
            if gated {
                info!(chat_id = %origin.id, tool = %call.name, tool_call_id = %call.id, "Tool call awaiting confirmation");
                return Ok(Step::Suspend);
            }

            match call.name.as_str() {
                SWITCH_TO_SUBAGENT => match self.switch_to_subagent(ctx, &origin, &mut call).await? {
                    Delegation::Moved(child) => {
                        *chat = child;
                        skipped = Some(SKIPPED_AFTER_SWITCH);
                    }
                    Delegation::Refused(reason) => {
                        self.record_result(ctx, &origin, &mut call, Err(reason)).await?;
                    }
                },
                FINISH_SUBAGENT => match self.finish_subagent(ctx, &origin, &mut call).await? {
                    Delegation::Moved(parent) => {
                        *chat = parent;
                        skipped = Some(SKIPPED_AFTER_FINISH);
                    }
                    Delegation::Refused(reason) => {
                        self.record_result(ctx, &origin, &mut call, Err(reason)).await?;
                    }
                },
                _ => self.dispatch(ctx, &origin, &mut call).await?,
            }
        }

        Ok(Step::Continue)
    }

    /// Tool-call ids are the provider's and some backends reuse them across
    /// turns; ids must stay unique within a chat for decisions and replay.
    async fn fresh_call_id(&self, chat_id: Uuid, provider_id: &str) -> Result<String> {
        if !provider_id.is_empty() && self.store.get_tool_call(chat_id, provider_id).await?.is_none() {
            return Ok(provider_id.to_string());
        }
        let id = format!("call_{}", Uuid::new_v4().simple());
        debug!(%chat_id, provider_id, id = %id, "Reassigned reused tool call id");
        Ok(id)
    }

    /// Execute a registry tool. Tool failures become the call's result.
    async fn dispatch(&self, ctx: &TurnContext, chat: &Chat, call: &mut ToolCall) -> Result<()> {
        ctx.emit(tool_event(chat.id, ToolEventState::Invoking, call, None));
        call.mark_executing();
        self.store.save_tool_call(call).await?;

        let tool_ctx = ToolContext {
            chat_id: chat.id,
            user_id: chat.user_id,
            organization_id: chat.organization_id,
            agent_key: chat.agent_key.clone(),
        };
        let outcome = match self.tools.execute(&tool_ctx, &call.name, &call.arguments).await {
            Ok(output) if !output.is_error => Ok(output.content),
            Ok(output) => Err(output.content),
            Err(e) => Err(format!("{e:#}")),
        };
        self.record_result(ctx, chat, call, outcome).await
    }

    async fn record_result(
        &self,
        ctx: &TurnContext,
        chat: &Chat,
        call: &mut ToolCall,
        outcome: std::result::Result<String, String>,
    ) -> Result<()> {
        let message = match &outcome {
            Ok(content) => ChatMessage::tool_result(chat.id, &call.id, &call.name, content, None),
            Err(error) => ChatMessage::tool_result(
                chat.id,
                &call.id,
                &call.name,
                &format!("Error: {error}"),
                Some(error.clone()),
            ),
        };
        self.store.append_message(&message).await?;

        let (state, error) = match outcome {
            Ok(content) => {
                call.complete(&content);
                (ToolEventState::Completed, None)
            }
            Err(error) => {
                debug!(tool = %call.name, %error, "Tool call failed");
                call.fail(&error);
                (ToolEventState::Error, Some(error))
            }
        };
        self.store.save_tool_call(call).await?;
        ctx.emit(tool_event(chat.id, state, call, error));
        Ok(())
    }

    /// Report how a turn ended. Failures are recorded on the chat where
    /// the turn stopped; a failed subagent hands the error to its parent.
    async fn conclude(
        &self,
        ctx: &TurnContext,
        chat: Option<&Chat>,
        result: Result<TurnOutcome>,
    ) -> Result<TurnOutcome> {
        let err = match result {
            Ok(outcome) => return Ok(outcome),
            Err(err) => err,
        };

        if let ParleyError::GenerationStopped = err {
            if let Some(chat) = chat {
                info!(chat_id = %chat.id, "Generation stopped");
                ctx.emit(AgentEvent::Status {
                    chat_id: chat.id,
                    status: TurnStatus::GenerationStopped,
                });
            }
            return Err(err);
        }

        let message = err.to_string();
        if let Some(chat) = chat {
            error!(chat_id = %chat.id, error = %message, "Turn failed");
            if let Err(e) = self.store.append_message(&ChatMessage::failure(chat.id, &message)).await {
                warn!(chat_id = %chat.id, error = %e, "Failed to record turn failure");
            }
            if chat.is_subagent() {
                if let Err(e) = self.fail_subagent(chat, &message).await {
                    warn!(chat_id = %chat.id, error = %e, "Failed to close subagent chat");
                }
            }
        }
        ctx.emit(AgentEvent::Error {
            code: err.code().to_string(),
            message,
        });
        Err(err)
    }
}

fn tool_event(chat_id: Uuid, state: ToolEventState, call: &ToolCall, error: Option<String>) -> AgentEvent {
    AgentEvent::Tool {
        chat_id,
        state,
        tool_name: call.name.clone(),
        tool_call_id: call.id.clone(),
        arguments: call.arguments.clone(),
        error,
    }
}
