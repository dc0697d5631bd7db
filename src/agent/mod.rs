//! The Decision Agent: turns an [`Observation`] into a 1-based choice
//! index, leveraging per-run memory and loop-awareness, and never crashing
//! the run it belongs to.

pub mod calculator;
pub mod loop_detect;
pub mod memory;
pub mod reply;

use std::{collections::HashMap, sync::LazyLock, time::Duration};

use regex::Regex;

use crate::{
    environment::Observation,
    llm::{ChatMessage, ChatRequest, Driver, Provider, TokenUsage, complete_with_retry},
    models::LlmDecision,
    prelude::*,
};

use loop_detect::{Fingerprint, LoopState, fingerprint};
use memory::{Memory, MemoryConfig, MemoryEntry};
use reply::{ParsedReply, parse_reply, result_in_range};

/// The closed set of tools an agent may be configured to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Calculator,
}

/// Static configuration for one agent, as read from a TOML/JSON config
/// file or selected by id from a library of such files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,

    /// A `provider:model` identifier, e.g. `openai:gpt-4o-mini` or
    /// `random_local:baseline`.
    pub model: String,

    pub system_template: String,
    pub action_template: String,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub tools: Vec<Tool>,

    /// Auto-select the only choice when exactly one exists, bypassing the
    /// LLM call. Applied by the Run Loop, not the Agent itself.
    #[serde(default)]
    pub skip_single: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_max_retries() -> u32 {
    2
}

impl AgentConfig {
    /// Parse [`Self::model`] into a provider and bare model name.
    pub fn provider_and_model(&self) -> (Provider, &str) {
        Provider::parse_identifier(&self.model)
    }
}

static CALCULATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)calculator:\s*(.+)").expect("static regex is valid")
});

/// Live per-run agent state: memory, loop-detection, and the driver used
/// to reach the configured model.
pub struct Agent {
    config: AgentConfig,
    driver: Box<dyn Driver>,
    memory: Memory,
    loop_state: LoopState,
    last_action_at_fp: HashMap<Fingerprint, i64>,
}

/// What the agent decided, plus the bookkeeping the Run Loop needs to
/// persist on the step record.
pub struct Decision {
    pub action: i64,
    pub llm_decision: LlmDecision,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let (provider, _) = config.provider_and_model();
        let driver = provider.create_driver()?;
        let memory = Memory::new(config.memory.clone());
        Ok(Agent {
            config,
            driver,
            memory,
            loop_state: LoopState::new(),
            last_action_at_fp: HashMap::new(),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Decide an action for the current observation. Never returns an
    /// error: every failure mode (transport, parse, malformed reply)
    /// degrades to the documented fallback instead.
    #[instrument(level = "debug", skip(self, observation), fields(agent = %self.config.agent_id))]
    pub async fn decide(&mut self, observation: &Observation, budget: Duration) -> Decision {
        let choice_count = observation.choice_count();
        let fp = fingerprint(observation);
        self.loop_state.record_visit(fp);
        let last_action = self.last_action_at_fp.get(&fp).copied();
        let hint = self.loop_state.should_hint(fp, last_action);

        let (raw_chosen, mut llm_decision) =
            self.call_with_retries(observation, hint, choice_count, budget).await;

        let chosen = if let Some(alt) =
            self.loop_state.escape_override(fp, last_action, raw_chosen, choice_count)
        {
            llm_decision.override_ = Some("loop_escape".to_owned());
            alt
        } else {
            raw_chosen
        };

        // Track the model's own repeated choice, not the override -- the
        // streak a future visit hints on is "you keep picking this", which
        // stays true even on a step where we overrode it.
        self.loop_state.record_action(fp, raw_chosen);
        self.last_action_at_fp.insert(fp, raw_chosen);

        self.remember_step(observation, chosen, &llm_decision).await;

        Decision {
            action: chosen,
            llm_decision,
        }
    }

    /// Run the call/parse/retry loop. Always returns a valid 1-based
    /// index, falling back to `1` if nothing usable comes back.
    async fn call_with_retries(
        &self,
        observation: &Observation,
        loop_hint: bool,
        choice_count: usize,
        budget: Duration,
    ) -> (i64, LlmDecision) {
        let mut best: ParsedReply = ParsedReply::default();
        let mut usage = TokenUsage::default();
        let mut cost_usd: Option<f64> = None;
        let mut llm_error: Option<String> = None;

        let attempts = 1 + self.config.max_retries;
        for attempt in 0..attempts {
            let schema_reminder = attempt > 0;
            let prompt = self.render_prompt(observation, loop_hint, schema_reminder);
            let request = ChatRequest {
                messages: prompt,
                model: self.config.provider_and_model().1.to_owned(),
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
                timeout: budget,
                choice_count,
            };

            match complete_with_retry(self.driver.as_ref(), &request, 3).await {
                Ok(result) => {
                    usage += result.usage;
                    cost_usd = match (cost_usd, result.cost_usd) {
                        (Some(a), Some(b)) => Some(a + b),
                        (a, None) => a,
                        (None, b) => b,
                    };
                    match parse_reply(&result.content) {
                        Ok(parsed) => {
                            if parsed.reasoning.is_some() {
                                best.reasoning = parsed.reasoning.clone();
                            }
                            if parsed.analysis.is_some() {
                                best.analysis = parsed.analysis.clone();
                            }
                            if let Some(r) = parsed.result {
                                if result_in_range(r, choice_count) {
                                    return (
                                        r,
                                        LlmDecision {
                                            analysis: best.analysis,
                                            reasoning: best.reasoning,
                                            result: Some(r),
                                            error: None,
                                            override_: None,
                                            usage,
                                            cost_usd,
                                        },
                                    );
                                }
                            }
                            llm_error = Some("parse_error".to_owned());
                        }
                        Err(_) => {
                            llm_error = Some("parse_error".to_owned());
                        }
                    }
                }
                Err(e) => {
                    llm_error = Some(format!("llm_call_error: {e}"));
                    // A failed call already exhausted its own transport
                    // retries; retrying the exact same request here would
                    // just repeat the same failure, so stop early.
                    break;
                }
            }
        }

        (
            1,
            LlmDecision {
                analysis: best.analysis,
                reasoning: best.reasoning,
                result: None,
                error: llm_error.or_else(|| Some("parse_error".to_owned())),
                override_: None,
                usage,
                cost_usd,
            },
        )
    }

    fn render_prompt(
        &self,
        observation: &Observation,
        loop_hint: bool,
        schema_reminder: bool,
    ) -> Vec<ChatMessage> {
        let loop_hint_text = loop_hint.then(|| {
            "you have repeated this state; prefer a different action than your \
             previous choice here"
                .to_owned()
        });
        let bindings = json!({
            "observation": observation.text,
            "choices": observation.choices_rendered,
            "params_state": observation.params_state,
            "memory_block": self.memory.render_block(),
            "loop_hint": loop_hint_text,
            "schema_reminder": schema_reminder.then(|| {
                "Reminder: reply with a single JSON object \
                 {\"reasoning\": string, \"result\": integer} and nothing else."
                    .to_owned()
            }),
        });

        let system = crate::prompt::render(&self.config.system_template, &bindings)
            .unwrap_or_default();
        let action = crate::prompt::render(&self.config.action_template, &bindings)
            .unwrap_or_default();

        vec![ChatMessage::system(system), ChatMessage::user(action)]
    }

    async fn remember_step(
        &mut self,
        observation: &Observation,
        action: i64,
        llm_decision: &LlmDecision,
    ) {
        self.memory.record(MemoryEntry {
            observation: observation.text.clone(),
            choices: observation.choices_rendered.clone(),
            action,
            reasoning: llm_decision.reasoning.clone().unwrap_or_default(),
        });

        if self.config.tools.contains(&Tool::Calculator) {
            if let Some(reasoning) = &llm_decision.reasoning {
                if let Some(captures) = CALCULATOR_RE.captures(reasoning) {
                    let expr = captures[1].trim();
                    self.memory
                        .append_note(calculator::evaluate_for_memory(expr));
                }
            }
        }

        if self.memory.due_for_summary() {
            self.refresh_summary().await;
        }
    }

    async fn refresh_summary(&mut self) {
        let prompt = format!(
            "Summarize the following quest playthrough history concisely, \
             preserving any state relevant to future decisions:\n{}",
            self.memory.pending_entries_text()
        );
        let request = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            model: self.config.provider_and_model().1.to_owned(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout: Duration::from_secs(30),
            choice_count: 1,
        };
        match complete_with_retry(self.driver.as_ref(), &request, 2).await {
            Ok(result) => self.memory.apply_summary(result.content),
            Err(e) => {
                warn!("failed to refresh rolling memory summary: {e}");
            }
        }
    }
}
