//! Typed LLM operations used by the workflow.
//!
//! `ModelClient` wraps a [`ChatTransport`] with the prompt catalog, strict
//! JSON output parsing (one stricter reprompt before giving up), the
//! per-session token budget, and a single retry on deadline. Each operation
//! returns the parsed value together with the role-tagged turns to append
//! to session state.

use std::sync::Arc;
use std::time::Duration;

use quarry_protocol::ChatMessage;
use quarry_protocol::SafetyVerdict;
use quarry_protocol::TokenUsage;
use quarry_protocol::TokenUsageInfo;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::warn;

use crate::config::AnalysisConfig;
use crate::error::QuarryErr;
use crate::error::Result;
use crate::prompts;
use crate::token_budget::TokenBudget;
use crate::token_budget::estimate_tokens;
use crate::transport::ChatRequest;
use crate::transport::ChatTransport;

/// Expected completion sizes per operation, used for pre-call budget checks.
const EXPECTED_VERDICT_TOKENS: i64 = 256;
const EXPECTED_SQL_TOKENS_PER_QUERY: i64 = 256;
const EXPECTED_REPAIR_TOKENS: i64 = 512;
const EXPECTED_REPORT_TOKENS: i64 = 1_536;

/// A typed operation result plus the conversation turns it produced.
#[derive(Debug, Clone)]
pub struct ChatExchange<T> {
    pub value: T,
    pub transcript: Vec<ChatMessage>,
    pub usage: TokenUsage,
}

pub struct ModelClient {
    transport: Arc<dyn ChatTransport>,
    budget: TokenBudget,
    deadline: Duration,
}

impl ModelClient {
    pub fn new(transport: Arc<dyn ChatTransport>, config: &AnalysisConfig) -> Self {
        Self {
            transport,
            budget: TokenBudget::new(config.token_budget_session),
            deadline: config.deadline_llm,
        }
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn usage_info(&self) -> TokenUsageInfo {
        self.budget.snapshot()
    }

    /// Classify a raw user task; rejected tasks terminate the session.
    pub async fn classify_safety(
        &self,
        user_task: &str,
        dataset: &str,
        tables: &[String],
    ) -> Result<ChatExchange<SafetyVerdict>> {
        let prompt = prompts::task_safety_filter_prompt(user_task, dataset, tables);
        let schema_hint = r#"{"verdict": "accept" | "reject", "filtered_task": string?, "rejection_reason": string?}"#;
        self.request_json::<SafetyVerdict>(prompt, schema_hint, EXPECTED_VERDICT_TOKENS)
            .await
    }

    /// Synthesize up to `max_queries` read-only SQL queries for the task.
    pub async fn synthesize_queries(
        &self,
        filtered_task: &str,
        schemas_block: &str,
        max_queries: usize,
        prior_error: Option<&str>,
    ) -> Result<ChatExchange<Vec<String>>> {
        let mut prompt = prompts::intent_analysis_prompt(filtered_task, schemas_block, max_queries);
        if let Some(error) = prior_error {
            prompt.push_str(&format!(
                "\nA previous attempt failed validation. Avoid repeating this mistake; \
                 the queries must be read-only SELECT statements:\n\n{error}\n"
            ));
        }
        let schema_hint = r#"{"queries": [string, ...]}"#;
        let expected = EXPECTED_SQL_TOKENS_PER_QUERY * max_queries as i64;

        let exchange = self
            .request_json::<QueriesPayload>(prompt, schema_hint, expected)
            .await?;
        let mut queries = exchange.value.queries;
        if queries.is_empty() {
            return Err(QuarryErr::LlmMalformedOutput(
                "model returned an empty query list".to_string(),
            ));
        }
        if queries.len() > max_queries {
            warn!(
                "model returned {} queries, truncating to {max_queries}",
                queries.len()
            );
            queries.truncate(max_queries);
        }
        Ok(ChatExchange {
            value: queries,
            transcript: exchange.transcript,
            usage: exchange.usage,
        })
    }

    /// Repair a single failed query given the warehouse's error string.
    pub async fn repair_query(
        &self,
        sql: &str,
        error: &str,
        schemas_block: &str,
    ) -> Result<ChatExchange<String>> {
        let prompt = prompts::error_repair_prompt(sql, error, schemas_block);
        let schema_hint = r#"{"sql": string}"#;
        let exchange = self
            .request_json::<SqlPayload>(prompt, schema_hint, EXPECTED_REPAIR_TOKENS)
            .await?;
        Ok(ChatExchange {
            value: exchange.value.sql,
            transcript: exchange.transcript,
            usage: exchange.usage,
        })
    }

    /// Compose the final report from per-query summaries. Free-form text;
    /// no JSON contract.
    pub async fn compose_report(
        &self,
        task: &str,
        summaries_block: &str,
    ) -> Result<ChatExchange<String>> {
        let prompt = prompts::analysis_report_prompt(task, summaries_block);
        let messages = vec![
            ChatMessage::system(prompts::ANALYST_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];
        let (reply, usage) = self.request(messages.clone(), EXPECTED_REPORT_TOKENS).await?;
        let report = reply.content.clone();
        Ok(ChatExchange {
            value: report,
            transcript: transcript_of(&messages, &reply),
            usage,
        })
    }

    /// Tokens the session may still spend.
    pub fn remaining_budget(&self) -> i64 {
        self.budget.remaining()
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        prompt: String,
        schema_hint: &str,
        expected_completion: i64,
    ) -> Result<ChatExchange<T>> {
        let mut messages = vec![
            ChatMessage::system(prompts::ANALYST_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];
        let (reply, mut usage) = self.request(messages.clone(), expected_completion).await?;

        match parse_json_payload::<T>(&reply.content) {
            Ok(value) => Ok(ChatExchange {
                value,
                transcript: transcript_of(&messages, &reply),
                usage,
            }),
            Err(parse_err) => {
                debug!("malformed model output, reprompting: {parse_err}");
                messages.push(reply);
                messages.push(ChatMessage::user(format!(
                    "Your previous response could not be parsed ({parse_err}). \
                     Respond only with JSON matching this schema, with no prose or \
                     code fences: {schema_hint}"
                )));
                let (reply, retry_usage) =
                    self.request(messages.clone(), expected_completion).await?;
                usage.add_assign(&retry_usage);
                let value = parse_json_payload::<T>(&reply.content)
                    .map_err(QuarryErr::LlmMalformedOutput)?;
                Ok(ChatExchange {
                    value,
                    transcript: transcript_of(&messages, &reply),
                    usage,
                })
            }
        }
    }

    /// One budget-checked transport call, with a single retry on deadline.
    async fn request(
        &self,
        messages: Vec<ChatMessage>,
        expected_completion: i64,
    ) -> Result<(ChatMessage, TokenUsage)> {
        let prompt_estimate: i64 = messages
            .iter()
            .map(|message| estimate_tokens(&message.content))
            .sum();
        let estimate = prompt_estimate + expected_completion;
        self.budget.check(estimate)?;

        let request = ChatRequest {
            messages: messages.clone(),
            max_output_tokens: Some(expected_completion),
        };
        let completion = match self.complete_with_deadline(request.clone()).await {
            Ok(completion) => completion,
            Err(QuarryErr::Deadline(deadline)) => {
                warn!("llm call exceeded {deadline:?}, retrying once");
                self.complete_with_deadline(request).await?
            }
            Err(err) => return Err(err),
        };

        let usage = completion.usage.unwrap_or_else(|| {
            let output = estimate_tokens(&completion.message.content);
            TokenUsage {
                input_tokens: prompt_estimate,
                output_tokens: output,
                total_tokens: prompt_estimate + output,
            }
        });
        self.budget.record(&usage);
        Ok((completion.message, usage))
    }

    async fn complete_with_deadline(
        &self,
        request: ChatRequest,
    ) -> Result<crate::transport::ChatCompletion> {
        match tokio::time::timeout(self.deadline, self.transport.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(QuarryErr::Deadline(self.deadline)),
        }
    }
}

fn transcript_of(messages: &[ChatMessage], reply: &ChatMessage) -> Vec<ChatMessage> {
    let mut transcript: Vec<ChatMessage> = messages
        .iter()
        .filter(|message| !matches!(message.role, quarry_protocol::Role::System))
        .cloned()
        .collect();
    transcript.push(reply.clone());
    transcript
}

#[derive(Deserialize)]
struct QueriesPayload {
    queries: Vec<String>,
}

#[derive(Deserialize)]
struct SqlPayload {
    sql: String,
}

/// Extract a JSON document from model output that may wrap it in prose or
/// code fences.
fn parse_json_payload<T: DeserializeOwned>(content: &str) -> std::result::Result<T, String> {
    let trimmed = content.trim();
    let candidate = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.split("```").next().unwrap_or(rest).trim()
    } else {
        trimmed
    };
    let candidate = match (candidate.find('{'), candidate.rfind('}')) {
        (Some(start), Some(end)) if start < end => &candidate[start..=end],
        _ => candidate,
    };
    serde_json::from_str::<T>(candidate).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use quarry_protocol::Verdict;
    use std::sync::Mutex;

    use crate::transport::ChatCompletion;

    /// Scripted transport: pops one canned reply per call.
    struct ScriptedTransport {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
            })
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatCompletion> {
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| QuarryErr::Internal("script exhausted".to_string()))?;
            Ok(ChatCompletion {
                message: ChatMessage::assistant(reply),
                usage: None,
            })
        }
    }

    fn client(transport: Arc<dyn ChatTransport>) -> ModelClient {
        ModelClient::new(transport, &AnalysisConfig::default())
    }

    #[tokio::test]
    async fn parses_fenced_json_verdict() {
        let transport = ScriptedTransport::new(vec![
            "```json\n{\"verdict\": \"accept\", \"filtered_task\": \"sum revenue\"}\n```",
        ]);
        let exchange = client(transport)
            .classify_safety("sum revenue", "sales", &["orders".to_string()])
            .await
            .unwrap();
        assert_eq!(exchange.value.verdict, Verdict::Accept);
        assert_eq!(exchange.value.filtered_task.as_deref(), Some("sum revenue"));
        // user prompt + assistant reply, system turn excluded
        assert_eq!(exchange.transcript.len(), 2);
    }

    #[tokio::test]
    async fn reprompts_once_on_malformed_output_then_fails() {
        let transport = ScriptedTransport::new(vec!["not json", "still not json"]);
        let err = client(transport)
            .repair_query("SELECT 1", "boom", "")
            .await
            .unwrap_err();
        assert!(matches!(err, QuarryErr::LlmMalformedOutput(_)));
    }

    #[tokio::test]
    async fn reprompt_recovers_when_second_reply_parses() {
        let transport =
            ScriptedTransport::new(vec!["garbage", r#"{"sql": "SELECT amount FROM orders"}"#]);
        let exchange = client(transport)
            .repair_query("SELECT amont FROM orders", "no such column", "")
            .await
            .unwrap();
        assert_eq!(exchange.value, "SELECT amount FROM orders");
    }

    #[tokio::test]
    async fn refuses_call_when_budget_too_small() {
        let transport = ScriptedTransport::new(vec![r#"{"queries": ["SELECT 1"]}"#]);
        let config = AnalysisConfig {
            token_budget_session: 10,
            ..AnalysisConfig::default()
        };
        let client = ModelClient::new(transport, &config);
        let err = client
            .synthesize_queries("task", "schemas", 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, QuarryErr::BudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn truncates_query_list_to_max() {
        let transport = ScriptedTransport::new(vec![
            r#"{"queries": ["SELECT 1", "SELECT 2", "SELECT 3"]}"#,
        ]);
        let exchange = client(transport)
            .synthesize_queries("task", "schemas", 2, None)
            .await
            .unwrap();
        assert_eq!(exchange.value.len(), 2);
    }
}
