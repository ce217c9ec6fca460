// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{AgentStateRef, Question, Tool, ToolCall, ToolContext, ToolOutput};

/// Presents structured multiple-choice questions to the user and collects
/// responses through the context's [`QuestionHandler`](crate::tool::QuestionHandler).
///
/// The handler is what decides how a question actually reaches a human: the
/// top-level agent relays it over the RPC client, a sub-agent relays it to
/// its parent. This tool only has to shape the prompt and parse the answer.
pub struct AskQuestionTool;

#[async_trait]
impl Tool for AskQuestionTool {
    fn name(&self) -> &str {
        "ask_question"
    }

    fn description(&self) -> &str {
        "Present structured multiple-choice questions to the user and collect responses.\n\
         Each question: prompt, options (>= 2). allow_multiple defaults to false.\n\
         Do NOT include 'Other' in options — it is always appended automatically.\n\
         Use for decisions requiring explicit choice; for yes/no just ask directly in text."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "prompt": { "type": "string" },
                            "options": {
                                "type": "array",
                                "items": { "type": "string" },
                                "minItems": 2
                            },
                            "allow_multiple": { "type": "boolean", "default": false }
                        },
                        "required": ["prompt", "options"],
                        "additionalProperties": false
                    },
                    "minItems": 1,
                    "maxItems": 3
                }
            },
            "required": ["questions"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let questions_json = match call.args.get("questions").and_then(|v| v.as_array()) {
            Some(arr) => arr,
            None => return ToolOutput::err(&call.id, "missing 'questions' array"),
        };
        if questions_json.is_empty() {
            return ToolOutput::err(&call.id, "questions array must not be empty");
        }
        if questions_json.len() > 3 {
            return ToolOutput::err(&call.id, "at most 3 questions may be asked at a time");
        }

        let mut questions: Vec<Question> = Vec::new();
        for (i, q_val) in questions_json.iter().enumerate() {
            let q_obj = match q_val.as_object() {
                Some(o) => o,
                None => return ToolOutput::err(&call.id, format!("question {} is not an object", i + 1)),
            };
            let prompt = match q_obj.get("prompt").and_then(|v| v.as_str()) {
                Some(p) => p.to_string(),
                None => return ToolOutput::err(&call.id, format!("question {} missing 'prompt'", i + 1)),
            };
            let choices: Vec<String> = match q_obj.get("options").and_then(|v| v.as_array()) {
                Some(opts) => opts.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                None => return ToolOutput::err(&call.id, format!("question {} missing 'options'", i + 1)),
            };
            if choices.len() < 2 {
                return ToolOutput::err(&call.id, format!("question {} needs at least 2 options", i + 1));
            }
            questions.push(Question { prompt, choices });
        }

        debug!(count = questions.len(), "ask_question tool");

        let mut answers: Vec<String> = Vec::new();
        for q in &questions {
            match ctx.question_handler.ask(q.clone()).await {
                Ok(answer) => answers.push(format!("Q: {}\nA: {}", q.prompt, answer)),
                Err(e) => return ToolOutput::err(&call.id, format!("question failed: {e}")),
            }
        }

        ToolOutput::ok(&call.id, answers.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use anyhow::bail;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::tool::QuestionHandler;

    struct FixedHandler(&'static str);
    #[async_trait]
    impl QuestionHandler for FixedHandler {
        async fn ask(&self, _q: Question) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingHandler;
    #[async_trait]
    impl QuestionHandler for FailingHandler {
        async fn ask(&self, _q: Question) -> anyhow::Result<String> {
            bail!("channel closed")
        }
    }

    fn ctx_with(handler: Arc<dyn QuestionHandler>) -> ToolContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        ToolContext {
            working_dir: std::env::temp_dir(),
            session_id: "s1".into(),
            call_id: "c1".into(),
            emit: tx,
            question_handler: handler,
            agent_state: AgentStateRef::default(),
        }
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall { id: "q1".into(), name: "ask_question".into(), args }
    }

    #[test]
    fn schema_requires_questions() {
        let schema = AskQuestionTool.parameters_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v.as_str() == Some("questions")));
    }

    #[tokio::test]
    async fn missing_questions_is_error() {
        let out = AskQuestionTool.execute(&call(json!({})), &ctx_with(Arc::new(FixedHandler("x")))).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing 'questions'"));
    }

    #[tokio::test]
    async fn too_many_questions_is_error() {
        let make_q = |p: &str| json!({"prompt": p, "options": ["Yes", "No"]});
        let out = AskQuestionTool
            .execute(
                &call(json!({"questions": [make_q("q1"), make_q("q2"), make_q("q3"), make_q("q4")]})),
                &ctx_with(Arc::new(FixedHandler("x"))),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("at most 3"));
    }

    #[tokio::test]
    async fn too_few_options_is_error() {
        let out = AskQuestionTool
            .execute(
                &call(json!({"questions": [{"prompt": "q", "options": ["only one"]}]})),
                &ctx_with(Arc::new(FixedHandler("x"))),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("at least 2 options"));
    }

    #[tokio::test]
    async fn relays_through_question_handler() {
        let out = AskQuestionTool
            .execute(
                &call(json!({"questions": [{"prompt": "Pick one", "options": ["a", "b"]}]})),
                &ctx_with(Arc::new(FixedHandler("a"))),
            )
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("Pick one"));
        assert!(out.content.contains("A: a"));
    }

    #[tokio::test]
    async fn handler_error_propagates() {
        let out = AskQuestionTool
            .execute(
                &call(json!({"questions": [{"prompt": "Pick one", "options": ["a", "b"]}]})),
                &ctx_with(Arc::new(FailingHandler)),
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("channel closed"));
    }
}
