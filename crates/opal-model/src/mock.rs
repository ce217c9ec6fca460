// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    catalog::InputModality, provider::ResponseStream, CompletionRequest, ProviderEvent, StopReason,
    Usage,
};

/// Deterministic mock provider. Echoes the last user message back as the
/// assistant response. The default provider when no `model.provider` is
/// configured, and the driver behind every offline test in this workspace.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ProviderEvent>> = vec![
            Ok(ProviderEvent::TextStart),
            Ok(ProviderEvent::TextDelta { delta: format!("MOCK: {reply}") }),
            Ok(ProviderEvent::TextDone),
            Ok(ProviderEvent::Usage(Usage { input_tokens: 10, output_tokens: 10, ..Default::default() })),
            Ok(ProviderEvent::ResponseDone { stop_reason: StopReason::Stop }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider. Each call to `stream` pops the next response
/// script from the front of the queue. Lets tests specify exact event
/// sequences — including tool calls — without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<ProviderEvent>>>>,
    name: String,
    /// Claimed input modalities. Defaults to `[Text]` (conservative).
    modalities: Vec<InputModality>,
    /// The last `CompletionRequest` seen by this provider, for test assertions.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of response scripts.
    ///
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`ProviderEvent`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            modalities: vec![InputModality::Text],
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Declare that this mock supports image input as well as text.
    pub fn with_vision(mut self) -> Self {
        self.modalities = vec![InputModality::Text, InputModality::Image];
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ProviderEvent::TextStart,
            ProviderEvent::TextDelta { delta: reply.into() },
            ProviderEvent::TextDone,
            ProviderEvent::Usage(Usage { input_tokens: 5, output_tokens: 5, ..Default::default() }),
            ProviderEvent::ResponseDone { stop_reason: StopReason::Stop },
        ]])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let tool_id = tool_id.into();
        Self::new(vec![
            // Round 1 — model emits a tool call
            vec![
                ProviderEvent::ToolCallStart {
                    call_id: Some(tool_id.clone()),
                    call_index: Some(0),
                    name: Some(tool_name.into()),
                },
                ProviderEvent::ToolCallDelta {
                    call_id: Some(tool_id.clone()),
                    call_index: Some(0),
                    delta: args_json.into(),
                },
                ProviderEvent::ToolCallDone { call_id: Some(tool_id), call_index: Some(0) },
                ProviderEvent::ResponseDone { stop_reason: StopReason::ToolCalls },
            ],
            // Round 2 — model responds after the tool result is fed back
            vec![
                ProviderEvent::TextStart,
                ProviderEvent::TextDelta { delta: final_text.into() },
                ProviderEvent::TextDone,
                ProviderEvent::ResponseDone { stop_reason: StopReason::Stop },
            ],
        ])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn input_modalities(&self) -> Vec<InputModality> {
        self.modalities.clone()
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    ProviderEvent::TextStart,
                    ProviderEvent::TextDelta { delta: "[no more scripts]".into() },
                    ProviderEvent::TextDone,
                    ProviderEvent::ResponseDone { stop_reason: StopReason::Stop },
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ProviderEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
