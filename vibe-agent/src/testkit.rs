//! Test doubles for driving the generation loop without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use crate::llm::{
    CompletionClient, FinishReason, GenerationUnit, Message, ProviderError, ToolDef, ToolUseBlock,
    UnitStream,
};

type Step = Vec<Result<GenerationUnit, ProviderError>>;

/// A [`CompletionClient`] that replays canned steps.
///
/// Each call pops the next step. Once the script runs out the client either
/// repeats its last step forever (see [`ScriptedClient::looping`]) or answers
/// with a bare finish.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
    refuse: Option<ProviderError>,
    calls: AtomicUsize,
    histories: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Vec<GenerationUnit>>) -> Self {
        Self::with_results(
            steps
                .into_iter()
                .map(|s| s.into_iter().map(Ok).collect())
                .collect(),
        )
    }

    pub fn with_results(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            repeat: None,
            refuse: None,
            calls: AtomicUsize::new(0),
            histories: Mutex::new(Vec::new()),
        }
    }

    /// Yield `step` on every call, forever.
    pub fn looping(step: Vec<GenerationUnit>) -> Self {
        let mut client = Self::with_results(Vec::new());
        client.repeat = Some(step.into_iter().map(Ok).collect());
        client
    }

    /// Fail every call before any unit is produced.
    pub fn failing(error: ProviderError) -> Self {
        let mut client = Self::with_results(Vec::new());
        client.refuse = Some(error);
        client
    }

    /// How many times the model was asked for a step.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The conversation as it stood at each call.
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.histories.lock().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn stream(
        &self,
        _system: &str,
        messages: &[Message],
        _tools: &[ToolDef],
    ) -> Result<UnitStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories.lock().push(messages.to_vec());
        if let Some(e) = &self.refuse {
            return Err(e.clone());
        }
        let step = self
            .script
            .lock()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or_else(|| vec![Ok(GenerationUnit::Finish(FinishReason::Stop))]);
        Ok(futures::stream::iter(step).boxed())
    }
}

pub fn text(s: &str) -> GenerationUnit {
    GenerationUnit::Text(s.to_string())
}

pub fn tool_call(id: &str, name: &str, input: Value) -> GenerationUnit {
    GenerationUnit::ToolCall(ToolUseBlock {
        id: id.to_string(),
        name: name.to_string(),
        input,
    })
}
