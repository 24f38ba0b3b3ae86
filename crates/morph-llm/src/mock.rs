use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use morph_core::errors::TransportError;
use morph_core::ids::ToolUseId;
use morph_core::messages::{ContentBlock, ModelResponse};
use morph_core::transport::{ModelBackend, ModelRequest};

/// Pre-programmed replies for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    Response(ModelResponse),
    Error(TransportError),
    /// Wait a duration, then resolve the inner reply.
    Delay(Duration, Box<ScriptedResponse>),
}

impl ScriptedResponse {
    pub fn text(text: &str) -> Self {
        Self::Response(ModelResponse::text(text))
    }

    /// A reply containing a single tool invocation.
    pub fn tool_use(name: &str, input: Value) -> Self {
        Self::tool_uses(vec![(name, input)])
    }

    /// A reply containing several tool invocations, in order.
    pub fn tool_uses(calls: Vec<(&str, Value)>) -> Self {
        let blocks = calls
            .into_iter()
            .map(|(name, input)| ContentBlock::ToolUse {
                id: ToolUseId::new(),
                name: name.to_owned(),
                input,
            })
            .collect();
        Self::Response(ModelResponse::from_blocks(blocks))
    }

    pub fn blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::Response(ModelResponse::from_blocks(blocks))
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Backend that returns pre-programmed replies in sequence and records
/// every request it receives.
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    fallback: Option<ScriptedResponse>,
    requests: Mutex<Vec<ModelRequest>>,
    call_count: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Reply used once the script runs out.
    pub fn with_fallback(mut self, fallback: ScriptedResponse) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Append more replies after construction.
    pub fn push(&self, response: ScriptedResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<ModelRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, TransportError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let next = self.responses.lock().pop_front();
        let Some(mut current) = next.or_else(|| self.fallback.clone()) else {
            return Err(TransportError::Decode(format!(
                "ScriptedBackend: no response configured for call {idx}"
            )));
        };

        loop {
            match current {
                ScriptedResponse::Response(resp) => return Ok(resp),
                ScriptedResponse::Error(e) => return Err(e),
                ScriptedResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}
