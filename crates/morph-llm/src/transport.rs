use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{instrument, warn};

use morph_core::errors::TransportError;
use morph_core::messages::{Message, ModelResponse};
use morph_core::tools::{ToolChoice, ToolDefinition};
use morph_core::transport::{ModelBackend, ModelRequest};
use morph_settings::ModelAccessSettings;

use crate::http::HttpBackend;
use crate::transcript::{TranscriptEntry, TranscriptLog};

/// Optional parts of a model call.
#[derive(Clone, Debug, Default)]
pub struct CallExtras {
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    /// Extra provider fields merged into the request body.
    pub extra: Map<String, Value>,
}

impl CallExtras {
    pub fn with_tools(tools: Vec<ToolDefinition>) -> Self {
        Self {
            tools,
            ..Default::default()
        }
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }
}

/// The single model-call primitive. Every call, successful or not, lands in
/// the transcript log before `call` returns.
pub struct Transport {
    backend: Arc<dyn ModelBackend>,
    transcript: Arc<TranscriptLog>,
    model: String,
    max_tokens: u32,
}

impl Transport {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        transcript: Arc<TranscriptLog>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            backend,
            transcript,
            model: model.into(),
            max_tokens,
        }
    }

    pub fn from_settings(
        settings: &ModelAccessSettings,
        transcript: Arc<TranscriptLog>,
    ) -> Result<Self, TransportError> {
        let backend = HttpBackend::from_settings(settings)?;
        Ok(Self::new(
            Arc::new(backend),
            transcript,
            settings.model.clone(),
            settings.max_tokens,
        ))
    }

    pub fn transcript(&self) -> &Arc<TranscriptLog> {
        &self.transcript
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(source = source, backend = self.backend.name()))]
    pub async fn call(
        &self,
        source: &str,
        system: &str,
        messages: &[Message],
        extras: CallExtras,
    ) -> Result<ModelResponse, TransportError> {
        let request = ModelRequest {
            system: system.to_owned(),
            messages: messages.to_vec(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            tools: extras.tools,
            tool_choice: extras.tool_choice,
            extra: extras.extra,
        };

        let started = Instant::now();
        let result = self.backend.complete(&request).await;
        let elapsed = started.elapsed();

        let tool_names = request.tools.iter().map(|t| t.name.clone()).collect();
        let prompt = json!({
            "system": request.system,
            "messages": request.messages,
        });
        let entry = TranscriptEntry::new(source, prompt, tool_names).with_duration(elapsed);
        let entry = match &result {
            Ok(response) => entry.with_response(serde_json::to_value(response).unwrap_or(Value::Null)),
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "model call failed");
                entry.with_error(e.to_string())
            }
        };
        self.transcript.push(entry);

        result
    }
}
