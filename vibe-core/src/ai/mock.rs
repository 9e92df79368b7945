//! A scripted [`AiProvider`] for tests, the same role a `StubLlm` plays in
//! an `LlmClient` test module: enqueue responses up front, hand them out in
//! order, and panic loudly if the script runs dry.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{AiError, AiOutput, AiRequest, AiResponse, AiProvider, AiUsage};

pub struct MockAiProvider {
    script: Mutex<Vec<Result<AiOutput, AiError>>>,
    pub requests: Mutex<Vec<AiRequest>>,
}

impl MockAiProvider {
    pub fn new(script: Vec<Result<AiOutput, AiError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().rev().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(AiOutput::Message(text.into()))])
    }
}

#[async_trait]
impl AiProvider for MockAiProvider {
    async fn invoke(&self, request: &AiRequest) -> Result<AiResponse, AiError> {
        self.requests.lock().unwrap().push(request.clone());
        let output = self
            .script
            .lock()
            .unwrap()
            .pop()
            .expect("MockAiProvider script exhausted");
        output.map(|output| AiResponse {
            output,
            usage: AiUsage::default(),
        })
    }
}
