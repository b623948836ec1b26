//! Test doubles shared by the core unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::ports::{LanguageModelService, PortError, PortResult};

type Responder = Box<dyn Fn(&str, &str) -> PortResult<String> + Send + Sync>;

/// A language model whose answers are decided by the test.
pub(crate) struct ScriptedModel {
    respond: Responder,
    delay: Duration,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    /// Answers every call with `respond(instructions, input)`.
    pub fn new(
        respond: impl Fn(&str, &str) -> PortResult<String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::slow(Duration::ZERO, respond)
    }

    /// Like `new`, but every call takes at least `delay`.
    pub fn slow(
        delay: Duration,
        respond: impl Fn(&str, &str) -> PortResult<String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Plays `replies` back in order, then fails every further call.
    pub fn replies(replies: Vec<PortResult<String>>) -> Arc<Self> {
        let next = AtomicUsize::new(0);
        Self::new(move |_, _| {
            let i = next.fetch_add(1, Ordering::SeqCst);
            replies
                .get(i)
                .cloned()
                .unwrap_or_else(|| Err(PortError::Unexpected("script exhausted".into())))
        })
    }

    pub async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl LanguageModelService for ScriptedModel {
    async fn complete(&self, instructions: &str, input: &str) -> PortResult<String> {
        self.calls
            .lock()
            .await
            .push((instructions.to_string(), input.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(instructions, input)
    }
}
