//! Scripted upstream used by relay and route tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_llm::{ChatBackend, CompletionRequest, EventStream, LlmError, StreamEvent};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub enum Script {
    Events(Vec<Result<StreamEvent, LlmError>>),
    OpenError(LlmError),
    /// A stream that never yields. Dropping it flips `stream_dropped`.
    Pending,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct FakeBackend {
    credential: bool,
    script: Mutex<Option<Script>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<CompletionRequest>>,
    stream_dropped: Arc<AtomicBool>,
}

impl FakeBackend {
    pub fn new(credential: bool, script: Script) -> Self {
        Self {
            credential,
            script: Mutex::new(Some(script)),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True once a `Script::Pending` stream has been dropped by its reader.
    pub fn stream_dropped(&self) -> bool {
        self.stream_dropped.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.last_request.lock().expect("last_request lock").clone()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    fn model(&self) -> &str {
        "fake-model"
    }

    fn credential_configured(&self) -> bool {
        self.credential
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
    ) -> relay_llm::Result<EventStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().expect("last_request lock") = Some(request.clone());
        let script = self
            .script
            .lock()
            .expect("script lock")
            .take()
            .expect("fake backend called more than once");
        match script {
            Script::Events(events) => Ok(Box::pin(futures_util::stream::iter(events))),
            Script::OpenError(e) => Err(e),
            Script::Pending => {
                let flag = DropFlag(self.stream_dropped.clone());
                let stream = futures_util::stream::pending::<relay_llm::Result<StreamEvent>>()
                    .map(move |item| {
                        let _held = &flag;
                        item
                    });
                Ok(Box::pin(stream))
            }
        }
    }
}
