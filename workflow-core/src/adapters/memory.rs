//! In-memory adapter fakes for tests: record every call, and let a test
//! script prime canned results/errors per `to`/`idempotency_key`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::AdapterError;

use super::{
    EmailSendRequest, MessagingAdapter, MessagingSendRequest, MessagingSendResult, TaskAdapter,
    TaskCreateRequest, TaskCreateResult, VoiceAdapter, VoiceOutcome, VoicePlaceRequest, VoicePlaceResult,
};

#[derive(Default)]
pub struct FakeMessagingAdapter {
    pub sent: Mutex<Vec<MessagingSendRequest>>,
    pub emails: Mutex<Vec<EmailSendRequest>>,
    /// If set, `send` returns this error instead of succeeding (used by the
    /// retry/dead-letter scenario test, §8 S4).
    pub force_error: Mutex<Option<String>>,
}

impl FakeMessagingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forced_error(message: impl Into<String>) -> Self {
        FakeMessagingAdapter { force_error: Mutex::new(Some(message.into())), ..Default::default() }
    }
}

#[async_trait]
impl MessagingAdapter for FakeMessagingAdapter {
    async fn send(&self, request: MessagingSendRequest) -> Result<MessagingSendResult, AdapterError> {
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(AdapterError::Transient(msg));
        }
        let id = format!("msg-{}", self.sent.lock().unwrap().len() + 1);
        self.sent.lock().unwrap().push(request);
        Ok(MessagingSendResult { provider_message_id: id })
    }

    async fn send_email(&self, request: EmailSendRequest) -> Result<MessagingSendResult, AdapterError> {
        let id = format!("email-{}", self.emails.lock().unwrap().len() + 1);
        self.emails.lock().unwrap().push(request);
        Ok(MessagingSendResult { provider_message_id: id })
    }
}

#[derive(Default)]
pub struct FakeVoiceAdapter {
    pub placed: Mutex<Vec<VoicePlaceRequest>>,
    pub outcomes: Mutex<HashMap<String, VoiceOutcome>>,
}

impl FakeVoiceAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VoiceAdapter for FakeVoiceAdapter {
    async fn place(&self, request: VoicePlaceRequest) -> Result<VoicePlaceResult, AdapterError> {
        let n = self.placed.lock().unwrap().len() + 1;
        self.placed.lock().unwrap().push(request);
        Ok(VoicePlaceResult {
            provider_call_id: format!("call-{n}"),
            provider_conversation_id: format!("convo-{n}"),
        })
    }

    async fn fetch_outcome(&self, provider_conversation_id: &str) -> Result<VoiceOutcome, AdapterError> {
        self.outcomes
            .lock()
            .unwrap()
            .get(provider_conversation_id)
            .cloned()
            .ok_or_else(|| AdapterError::Transient("no outcome primed".to_string()))
    }
}

#[derive(Default)]
pub struct FakeTaskAdapter {
    pub created: Mutex<Vec<TaskCreateRequest>>,
}

impl FakeTaskAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskAdapter for FakeTaskAdapter {
    async fn create(&self, request: TaskCreateRequest) -> Result<TaskCreateResult, AdapterError> {
        let n = self.created.lock().unwrap().len() + 1;
        self.created.lock().unwrap().push(request);
        Ok(TaskCreateResult { task_id: format!("task-{n}") })
    }
}
