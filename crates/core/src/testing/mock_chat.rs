//! Mock chat client for testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::chat::{ActionButton, ChatClient, ChatError, CreateChannelRequest, Embed};

/// A recorded chat call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCall {
    CreateChannel { name: String, user_id: Option<String> },
    DeleteChannel { channel_id: String },
    SendMessage { channel_id: String, text: String },
    PostEmbed { channel_id: String, embed: Embed, buttons: Vec<ActionButton> },
    DeleteMessage { channel_id: String, message_id: String },
    DirectMessage { user_id: String, text: String },
}

impl ChatCall {
    /// Name of the client method, as accepted by [`MockChatClient::fail_on`].
    pub fn name(&self) -> &'static str {
        match self {
            ChatCall::CreateChannel { .. } => "create_channel",
            ChatCall::DeleteChannel { .. } => "delete_channel",
            ChatCall::SendMessage { .. } => "send_message",
            ChatCall::PostEmbed { .. } => "post_embed",
            ChatCall::DeleteMessage { .. } => "delete_message",
            ChatCall::DirectMessage { .. } => "direct_message",
        }
    }
}

/// Mock implementation of the ChatClient trait.
///
/// Records every call, including failed ones. Created channels get ids
/// `chan-1`, `chan-2`, ... in call order.
#[derive(Debug, Default)]
pub struct MockChatClient {
    calls: Mutex<Vec<ChatCall>>,
    failing: Mutex<HashSet<&'static str>>,
    next_channel: AtomicU64,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call to `method` fail with an API error.
    pub fn fail_on(&self, method: &'static str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(method);
        }
    }

    /// Stop failing `method`.
    pub fn recover(&self, method: &'static str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(method);
        }
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls to one method, in order.
    pub fn calls_to(&self, method: &str) -> Vec<ChatCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.name() == method)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn record(&self, call: ChatCall) -> Result<(), ChatError> {
        let name = call.name();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(name))
            .unwrap_or(false);
        if failing {
            return Err(ChatError::Api {
                status: 500,
                message: format!("mock {} failure", name),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn create_channel(&self, request: &CreateChannelRequest) -> Result<String, ChatError> {
        let user_id = request.overwrites.iter().find_map(|o| {
            (o.kind == crate::chat::OverwriteKind::Member).then(|| o.id.clone())
        });
        self.record(ChatCall::CreateChannel {
            name: request.name.clone(),
            user_id,
        })?;
        let n = self.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("chan-{}", n))
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<(), ChatError> {
        self.record(ChatCall::DeleteChannel {
            channel_id: channel_id.to_string(),
        })
    }

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), ChatError> {
        self.record(ChatCall::SendMessage {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
        })
    }

    async fn post_embed(
        &self,
        channel_id: &str,
        embed: &Embed,
        buttons: &[ActionButton],
    ) -> Result<(), ChatError> {
        self.record(ChatCall::PostEmbed {
            channel_id: channel_id.to_string(),
            embed: embed.clone(),
            buttons: buttons.to_vec(),
        })
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<(), ChatError> {
        self.record(ChatCall::DeleteMessage {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
        })
    }

    async fn direct_message(&self, user_id: &str, text: &str) -> Result<(), ChatError> {
        self.record(ChatCall::DirectMessage {
            user_id: user_id.to_string(),
            text: text.to_string(),
        })
    }
}
