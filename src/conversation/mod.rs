//! Per-conversation mutable state, keyed by (channel, user).
//!
//! Each key owns a bounded turn history and at most one pending
//! clarification. Entries get their own lock so two users chatting at once
//! never contend, while two near-simultaneous messages from the same pair
//! are serialized instead of racing on the pending slot.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// Identifies one conversation: a user within a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub channel: String,
    pub user: String,
}

impl ConversationKey {
    pub fn new(channel: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            user: user.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// An outstanding clarification question awaiting the user's reply.
/// `tool: None` means the ambiguity was about which tool, not its parameters.
#[derive(Debug, Clone)]
pub struct PendingClarification {
    pub tool: Option<String>,
    pub question: String,
    pub original_utterance: String,
    pub asked_at: DateTime<Utc>,
}

impl PendingClarification {
    pub fn new(tool: Option<String>, question: impl Into<String>, original: impl Into<String>) -> Self {
        Self {
            tool,
            question: question.into(),
            original_utterance: original.into(),
            asked_at: Utc::now(),
        }
    }
}

/// State for one (channel, user) pair. Invariant: at most one pending
/// clarification at any time.
#[derive(Debug)]
pub struct ConversationState {
    turns: VecDeque<Turn>,
    pending: Option<PendingClarification>,
    retention: usize,
}

impl ConversationState {
    fn new(retention: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            pending: None,
            retention,
        }
    }

    pub fn push_user(&mut self, content: &str) {
        self.push(ROLE_USER, content);
    }

    pub fn push_assistant(&mut self, content: &str) {
        self.push(ROLE_ASSISTANT, content);
    }

    fn push(&mut self, role: &str, content: &str) {
        self.turns.push_back(Turn {
            role: role.to_string(),
            content: content.to_string(),
        });
        while self.turns.len() > self.retention {
            self.turns.pop_front();
        }
    }

    /// The most recent `count` turns, oldest first.
    pub fn recent(&self, count: usize) -> Vec<Turn> {
        let skip = self.turns.len().saturating_sub(count);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn pending(&self) -> Option<&PendingClarification> {
        self.pending.as_ref()
    }

    pub fn set_pending(&mut self, pending: PendingClarification) {
        self.pending = Some(pending);
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }
}

/// Process-lifetime cache of conversation states. Entries are created on
/// first contact and never evicted; the growth tradeoff is documented in
/// DESIGN.md.
pub struct ConversationStore {
    entries: Mutex<HashMap<ConversationKey, Arc<Mutex<ConversationState>>>>,
    retention: usize,
}

impl ConversationStore {
    pub fn new(retention: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Returns the per-key state handle, creating it on first use. The outer
    /// map lock is held only long enough to clone the handle.
    pub async fn entry(&self, key: &ConversationKey) -> Arc<Mutex<ConversationState>> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationState::new(self.retention))))
            .clone()
    }
}
