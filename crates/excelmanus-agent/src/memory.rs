//! Conversation memory with token-budget trimming.

use excelmanus::chat::{ChatMessage, ChatRole};

/// Rough token estimate: four characters per token. The budget check
/// only needs to be directionally right; providers enforce the hard
/// limit themselves.
pub fn approximate_token_count(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| m.content.len() / 4 + 4).sum()
}

/// Message history for one session.
///
/// On budget overflow the oldest non-system messages are dropped first;
/// the system prompt and the most recent exchange always survive.
pub struct ConversationMemory {
    messages: Vec<ChatMessage>,
    token_budget: usize,
}

impl ConversationMemory {
    pub fn new(token_budget: usize) -> Self {
        Self {
            messages: Vec::new(),
            token_budget,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.trim_to_budget();
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Replace the leading system message (or insert one).
    pub fn set_system_prompt(&mut self, content: String) {
        match self.messages.first_mut() {
            Some(first) if first.role == ChatRole::System => {
                first.content = content;
            }
            _ => self.messages.insert(0, ChatMessage::system(content)),
        }
    }

    pub fn token_estimate(&self) -> usize {
        approximate_token_count(&self.messages)
    }

    fn trim_to_budget(&mut self) {
        const KEEP_TAIL: usize = 4;
        while self.token_estimate() > self.token_budget && self.messages.len() > KEEP_TAIL + 1 {
            // index 0 is the system prompt when present
            let drop_idx = if self
                .messages
                .first()
                .map(|m| m.role == ChatRole::System)
                .unwrap_or(false)
            {
                1
            } else {
                0
            };
            if drop_idx >= self.messages.len().saturating_sub(KEEP_TAIL) {
                break;
            }
            let dropped = self.messages.remove(drop_idx);
            log::debug!(
                "memory trim: dropped {:?} message ({} chars)",
                dropped.role,
                dropped.content.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_count_is_roughly_chars_over_four() {
        let messages = vec![ChatMessage::user("x".repeat(400))];
        let count = approximate_token_count(&messages);
        assert!(count >= 100 && count <= 110);
    }

    #[test]
    fn set_system_prompt_replaces_existing() {
        let mut memory = ConversationMemory::new(10_000);
        memory.set_system_prompt("v1".to_string());
        memory.push(ChatMessage::user("hello"));
        memory.set_system_prompt("v2".to_string());
        assert_eq!(memory.messages()[0].content, "v2");
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn trim_drops_oldest_non_system_first() {
        let mut memory = ConversationMemory::new(100);
        memory.set_system_prompt("system".to_string());
        for i in 0..20 {
            memory.push(ChatMessage::user(format!("message {} {}", i, "pad".repeat(20))));
        }
        // system prompt survives
        assert_eq!(memory.messages()[0].role, ChatRole::System);
        // the most recent messages survive
        let last = memory.messages().last().unwrap();
        assert!(last.content.starts_with("message 19"));
        assert!(memory.len() < 21);
    }

    #[test]
    fn small_histories_are_never_trimmed() {
        let mut memory = ConversationMemory::new(1);
        memory.push(ChatMessage::user("a"));
        memory.push(ChatMessage::assistant("b"));
        assert_eq!(memory.len(), 2);
    }
}
