//! View state: selection, active chat, transcript and cached server lists.
//!
//! All mutation happens on the UI thread. Async results carry the generation
//! they were started under and are dropped when it is no longer current.

use crate::chat::StreamUpdate;
use crate::error::ClientError;
use crate::models::{AnswerStats, AskRequest, ChatDetail, ChatSummary, ReferenceDetail, ServerConfig, Source, StatsResponse};

pub const GREETING: &str = "Hello! I am your document assistant. Upload a document or pick a source, then ask me anything.";
pub const NEW_CHAT_GREETING: &str = "Hello! I am your document assistant. You started a new chat. I'm waiting for your question.";
pub const THINKING: &str = "Thinking...";

const FILTER_SUFFIX: &str = " (Files: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
    pub sources: Vec<String>,
    pub id: Option<String>,
    pub stats: Option<AnswerStats>,
    pub reference_details: Vec<ReferenceDetail>,
    /// Placeholder shown until the first streamed text arrives.
    pub pending: bool,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into())
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self::new(Role::Bot, text.into())
    }

    fn new(role: Role, text: String) -> Self {
        ChatMessage {
            role,
            text,
            sources: Vec::new(),
            id: None,
            stats: None,
            reference_details: Vec::new(),
            pending: false,
        }
    }
}

/// Text of a user message without the echoed source filter.
pub fn strip_filter_suffix(text: &str) -> &str {
    match text.find(FILTER_SUFFIX) {
        Some(pos) => &text[..pos],
        None => text,
    }
}

/// A question ready to be sent, tagged with its generation.
#[derive(Debug, Clone)]
pub struct AskTicket {
    pub generation: u64,
    pub request: AskRequest,
}

/// What the view should do after a stream update was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEffect {
    Stale,
    Updated,
    Settled,
    /// A new chat id was minted; refresh the history list.
    RefreshHistory,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub selected_sources: Vec<String>,
    pub current_chat_id: Option<String>,
    pub server_config: Option<ServerConfig>,
    pub sources: Vec<Source>,
    pub document_count: Option<u64>,
    pub chats: Vec<ChatSummary>,
    pub transcript: Vec<ChatMessage>,
    generation: u64,
    streaming: Option<usize>,
}

impl Default for AppState {
    fn default() -> Self {
        AppState {
            selected_sources: Vec::new(),
            current_chat_id: None,
            server_config: None,
            sources: Vec::new(),
            document_count: None,
            chats: Vec::new(),
            transcript: vec![ChatMessage::bot(GREETING)],
            generation: 0,
            streaming: None,
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.selected_sources.iter().any(|s| s == name)
    }

    /// Flip selection of a source. Returns whether it is now selected.
    pub fn toggle_source(&mut self, name: &str) -> bool {
        if let Some(idx) = self.selected_sources.iter().position(|s| s == name) {
            self.selected_sources.remove(idx);
            false
        } else {
            self.selected_sources.push(name.to_string());
            true
        }
    }

    pub fn clear_selection(&mut self) {
        self.selected_sources.clear();
    }

    pub fn apply_stats(&mut self, stats: StatsResponse) {
        if let Some(count) = stats.count {
            self.document_count = Some(count);
        }
        if let Some(sources) = stats.sources {
            self.sources = sources;
        }
    }

    pub fn source_deleted(&mut self, name: &str) {
        self.selected_sources.retain(|s| s != name);
        self.sources.retain(|s| s.name != name);
    }

    pub fn set_chats(&mut self, chats: Vec<ChatSummary>) {
        self.chats = chats;
    }

    fn invalidate_stream(&mut self) {
        self.generation += 1;
        self.streaming = None;
    }

    pub fn start_new_chat(&mut self) {
        self.invalidate_stream();
        self.current_chat_id = None;
        self.selected_sources.clear();
        self.transcript = vec![ChatMessage::bot(NEW_CHAT_GREETING)];
    }

    pub fn load_chat(&mut self, detail: ChatDetail) {
        self.invalidate_stream();
        self.current_chat_id = Some(detail.id);
        self.transcript = detail
            .messages
            .into_iter()
            .map(|m| ChatMessage {
                role: if m.role == "user" { Role::User } else { Role::Bot },
                text: m.content,
                sources: m.sources,
                id: m.id,
                stats: m.stats,
                reference_details: m.reference_details,
                pending: false,
            })
            .collect();
    }

    /// Returns true when the deleted chat was the active one.
    pub fn chat_deleted(&mut self, id: &str) -> bool {
        self.chats.retain(|c| c.id != id);
        if self.current_chat_id.as_deref() == Some(id) {
            self.start_new_chat();
            true
        } else {
            false
        }
    }

    pub fn push_notice(&mut self, text: impl Into<String>) {
        self.transcript.push(ChatMessage::bot(text));
    }

    /// Record the question and a pending answer, and build the request.
    pub fn begin_ask(&mut self, query: &str) -> Option<AskTicket> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }

        self.invalidate_stream();

        let echo = if self.selected_sources.is_empty() {
            query.to_string()
        } else {
            format!("{}{}{})", query, FILTER_SUFFIX, self.selected_sources.join(", "))
        };
        self.transcript.push(ChatMessage::user(echo));

        let mut placeholder = ChatMessage::bot(THINKING);
        placeholder.pending = true;
        self.transcript.push(placeholder);
        self.streaming = Some(self.transcript.len() - 1);

        Some(AskTicket {
            generation: self.generation,
            request: AskRequest {
                query: query.to_string(),
                sources: self.selected_sources.clone(),
                chat_id: self.current_chat_id.clone(),
            },
        })
    }

    pub fn apply_stream_update(&mut self, generation: u64, update: StreamUpdate) -> StreamEffect {
        if generation != self.generation {
            return StreamEffect::Stale;
        }
        let Some(idx) = self.streaming else {
            return StreamEffect::Stale;
        };

        match update {
            StreamUpdate::Started { reference_details } => {
                if let Some(message) = self.transcript.get_mut(idx) {
                    message.reference_details = reference_details;
                }
                StreamEffect::Updated
            }
            StreamUpdate::Text(text) => {
                if let Some(message) = self.transcript.get_mut(idx) {
                    message.text = text;
                    message.pending = false;
                }
                StreamEffect::Updated
            }
            StreamUpdate::Finalized(completion) => {
                self.streaming = None;
                if let Some(message) = self.transcript.get_mut(idx) {
                    if message.pending {
                        message.text.clear();
                        message.pending = false;
                    }
                    message.stats = completion.stats;
                    message.id = completion.message_id;
                }
                match (&self.current_chat_id, completion.chat_id) {
                    (None, Some(chat_id)) => {
                        self.current_chat_id = Some(chat_id);
                        StreamEffect::RefreshHistory
                    }
                    _ => StreamEffect::Settled,
                }
            }
            StreamUpdate::Errored(message) => {
                self.settle_with_notice(idx, message);
                StreamEffect::Settled
            }
            StreamUpdate::Aborted => {
                self.settle_with_notice(idx, ClientError::Cancelled.user_message());
                StreamEffect::Settled
            }
        }
    }

    fn settle_with_notice(&mut self, idx: usize, notice: String) {
        self.streaming = None;
        if self.transcript.get(idx).map(|m| m.pending).unwrap_or(false) {
            self.transcript.remove(idx);
        }
        self.push_notice(notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Completion;
    use crate::models::StoredMessage;

    fn source(name: &str) -> Source {
        Source { name: name.into(), is_public: false, is_owner: true }
    }

    #[test]
    fn deleting_selected_source_empties_next_filter() {
        let mut state = AppState::new();
        state.apply_stats(StatsResponse { count: Some(40), sources: Some(vec![source("a.pdf")]) });
        assert!(state.toggle_source("a.pdf"));

        state.source_deleted("a.pdf");

        let ticket = state.begin_ask("what changed?").unwrap();
        assert!(ticket.request.sources.is_empty());
        assert!(state.sources.is_empty());
    }

    #[test]
    fn ask_echoes_filter_and_carries_chat_id() {
        let mut state = AppState::new();
        state.current_chat_id = Some("12".into());
        state.toggle_source("a.pdf");
        state.toggle_source("b.pdf");

        let ticket = state.begin_ask("  summarise  ").unwrap();

        assert_eq!(ticket.request.query, "summarise");
        assert_eq!(ticket.request.sources, vec!["a.pdf", "b.pdf"]);
        assert_eq!(ticket.request.chat_id.as_deref(), Some("12"));
        let echo = &state.transcript[state.transcript.len() - 2];
        assert_eq!(echo.text, "summarise (Files: a.pdf, b.pdf)");
        assert_eq!(strip_filter_suffix(&echo.text), "summarise");
        assert!(state.transcript.last().unwrap().pending);
        assert!(state.begin_ask("   ").is_none());
    }

    #[test]
    fn toggling_twice_deselects() {
        let mut state = AppState::new();
        assert!(state.toggle_source("x"));
        assert!(!state.toggle_source("x"));
        assert!(!state.is_selected("x"));
    }

    #[test]
    fn stale_updates_are_ignored() {
        let mut state = AppState::new();
        let old = state.begin_ask("first").unwrap();
        let new = state.begin_ask("second").unwrap();

        assert_eq!(
            state.apply_stream_update(old.generation, StreamUpdate::Text("late".into())),
            StreamEffect::Stale
        );
        assert_eq!(
            state.apply_stream_update(new.generation, StreamUpdate::Text("fresh".into())),
            StreamEffect::Updated
        );
        assert!(!state.transcript.iter().any(|m| m.text == "late"));
        assert_eq!(state.transcript.last().unwrap().text, "fresh");
    }

    #[test]
    fn first_answer_captures_new_chat_id() {
        let mut state = AppState::new();
        let ticket = state.begin_ask("hello").unwrap();
        state.apply_stream_update(ticket.generation, StreamUpdate::Text("Hi".into()));

        let effect = state.apply_stream_update(
            ticket.generation,
            StreamUpdate::Finalized(Completion {
                stats: Some(AnswerStats { time: 0.4, prompt_tokens: 10, completion_tokens: 2 }),
                message_id: Some("m1".into()),
                chat_id: Some("c9".into()),
            }),
        );

        assert_eq!(effect, StreamEffect::RefreshHistory);
        assert_eq!(state.current_chat_id.as_deref(), Some("c9"));
        let answer = state.transcript.last().unwrap();
        assert_eq!(answer.id.as_deref(), Some("m1"));
        assert!(!state.is_streaming());

        // The id is only captured once.
        let ticket = state.begin_ask("again").unwrap();
        let effect = state.apply_stream_update(
            ticket.generation,
            StreamUpdate::Finalized(Completion { chat_id: Some("other".into()), ..Default::default() }),
        );
        assert_eq!(effect, StreamEffect::Settled);
        assert_eq!(state.current_chat_id.as_deref(), Some("c9"));
    }

    #[test]
    fn abort_replaces_placeholder_with_notice() {
        let mut state = AppState::new();
        let ticket = state.begin_ask("long question").unwrap();
        let before = state.transcript.len();

        state.apply_stream_update(ticket.generation, StreamUpdate::Aborted);

        assert_eq!(state.transcript.len(), before);
        assert_eq!(state.transcript.last().unwrap().text, "Stopped by user.");
        assert!(!state.is_streaming());
    }

    #[test]
    fn error_after_partial_text_keeps_the_partial_answer() {
        let mut state = AppState::new();
        let ticket = state.begin_ask("q").unwrap();
        state.apply_stream_update(ticket.generation, StreamUpdate::Text("partial".into()));
        state.apply_stream_update(ticket.generation, StreamUpdate::Errored("Error: model offline".into()));

        let n = state.transcript.len();
        assert_eq!(state.transcript[n - 2].text, "partial");
        assert_eq!(state.transcript[n - 1].text, "Error: model offline");
    }

    #[test]
    fn loading_or_deleting_chats_invalidates_streams() {
        let mut state = AppState::new();
        let ticket = state.begin_ask("q").unwrap();
        state.load_chat(ChatDetail {
            id: "7".into(),
            messages: vec![StoredMessage {
                role: "user".into(),
                content: "earlier".into(),
                sources: vec![],
                id: None,
                stats: None,
                reference_details: vec![],
            }],
        });
        assert_eq!(
            state.apply_stream_update(ticket.generation, StreamUpdate::Text("x".into())),
            StreamEffect::Stale
        );
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.transcript[0].role, Role::User);

        state.set_chats(vec![ChatSummary { id: "7".into(), title: "t".into() }]);
        assert!(state.chat_deleted("7"));
        assert!(state.current_chat_id.is_none());
        assert!(state.chats.is_empty());
        assert_eq!(state.transcript[0].text, NEW_CHAT_GREETING);
    }
}
