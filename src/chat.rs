//! Streaming `/ask` consumer.
//!
//! The response body is a sequence of `data: {json}` lines. [`FrameDecoder`]
//! turns raw chunks into [`Frame`]s, [`StreamSession`] applies them as pure
//! state transitions, and [`consume`] drives both while honouring a
//! cancellation token.

use std::fmt::Display;

use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::error::ClientError;
use crate::models::{AnswerStats, AskRequest, ReferenceDetail};

const FRAME_MARKER: &str = "data: ";

pub const CLOSED_EARLY: &str = "The connection closed before the answer completed.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Metadata {
        #[serde(default)]
        ref_prefix: String,
        #[serde(default)]
        reference_details: Vec<ReferenceDetail>,
    },
    Content {
        #[serde(default)]
        text: String,
    },
    Final {
        #[serde(default)]
        stats: Option<AnswerStats>,
        #[serde(default)]
        message_id: Option<serde_json::Value>,
        #[serde(default)]
        chat_id: Option<serde_json::Value>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Parse a single line. `None` for lines that carry no frame.
pub fn parse_line(line: &str) -> Option<Frame> {
    let line = line.trim_end_matches('\r');
    let payload = line.strip_prefix(FRAME_MARKER)?.trim();
    if payload.is_empty() {
        return None;
    }

    match serde_json::from_str::<Frame>(payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(error = %e, payload = %payload, "skipping malformed stream frame");
            None
        }
    }
}

/// Splits a chunked byte stream into frames on `\n`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every frame completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingMetadata,
    Streaming,
    Finalized,
    Aborted,
    Errored,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Finalized | StreamState::Aborted | StreamState::Errored)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetadata {
    pub ref_prefix: String,
    pub reference_details: Vec<ReferenceDetail>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub stats: Option<AnswerStats>,
    pub message_id: Option<String>,
    pub chat_id: Option<String>,
}

/// Result of applying one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Started,
    TextChanged,
    Finalized,
    Errored,
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    state: StreamState,
    accumulated: String,
    metadata: Option<StreamMetadata>,
    completion: Option<Completion>,
    error: Option<String>,
}

impl Default for StreamSession {
    fn default() -> Self {
        StreamSession {
            state: StreamState::AwaitingMetadata,
            accumulated: String::new(),
            metadata: None,
            completion: None,
            error: None,
        }
    }
}

impl StreamSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn metadata(&self) -> Option<&StreamMetadata> {
        self.metadata.as_ref()
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn reference_details(&self) -> &[ReferenceDetail] {
        self.metadata
            .as_ref()
            .map(|m| m.reference_details.as_slice())
            .unwrap_or(&[])
    }

    pub fn apply(&mut self, frame: Frame) -> Applied {
        if self.state.is_terminal() {
            return Applied::Ignored;
        }

        match frame {
            Frame::Metadata { ref_prefix, reference_details } => {
                if self.state != StreamState::AwaitingMetadata {
                    tracing::warn!("ignoring repeated metadata frame");
                    return Applied::Ignored;
                }
                self.accumulated = ref_prefix.clone();
                self.metadata = Some(StreamMetadata { ref_prefix, reference_details });
                self.state = StreamState::Streaming;
                Applied::Started
            }
            Frame::Content { text } => {
                if self.state == StreamState::AwaitingMetadata {
                    self.metadata = Some(StreamMetadata::default());
                    self.state = StreamState::Streaming;
                }
                self.accumulated.push_str(&text);
                Applied::TextChanged
            }
            Frame::Final { stats, message_id, chat_id } => {
                self.completion = Some(Completion {
                    stats,
                    message_id: message_id.and_then(value_to_id),
                    chat_id: chat_id.and_then(value_to_id),
                });
                self.state = StreamState::Finalized;
                Applied::Finalized
            }
            Frame::Error { message } => {
                self.error = Some(message);
                self.state = StreamState::Errored;
                Applied::Errored
            }
        }
    }

    /// User cancellation. No-op once terminal.
    pub fn abort(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = StreamState::Aborted;
        true
    }

    /// Transport failure or a body that ended without a terminal frame.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.error = Some(message.into());
        self.state = StreamState::Errored;
        true
    }
}

fn value_to_id(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// What the view receives while a stream is consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Started { reference_details: Vec<ReferenceDetail> },
    Text(String),
    Finalized(Completion),
    Errored(String),
    Aborted,
}

/// Drain `body` into `session`, reporting every change through `on_update`.
///
/// The token is checked before each frame, so nothing is applied after an
/// abort even when the same chunk carried more frames.
pub async fn consume<S, B, E, F>(
    body: S,
    session: &mut StreamSession,
    cancel: &CancellationToken,
    mut on_update: F,
) where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(StreamUpdate),
{
    let mut body = std::pin::pin!(body);
    let mut decoder = FrameDecoder::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                abort(session, &mut on_update);
                return;
            }
            next = body.next() => next,
        };

        let (frames, finished) = match next {
            Some(Ok(chunk)) => (decoder.push(chunk.as_ref()), false),
            Some(Err(e)) => {
                tracing::error!(error = %e, "answer stream failed");
                if session.fail(e.to_string()) {
                    on_update(StreamUpdate::Errored(CLOSED_EARLY.to_string()));
                }
                return;
            }
            None => (decoder.finish().into_iter().collect(), true),
        };

        for frame in frames {
            if cancel.is_cancelled() {
                abort(session, &mut on_update);
                return;
            }
            tracing::debug!(?frame, "stream frame");
            apply_and_report(session, frame, &mut on_update);
            if session.state().is_terminal() {
                return;
            }
        }

        if finished {
            break;
        }
    }

    if session.fail(CLOSED_EARLY) {
        on_update(StreamUpdate::Errored(CLOSED_EARLY.to_string()));
    }
}

/// Send `request` to `/ask` and consume the answer. Never returns an error:
/// failures end up as an `Errored` session and an `Errored` update.
pub async fn ask<F>(
    api: &ApiClient,
    request: &AskRequest,
    cancel: &CancellationToken,
    mut on_update: F,
) -> StreamSession
where
    F: FnMut(StreamUpdate),
{
    let mut session = StreamSession::new();
    tracing::info!(sources = request.sources.len(), chat_id = ?request.chat_id, "asking");

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            abort(&mut session, &mut on_update);
            return session;
        }
        response = api.ask(request) => response,
    };

    match response {
        Ok(body) => consume(body, &mut session, cancel, on_update).await,
        Err(err) => {
            tracing::error!(error = %err, "ask request failed");
            let message = err.user_message();
            if session.fail(err.to_string()) {
                on_update(StreamUpdate::Errored(message));
            }
        }
    }

    session
}

fn abort<F: FnMut(StreamUpdate)>(session: &mut StreamSession, on_update: &mut F) {
    if session.abort() {
        tracing::info!("answer stream stopped by user");
        on_update(StreamUpdate::Aborted);
    }
}

fn apply_and_report<F: FnMut(StreamUpdate)>(
    session: &mut StreamSession,
    frame: Frame,
    on_update: &mut F,
) {
    match session.apply(frame) {
        Applied::Started => {
            on_update(StreamUpdate::Started {
                reference_details: session.reference_details().to_vec(),
            });
            on_update(StreamUpdate::Text(session.text().to_string()));
        }
        Applied::TextChanged => on_update(StreamUpdate::Text(session.text().to_string())),
        Applied::Finalized => {
            let completion = session.completion().cloned().unwrap_or_default();
            tracing::info!(message_id = ?completion.message_id, "answer finished");
            on_update(StreamUpdate::Finalized(completion));
        }
        Applied::Errored => {
            let message = session.error().unwrap_or_default().to_string();
            on_update(StreamUpdate::Errored(ClientError::Application(message).user_message()));
        }
        Applied::Ignored => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
        let owned: Vec<Result<Vec<u8>, std::io::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures_util::stream::iter(owned)
    }

    fn content(text: &str) -> String {
        format!("data: {}\n", serde_json::json!({ "type": "content", "text": text }))
    }

    const METADATA: &str = "data: {\"type\": \"metadata\", \"ref_prefix\": \"\", \"reference_details\": []}\n";
    const FINAL: &str = "data: {\"type\": \"final\", \"stats\": {\"time\": 1.2, \"prompt_tokens\": 300, \"completion_tokens\": 42}, \"message_id\": 91, \"chat_id\": \"c-17\"}\n";

    #[test]
    fn lines_without_marker_or_payload_are_ignored() {
        assert_eq!(parse_line(": keep-alive"), None);
        assert_eq!(parse_line("data: "), None);
        assert_eq!(parse_line("data:    \r"), None);
        assert_eq!(parse_line("data: {not json"), None);
        assert_eq!(
            parse_line("data: {\"type\":\"content\",\"text\":\"x\"}\r"),
            Some(Frame::Content { text: "x".into() })
        );
    }

    #[test]
    fn decoder_buffers_frames_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"con").is_empty());
        let frames = decoder.push(b"tent\",\"text\":\"Hi\"}\ndata: {\"type\":\"content\",");
        assert_eq!(frames, vec![Frame::Content { text: "Hi".into() }]);
        assert!(decoder.push(b"\"text\":\" there\"}").is_empty());
        assert_eq!(decoder.finish(), Some(Frame::Content { text: " there".into() }));
    }

    #[test]
    fn decoder_keeps_multibyte_characters_split_between_chunks() {
        let line = content("Düşünce");
        let bytes = line.as_bytes();
        let split = line.find('ü').unwrap() + 1;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        assert_eq!(decoder.push(&bytes[split..]), vec![Frame::Content { text: "Düşünce".into() }]);
    }

    #[test]
    fn content_before_metadata_synthesises_an_empty_prefix() {
        let mut session = StreamSession::new();
        assert_eq!(session.apply(Frame::Content { text: "Hi".into() }), Applied::TextChanged);
        assert_eq!(session.state(), StreamState::Streaming);
        assert_eq!(session.metadata(), Some(&StreamMetadata::default()));
        assert_eq!(session.text(), "Hi");
    }

    #[test]
    fn metadata_prefix_starts_the_text_and_repeats_are_ignored() {
        let mut session = StreamSession::new();
        session.apply(Frame::Metadata {
            ref_prefix: "[1] ".into(),
            reference_details: vec![ReferenceDetail { source: "a.pdf".into(), content: "x".into() }],
        });
        assert_eq!(
            session.apply(Frame::Metadata { ref_prefix: "again".into(), reference_details: vec![] }),
            Applied::Ignored
        );
        session.apply(Frame::Content { text: "answer".into() });
        assert_eq!(session.text(), "[1] answer");
        assert_eq!(session.reference_details().len(), 1);
    }

    #[test]
    fn terminal_sessions_ignore_further_frames() {
        let mut session = StreamSession::new();
        session.apply(Frame::Error { message: "model offline".into() });
        assert_eq!(session.state(), StreamState::Errored);
        assert_eq!(session.apply(Frame::Content { text: "late".into() }), Applied::Ignored);
        assert!(!session.abort());
        assert_eq!(session.text(), "");
    }

    #[tokio::test]
    async fn content_frames_accumulate_exactly_once() {
        let body = chunks(&[METADATA, &content("Hello "), &content("wor"), &content("ld"), FINAL]);
        let mut session = StreamSession::new();
        let mut texts = Vec::new();

        consume(body, &mut session, &CancellationToken::new(), |update| {
            if let StreamUpdate::Text(text) = update {
                texts.push(text);
            }
        })
        .await;

        assert_eq!(session.state(), StreamState::Finalized);
        assert_eq!(session.text(), "Hello world");
        assert_eq!(texts.last().map(String::as_str), Some("Hello world"));
        let completion = session.completion().unwrap();
        assert_eq!(completion.message_id.as_deref(), Some("91"));
        assert_eq!(completion.chat_id.as_deref(), Some("c-17"));
        assert_eq!(completion.stats.as_ref().map(|s| s.completion_tokens), Some(42));
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let body = chunks(&[METADATA, &content("one "), "data: {\"type\": \"content\", \"text\": \n", &content("two"), FINAL]);
        let mut session = StreamSession::new();

        consume(body, &mut session, &CancellationToken::new(), |_| {}).await;

        assert_eq!(session.state(), StreamState::Finalized);
        assert_eq!(session.text(), "one two");
    }

    #[tokio::test]
    async fn abort_after_two_frames_stops_applying() {
        let parts: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|t| content(t)).collect();
        let mut all = vec![METADATA.to_string()];
        all.extend(parts);
        all.push(FINAL.to_string());
        let refs: Vec<&str> = all.iter().map(String::as_str).collect();

        let cancel = CancellationToken::new();
        let mut session = StreamSession::new();
        let mut updates = Vec::new();
        let token = cancel.clone();

        consume(chunks(&refs), &mut session, &cancel, |update| {
            if update == StreamUpdate::Text("ab".to_string()) {
                token.cancel();
            }
            updates.push(update);
        })
        .await;

        assert_eq!(session.state(), StreamState::Aborted);
        assert_eq!(session.text(), "ab");
        assert_eq!(updates.last(), Some(&StreamUpdate::Aborted));
        assert!(!updates.iter().any(|u| matches!(u, StreamUpdate::Finalized(_))));
    }

    #[tokio::test]
    async fn abort_within_a_single_chunk_drops_the_rest() {
        let mut body = METADATA.to_string();
        for t in ["a", "b", "c", "d", "e"] {
            body.push_str(&content(t));
        }
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut session = StreamSession::new();
        let mut seen = 0;

        consume(chunks(&[&body]), &mut session, &cancel, |update| {
            if let StreamUpdate::Text(_) = update {
                seen += 1;
                if seen == 3 {
                    token.cancel();
                }
            }
        })
        .await;

        // The metadata frame reports the (empty) prefix as text first.
        assert_eq!(session.text(), "ab");
        assert_eq!(session.state(), StreamState::Aborted);
    }

    #[tokio::test]
    async fn error_frame_is_rendered_not_thrown() {
        let body = chunks(&[METADATA, &content("partial"), "data: {\"type\": \"error\", \"message\": \"model offline\"}\n"]);
        let mut session = StreamSession::new();
        let mut last = None;

        consume(body, &mut session, &CancellationToken::new(), |update| last = Some(update)).await;

        assert_eq!(session.state(), StreamState::Errored);
        assert_eq!(last, Some(StreamUpdate::Errored("Error: model offline".to_string())));
    }

    #[tokio::test]
    async fn body_ending_without_final_is_an_error() {
        let body = chunks(&[METADATA, &content("cut off")]);
        let mut session = StreamSession::new();
        let mut last = None;

        consume(body, &mut session, &CancellationToken::new(), |update| last = Some(update)).await;

        assert_eq!(session.state(), StreamState::Errored);
        assert_eq!(last, Some(StreamUpdate::Errored(CLOSED_EARLY.to_string())));
        assert_eq!(session.text(), "cut off");
    }
}
