//! Stream decoder.
//!
//! Turns the low-level block lifecycle events of one model turn into
//! lifecycle notifications (as they happen) and a complete [`Response`].
//!
//! At most one block is open at a time. Events that do not fit the open
//! block are protocol violations; they are logged and ignored, never fatal.

use revloop_core::error::ProviderError;
use revloop_core::message::ContentBlock;
use revloop_core::provider::{Response, StopReason, Usage};
use revloop_core::stream::{BlockDelta, BlockStart, StreamEvent};
use revloop_core::tool::ToolCall;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::stream_event::{AgentStreamEvent, BlockKind};

#[derive(Debug)]
enum OpenBlock {
    Text,
    Thinking { thinking: String, signature: String },
    ToolUse { id: String, name: String, json: String },
}

/// Incremental decoder for one model turn.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    open: Option<(usize, OpenBlock)>,
    text: String,
    tool_calls: Vec<ToolCall>,
    thinking_blocks: Vec<ContentBlock>,
    usage: Usage,
    transport_stop: Option<String>,
    done: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the terminal `Done` notification has been produced.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume one event, returning the notifications it produces.
    pub fn feed(&mut self, event: StreamEvent) -> Vec<AgentStreamEvent> {
        let mut out = Vec::new();
        if self.done {
            trace!("Ignoring event after message stop");
            return out;
        }

        match event {
            StreamEvent::MessageStart { message } => self.usage.merge(&message.usage),
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => self.start_block(index, content_block, &mut out),
            StreamEvent::ContentBlockDelta { index, delta } => self.apply_delta(index, delta),
            StreamEvent::ContentBlockStop { index } => {
                if self.open.as_ref().is_some_and(|(open_index, _)| *open_index == index) {
                    self.close_block(&mut out);
                } else {
                    trace!(index, "Ignoring stop for a block that is not open");
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                self.usage.merge(&usage);
                if delta.stop_reason.is_some() {
                    self.transport_stop = delta.stop_reason;
                }
            }
            StreamEvent::MessageStop => out.extend(self.finish()),
            StreamEvent::Ping | StreamEvent::Error { .. } => {}
        }

        out
    }

    /// Whether a tool-use block has started but not stopped.
    pub fn has_open_tool_call(&self) -> bool {
        matches!(self.open, Some((_, OpenBlock::ToolUse { .. })))
    }

    /// Flush any open text or thinking block and produce the closing
    /// `Usage` and `Done` notifications. Called on message stop, or when the
    /// stream ends early. A tool-use block that never stopped is dropped:
    /// its input is incomplete.
    pub fn finish(&mut self) -> Vec<AgentStreamEvent> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        match self.open.take() {
            Some((index, OpenBlock::ToolUse { id, name, .. })) => {
                warn!(index, id = %id, tool = %name, "Dropping tool call left open at end of turn");
            }
            Some(open) => {
                debug!("Flushing block left open at end of turn");
                self.open = Some(open);
                self.close_block(&mut out);
            }
            None => {}
        }
        out.push(AgentStreamEvent::Usage { usage: self.usage });
        out.push(AgentStreamEvent::Done);
        self.done = true;
        out
    }

    /// The aggregated turn.
    ///
    /// The stop reason is derived from the calls decoded, not taken from the
    /// transport.
    pub fn into_response(self) -> Response {
        let stop_reason = if self.tool_calls.is_empty() {
            StopReason::EndTurn
        } else {
            StopReason::ToolUse
        };
        if let Some(reported) = &self.transport_stop {
            debug!(reported = %reported, derived = stop_reason.as_wire(), "Turn stop reason");
        }
        Response {
            text: self.text,
            tool_calls: self.tool_calls,
            stop_reason,
            usage: self.usage,
            thinking_blocks: self.thinking_blocks,
        }
    }

    fn start_block(&mut self, index: usize, block: BlockStart, out: &mut Vec<AgentStreamEvent>) {
        if let Some((open_index, _)) = &self.open {
            warn!(open_index, index, "Block started while another is open, closing it");
            self.close_block(out);
        }

        match block {
            BlockStart::Text { text } => {
                self.text.push_str(&text);
                self.open = Some((index, OpenBlock::Text));
                out.push(AgentStreamEvent::BlockStarted {
                    kind: BlockKind::Text,
                });
            }
            BlockStart::Thinking { thinking } => {
                self.open = Some((
                    index,
                    OpenBlock::Thinking {
                        thinking,
                        signature: String::new(),
                    },
                ));
                out.push(AgentStreamEvent::BlockStarted {
                    kind: BlockKind::Thinking,
                });
            }
            BlockStart::ToolUse { id, name } => {
                out.push(AgentStreamEvent::ToolStarted {
                    id: id.clone(),
                    name: name.clone(),
                });
                self.open = Some((
                    index,
                    OpenBlock::ToolUse {
                        id,
                        name,
                        json: String::new(),
                    },
                ));
            }
            BlockStart::RedactedThinking { data } => {
                self.thinking_blocks
                    .push(ContentBlock::RedactedThinking { data: data.clone() });
                out.push(AgentStreamEvent::RedactedThinking { data });
            }
        }
    }

    fn apply_delta(&mut self, index: usize, delta: BlockDelta) {
        let Some((open_index, block)) = &mut self.open else {
            trace!(index, "Ignoring delta with no open block");
            return;
        };
        if *open_index != index {
            trace!(index, open_index = *open_index, "Ignoring delta for a block that is not open");
            return;
        }

        match (block, delta) {
            (OpenBlock::Text, BlockDelta::TextDelta { text }) => self.text.push_str(&text),
            (OpenBlock::Thinking { thinking, .. }, BlockDelta::ThinkingDelta { thinking: more }) => {
                thinking.push_str(&more);
            }
            (OpenBlock::Thinking { signature, .. }, BlockDelta::SignatureDelta { signature: more }) => {
                signature.push_str(&more);
            }
            (OpenBlock::ToolUse { json, .. }, BlockDelta::InputJsonDelta { partial_json }) => {
                json.push_str(&partial_json);
            }
            (_, delta) => trace!(index, ?delta, "Ignoring delta that does not match the open block"),
        }
    }

    fn close_block(&mut self, out: &mut Vec<AgentStreamEvent>) {
        let Some((_, block)) = self.open.take() else {
            return;
        };

        match block {
            OpenBlock::Text => out.push(AgentStreamEvent::TextCompleted {
                text: self.text.clone(),
            }),
            OpenBlock::Thinking {
                thinking,
                signature,
            } => {
                self.thinking_blocks.push(ContentBlock::Thinking {
                    thinking: thinking.clone(),
                    signature: signature.clone(),
                });
                out.push(AgentStreamEvent::ThinkingCompleted {
                    thinking,
                    signature,
                });
            }
            OpenBlock::ToolUse { id, name, json } => {
                let call = ToolCall {
                    input: parse_tool_input(&name, &json),
                    id,
                    name,
                };
                self.tool_calls.push(call.clone());
                out.push(AgentStreamEvent::ToolCompleted { call });
            }
        }
    }
}

/// Parse accumulated tool input. Anything that is not a JSON object
/// becomes `{}`.
fn parse_tool_input(tool: &str, json: &str) -> serde_json::Value {
    if json.trim().is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str::<serde_json::Value>(json) {
        Ok(value) if value.is_object() => value,
        Ok(_) => {
            warn!(tool, "Tool input is not a JSON object, using empty input");
            serde_json::json!({})
        }
        Err(e) => {
            warn!(tool, error = %e, "Malformed tool input JSON, using empty input");
            serde_json::json!({})
        }
    }
}

/// Drive a decoder over a transport stream, forwarding notifications to
/// `events` as they are produced.
///
/// A transport error (or an `error` event) aborts the turn, and so does a
/// stream that ends in the middle of a tool call. Any other stream that ends
/// without a message stop is finished as if it had one.
pub async fn decode(
    mut stream: mpsc::Receiver<Result<StreamEvent, ProviderError>>,
    events: Option<&mpsc::UnboundedSender<AgentStreamEvent>>,
) -> Result<Response, ProviderError> {
    let mut decoder = StreamDecoder::new();
    let forward = |batch: Vec<AgentStreamEvent>| {
        if let Some(tx) = events {
            for event in batch {
                let _ = tx.send(event);
            }
        }
    };

    while let Some(item) = stream.recv().await {
        let event = item?;
        if let StreamEvent::Error { error } = &event {
            return Err(ProviderError::StreamInterrupted(format!(
                "{}: {}",
                error.kind, error.message
            )));
        }
        forward(decoder.feed(event));
        if decoder.is_done() {
            break;
        }
    }

    if !decoder.is_done() {
        if decoder.has_open_tool_call() {
            return Err(ProviderError::StreamInterrupted(
                "stream ended inside a tool_use block".into(),
            ));
        }
        warn!("Stream ended without message stop");
        forward(decoder.finish());
    }

    Ok(decoder.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use revloop_core::stream::{MessageDeltaBody, MessageStart, StreamError};

    fn start(index: usize, content_block: BlockStart) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            content_block,
        }
    }

    fn delta(index: usize, delta: BlockDelta) -> StreamEvent {
        StreamEvent::ContentBlockDelta { index, delta }
    }

    fn text_delta(index: usize, text: &str) -> StreamEvent {
        delta(index, BlockDelta::TextDelta { text: text.into() })
    }

    fn json_delta(index: usize, json: &str) -> StreamEvent {
        delta(
            index,
            BlockDelta::InputJsonDelta {
                partial_json: json.into(),
            },
        )
    }

    fn tool_start(index: usize, id: &str, name: &str) -> StreamEvent {
        start(
            index,
            BlockStart::ToolUse {
                id: id.into(),
                name: name.into(),
            },
        )
    }

    fn run(events: Vec<StreamEvent>) -> (Vec<AgentStreamEvent>, Response) {
        let mut decoder = StreamDecoder::new();
        let mut out = Vec::new();
        for event in events {
            out.extend(decoder.feed(event));
        }
        out.extend(decoder.finish());
        (out, decoder.into_response())
    }

    #[test]
    fn single_text_block_ends_turn() {
        let (events, response) = run(vec![
            start(0, BlockStart::Text { text: String::new() }),
            text_delta(0, "Hello"),
            text_delta(0, ", world"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some("end_turn".into()),
                },
                usage: Usage::default(),
            },
            StreamEvent::MessageStop,
        ]);

        assert_eq!(response.text, "Hello, world");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert!(response.tool_calls.is_empty());
        assert_eq!(
            events,
            vec![
                AgentStreamEvent::BlockStarted {
                    kind: BlockKind::Text
                },
                AgentStreamEvent::TextCompleted {
                    text: "Hello, world".into()
                },
                AgentStreamEvent::Usage {
                    usage: Usage::default()
                },
                AgentStreamEvent::Done,
            ]
        );
    }

    #[test]
    fn tool_input_assembled_from_fragments() {
        let (events, response) = run(vec![
            tool_start(0, "toolu_1", "decompile"),
            json_delta(0, "{\"a\""),
            json_delta(0, ":1}"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]);

        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].input, serde_json::json!({"a": 1}));
        assert_eq!(
            events[0],
            AgentStreamEvent::ToolStarted {
                id: "toolu_1".into(),
                name: "decompile".into()
            }
        );
        assert!(matches!(&events[1], AgentStreamEvent::ToolCompleted { call } if call.id == "toolu_1"));
    }

    #[test]
    fn malformed_tool_input_becomes_empty_object() {
        let (_, response) = run(vec![
            tool_start(0, "toolu_1", "rename"),
            json_delta(0, "{\"name\": \"ma"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]);
        assert_eq!(response.tool_calls[0].input, serde_json::json!({}));
        assert_eq!(response.stop_reason, StopReason::ToolUse);
    }

    #[test]
    fn missing_or_non_object_input_becomes_empty_object() {
        let (_, response) = run(vec![
            tool_start(0, "toolu_1", "get_cursor"),
            StreamEvent::ContentBlockStop { index: 0 },
            tool_start(1, "toolu_2", "get_cursor"),
            json_delta(1, "[1,2]"),
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::MessageStop,
        ]);
        assert_eq!(response.tool_calls[0].input, serde_json::json!({}));
        assert_eq!(response.tool_calls[1].input, serde_json::json!({}));
    }

    #[test]
    fn thinking_signature_and_redacted_blocks_preserved() {
        let (events, response) = run(vec![
            start(0, BlockStart::Thinking { thinking: String::new() }),
            delta(0, BlockDelta::ThinkingDelta { thinking: "Check ".into() }),
            delta(0, BlockDelta::ThinkingDelta { thinking: "xrefs".into() }),
            delta(0, BlockDelta::SignatureDelta { signature: "EqQB".into() }),
            StreamEvent::ContentBlockStop { index: 0 },
            start(1, BlockStart::RedactedThinking { data: "EmwK".into() }),
            StreamEvent::ContentBlockStop { index: 1 },
            tool_start(2, "toolu_1", "xrefs_to"),
            json_delta(2, "{}"),
            StreamEvent::ContentBlockStop { index: 2 },
            StreamEvent::MessageStop,
        ]);

        assert_eq!(
            response.thinking_blocks,
            vec![
                ContentBlock::Thinking {
                    thinking: "Check xrefs".into(),
                    signature: "EqQB".into(),
                },
                ContentBlock::RedactedThinking { data: "EmwK".into() },
            ]
        );
        assert_eq!(
            events[1],
            AgentStreamEvent::ThinkingCompleted {
                thinking: "Check xrefs".into(),
                signature: "EqQB".into()
            }
        );
        assert_eq!(events[2], AgentStreamEvent::RedactedThinking { data: "EmwK".into() });
    }

    #[test]
    fn unclosed_thinking_is_flushed_before_next_tool() {
        let (events, response) = run(vec![
            start(0, BlockStart::Thinking { thinking: String::new() }),
            delta(0, BlockDelta::ThinkingDelta { thinking: "hmm".into() }),
            tool_start(1, "toolu_1", "decompile"),
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::MessageStop,
        ]);

        let thinking_at = events
            .iter()
            .position(|e| matches!(e, AgentStreamEvent::ThinkingCompleted { .. }))
            .unwrap();
        let tool_at = events
            .iter()
            .position(|e| matches!(e, AgentStreamEvent::ToolCompleted { .. }))
            .unwrap();
        assert!(thinking_at < tool_at);
        assert_eq!(response.thinking_blocks.len(), 1);
    }

    #[test]
    fn truncated_turn_flushes_open_block_before_done() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(start(0, BlockStart::Thinking { thinking: "partial".into() }));
        let tail = decoder.finish();
        assert!(matches!(tail[0], AgentStreamEvent::ThinkingCompleted { .. }));
        assert_eq!(tail.last(), Some(&AgentStreamEvent::Done));
        assert!(decoder.finish().is_empty());
        assert_eq!(decoder.into_response().thinking_blocks.len(), 1);
    }

    #[test]
    fn text_completed_is_cumulative_across_blocks() {
        let (events, response) = run(vec![
            start(0, BlockStart::Text { text: String::new() }),
            text_delta(0, "First. "),
            StreamEvent::ContentBlockStop { index: 0 },
            start(1, BlockStart::Text { text: String::new() }),
            text_delta(1, "Second."),
            StreamEvent::ContentBlockStop { index: 1 },
            StreamEvent::MessageStop,
        ]);
        let completed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentStreamEvent::TextCompleted { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec!["First. ", "First. Second."]);
        assert_eq!(response.text, "First. Second.");
    }

    #[test]
    fn stray_events_are_ignored() {
        let (events, response) = run(vec![
            text_delta(0, "orphan"),
            StreamEvent::ContentBlockStop { index: 4 },
            start(0, BlockStart::Text { text: String::new() }),
            json_delta(0, "{\"x\":1}"),
            text_delta(7, "wrong index"),
            text_delta(0, "ok"),
            delta(0, BlockDelta::Unsupported),
            StreamEvent::Ping,
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ]);
        assert_eq!(response.text, "ok");
        assert!(response.tool_calls.is_empty());
        assert_eq!(events.last(), Some(&AgentStreamEvent::Done));
    }

    #[test]
    fn stop_reason_is_derived_not_reported() {
        let (_, response) = run(vec![
            start(0, BlockStart::Text { text: String::new() }),
            text_delta(0, "done"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some("tool_use".into()),
                },
                usage: Usage::default(),
            },
            StreamEvent::MessageStop,
        ]);
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[test]
    fn usage_merged_from_start_and_delta() {
        let (events, response) = run(vec![
            StreamEvent::MessageStart {
                message: MessageStart {
                    usage: Usage {
                        input_tokens: 120,
                        output_tokens: 1,
                        cache_write_tokens: 0,
                        cache_read_tokens: 3000,
                    },
                },
            },
            StreamEvent::MessageDelta {
                delta: MessageDeltaBody::default(),
                usage: Usage {
                    output_tokens: 42,
                    ..Usage::default()
                },
            },
            StreamEvent::MessageStop,
        ]);
        let expected = Usage {
            input_tokens: 120,
            output_tokens: 42,
            cache_write_tokens: 0,
            cache_read_tokens: 3000,
        };
        assert_eq!(response.usage, expected);
        assert_eq!(events[0], AgentStreamEvent::Usage { usage: expected });
    }

    #[tokio::test]
    async fn decode_forwards_events_and_aggregates() {
        let (tx, rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        for event in [
            start(0, BlockStart::Text { text: String::new() }),
            text_delta(0, "hi"),
            StreamEvent::ContentBlockStop { index: 0 },
            StreamEvent::MessageStop,
        ] {
            tx.send(Ok(event)).await.unwrap();
        }
        drop(tx);

        let response = decode(rx, Some(&events_tx)).await.unwrap();
        assert_eq!(response.text, "hi");

        let mut seen = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            seen.push(event.event_type());
        }
        assert_eq!(seen, vec!["block_started", "text_completed", "usage", "done"]);
    }

    #[tokio::test]
    async fn decode_finishes_stream_without_stop() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(tool_start(0, "toolu_1", "decompile"))).await.unwrap();
        tx.send(Ok(json_delta(0, "{\"ea\":\"0x1\"}"))).await.unwrap();
        tx.send(Ok(StreamEvent::ContentBlockStop { index: 0 })).await.unwrap();
        drop(tx);

        let response = decode(rx, None).await.unwrap();
        assert_eq!(response.tool_calls[0].input["ea"], "0x1");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
    }

    #[tokio::test]
    async fn decode_rejects_stream_cut_inside_tool_call() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(tool_start(0, "toolu_1", "rename"))).await.unwrap();
        tx.send(Ok(json_delta(0, "{\"ea\":\"0x10\",\"na"))).await.unwrap();
        drop(tx);

        let err = decode(rx, None).await.unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));
    }

    #[test]
    fn finish_drops_unterminated_tool_call() {
        let mut decoder = StreamDecoder::new();
        decoder.feed(start(0, BlockStart::Text { text: String::new() }));
        decoder.feed(text_delta(0, "Renaming."));
        decoder.feed(StreamEvent::ContentBlockStop { index: 0 });
        decoder.feed(tool_start(1, "toolu_1", "rename"));
        decoder.feed(json_delta(1, "{\"ea\":\"0x10\",\"na"));
        assert!(decoder.has_open_tool_call());

        let tail = decoder.finish();
        assert!(!tail.iter().any(|e| matches!(e, AgentStreamEvent::ToolCompleted { .. })));
        assert_eq!(tail.last(), Some(&AgentStreamEvent::Done));

        let response = decoder.into_response();
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.text, "Renaming.");
    }

    #[tokio::test]
    async fn decode_propagates_transport_errors() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(start(0, BlockStart::Text { text: String::new() }))).await.unwrap();
        tx.send(Err(ProviderError::StreamInterrupted("connection reset".into())))
            .await
            .unwrap();
        drop(tx);
        let err = decode(rx, None).await.unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(_)));

        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(StreamEvent::Error {
            error: StreamError {
                kind: "overloaded_error".into(),
                message: "Overloaded".into(),
            },
        }))
        .await
        .unwrap();
        drop(tx);
        let err = decode(rx, None).await.unwrap_err();
        assert!(err.to_string().contains("overloaded_error"));
    }
}
