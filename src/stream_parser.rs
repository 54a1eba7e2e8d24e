//! Stream Protocol Parser
//!
//! Splits a raw model token stream into visible text, thinking text and
//! embedded tool-call payloads. Sentinel tags may arrive split across any
//! number of chunks; a trailing fragment that could still grow into a tag is
//! held back until the next chunk decides it.
//!
//! ## Supported Formats
//! - `<think>`, `<thinking>`, `<seed:think>`, `[THINK]` (and their closers)
//! - `<tool_call>{json}</tool_call>` for tool requests
//!
//! A tool call may also appear inside a thinking segment; the parser returns
//! to thinking once the tool call closes.

use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{StreamErrorKind, StreamEvent};

pub const THINK_OPEN_TAGS: &[&str] = &["<think>", "<thinking>", "<seed:think>", "[THINK]"];
pub const THINK_CLOSE_TAGS: &[&str] = &["</think>", "</thinking>", "</seed:think>", "[/THINK]"];
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Tool-call bodies above this size are dropped.
pub const MAX_TOOL_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    /// Visible text, tool-call tags are not recognized
    Plain,
    /// Visible text, watching for tool-call tags
    ScanningForToolCall,
    Thinking,
    InToolCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    ThinkOpen,
    ThinkClose,
    ToolOpen,
    ToolClose,
}

/// Every literal the parser may ever react to, in any mode.
fn all_tags() -> impl Iterator<Item = &'static str> {
    THINK_OPEN_TAGS
        .iter()
        .chain(THINK_CLOSE_TAGS.iter())
        .copied()
        .chain([TOOL_CALL_OPEN, TOOL_CALL_CLOSE])
}

/// Longest tag length minus one: the most text ever held back.
pub fn max_hold_len() -> usize {
    all_tags().map(str::len).max().unwrap_or(1) - 1
}

/// Replace typographic quotes that some models emit inside JSON.
pub fn normalize_quotes(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
            other => other,
        })
        .collect()
}

/// Parse a tool-call body into a JSON object.
pub fn parse_tool_payload(raw: &str) -> Result<Value, String> {
    let normalized = normalize_quotes(raw.trim());
    let value: Value = serde_json::from_str(&normalized).map_err(|e| e.to_string())?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("tool-call payload is not a JSON object".to_string())
    }
}

/// Incremental parser, one instance per in-flight stream.
pub struct StreamParser {
    mode: ParserMode,
    /// Mode used for visible text (Plain or ScanningForToolCall)
    base_mode: ParserMode,
    /// Mode to restore when the current tool call closes
    resume_mode: ParserMode,
    /// Trailing text that may be the start of a tag
    pending: String,
    tool_call_buffer: String,
    tool_call_overflow: bool,
    parse_failures: usize,
    finished: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Parser that recognizes thinking tags and tool calls
    pub fn new() -> Self {
        Self::with_base_mode(ParserMode::ScanningForToolCall)
    }

    /// Parser that recognizes thinking tags only; tool-call markup stays visible
    pub fn without_tool_calls() -> Self {
        Self::with_base_mode(ParserMode::Plain)
    }

    fn with_base_mode(base_mode: ParserMode) -> Self {
        Self {
            mode: base_mode,
            base_mode,
            resume_mode: base_mode,
            pending: String::new(),
            tool_call_buffer: String::new(),
            tool_call_overflow: false,
            parse_failures: 0,
            finished: false,
        }
    }

    /// Reset parser state (for a new message)
    pub fn reset(&mut self) {
        *self = Self::with_base_mode(self.base_mode);
    }

    pub fn mode(&self) -> ParserMode {
        self.mode
    }

    /// Bytes currently held back as a possible tag prefix
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Tool-call segments dropped so far because they did not parse
    pub fn parse_failures(&self) -> usize {
        self.parse_failures
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed the next raw chunk; returns the events it completes.
    pub fn consume(&mut self, chunk: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished || chunk.is_empty() {
            return events;
        }

        let mut buffer = std::mem::take(&mut self.pending);
        buffer.push_str(chunk);
        let mut rest = buffer.as_str();

        while !rest.is_empty() {
            let tags = self.active_tags();
            match find_earliest_tag(rest, &tags) {
                Some((idx, tag, kind)) => {
                    self.emit_content(&rest[..idx], &mut events);
                    rest = &rest[idx + tag.len()..];
                    self.transition(kind, &mut events);
                }
                None => {
                    let split = rest.len() - partial_tag_suffix_len(rest, &tags);
                    self.emit_content(&rest[..split], &mut events);
                    self.pending = rest[split..].to_string();
                    break;
                }
            }
        }

        events
    }

    /// Natural end of the transport stream.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let pending = std::mem::take(&mut self.pending);
        if self.mode == ParserMode::InToolCall {
            self.record_failure("tool call was never closed");
            self.tool_call_buffer.clear();
        } else {
            self.emit_content(&pending, &mut events);
        }

        events.push(StreamEvent::StreamEnd);
        self.finished = true;
        events
    }

    /// Transport error or cancellation. With `flush`, held-back text is
    /// emitted in its current mode; an open tool call is always dropped.
    pub fn fail(&mut self, kind: StreamErrorKind, flush: bool) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        let pending = std::mem::take(&mut self.pending);
        if self.mode == ParserMode::InToolCall {
            debug!(
                bytes = self.tool_call_buffer.len() + pending.len(),
                "dropping unfinished tool call"
            );
            self.tool_call_buffer.clear();
        } else if flush {
            self.emit_content(&pending, &mut events);
        }

        events.push(StreamEvent::StreamError(kind));
        self.finished = true;
        events
    }

    fn active_tags(&self) -> Vec<(&'static str, TagKind)> {
        let mut tags = Vec::new();
        match self.mode {
            ParserMode::Plain => {
                tags.extend(THINK_OPEN_TAGS.iter().map(|t| (*t, TagKind::ThinkOpen)));
            }
            ParserMode::ScanningForToolCall => {
                tags.extend(THINK_OPEN_TAGS.iter().map(|t| (*t, TagKind::ThinkOpen)));
                tags.push((TOOL_CALL_OPEN, TagKind::ToolOpen));
            }
            ParserMode::Thinking => {
                tags.extend(THINK_CLOSE_TAGS.iter().map(|t| (*t, TagKind::ThinkClose)));
                if self.base_mode == ParserMode::ScanningForToolCall {
                    tags.push((TOOL_CALL_OPEN, TagKind::ToolOpen));
                }
            }
            ParserMode::InToolCall => {
                tags.push((TOOL_CALL_CLOSE, TagKind::ToolClose));
            }
        }
        tags
    }

    fn emit_content(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        match self.mode {
            ParserMode::Plain | ParserMode::ScanningForToolCall => {
                events.push(StreamEvent::PlainText(text.to_string()));
            }
            ParserMode::Thinking => {
                events.push(StreamEvent::ThinkingText(text.to_string()));
            }
            ParserMode::InToolCall => {
                if self.tool_call_overflow {
                    return;
                }
                if self.tool_call_buffer.len() + text.len() > MAX_TOOL_PAYLOAD {
                    self.tool_call_overflow = true;
                    self.tool_call_buffer = String::new();
                } else {
                    self.tool_call_buffer.push_str(text);
                }
            }
        }
    }

    fn transition(&mut self, kind: TagKind, events: &mut Vec<StreamEvent>) {
        match kind {
            TagKind::ThinkOpen => self.mode = ParserMode::Thinking,
            TagKind::ThinkClose => self.mode = self.base_mode,
            TagKind::ToolOpen => {
                self.resume_mode = self.mode;
                self.mode = ParserMode::InToolCall;
                self.tool_call_buffer.clear();
                self.tool_call_overflow = false;
            }
            TagKind::ToolClose => {
                let raw = std::mem::take(&mut self.tool_call_buffer);
                if self.tool_call_overflow {
                    self.record_failure("tool call exceeded the payload limit");
                } else {
                    match parse_tool_payload(&raw) {
                        Ok(payload) => events.push(StreamEvent::ToolCallComplete(payload)),
                        Err(e) => self.record_failure(&e),
                    }
                }
                self.tool_call_overflow = false;
                self.mode = self.resume_mode;
            }
        }
    }

    fn record_failure(&mut self, reason: &str) {
        self.parse_failures += 1;
        warn!(reason, "discarding malformed tool call");
    }
}

/// Earliest complete tag in `text`; on a tie the longer tag wins.
fn find_earliest_tag(
    text: &str,
    tags: &[(&'static str, TagKind)],
) -> Option<(usize, &'static str, TagKind)> {
    let mut best: Option<(usize, &'static str, TagKind)> = None;
    for &(tag, kind) in tags {
        if let Some(idx) = text.find(tag) {
            match best {
                Some((best_idx, best_tag, _))
                    if idx > best_idx || (idx == best_idx && tag.len() <= best_tag.len()) => {}
                _ => best = Some((idx, tag, kind)),
            }
        }
    }
    best
}

/// Length of the longest suffix of `text` that is a proper prefix of a tag.
/// Tags are ASCII, so the split point is always a char boundary.
fn partial_tag_suffix_len(text: &str, tags: &[(&'static str, TagKind)]) -> usize {
    let mut longest = 0;
    for &(tag, _) in tags {
        for len in (1..tag.len()).rev() {
            if len <= longest {
                break;
            }
            if text.ends_with(&tag[..len]) {
                longest = len;
                break;
            }
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(chunks: &[&str]) -> Vec<StreamEvent> {
        let mut parser = StreamParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.consume(chunk));
        }
        events.extend(parser.finish());
        events
    }

    /// Merge adjacent fragments of the same kind so that different
    /// chunkings of one input compare equal.
    fn coalesce(events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        let mut out: Vec<StreamEvent> = Vec::new();
        for event in events {
            match (out.last_mut(), event) {
                (Some(StreamEvent::PlainText(prev)), StreamEvent::PlainText(next)) => {
                    prev.push_str(&next)
                }
                (Some(StreamEvent::ThinkingText(prev)), StreamEvent::ThinkingText(next)) => {
                    prev.push_str(&next)
                }
                (_, event) => out.push(event),
            }
        }
        out
    }

    fn split_at_every_point(input: &str) -> Vec<(String, String)> {
        input
            .char_indices()
            .map(|(i, _)| i)
            .chain([input.len()])
            .map(|i| (input[..i].to_string(), input[i..].to_string()))
            .collect()
    }

    fn chunks_of(input: &str, size: usize) -> Vec<String> {
        let chars: Vec<char> = input.chars().collect();
        chars.chunks(size).map(|c| c.iter().collect()).collect()
    }

    #[test]
    fn test_scenario_split_think_tags() {
        let events = run(&["<thi", "nk>reasoning</thi", "nk>answer"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::ThinkingText("reasoning".into()),
                StreamEvent::PlainText("answer".into()),
                StreamEvent::StreamEnd,
            ]
        );
    }

    #[test]
    fn test_text_before_think() {
        let events = run(&["Hello <think>reasoning</think> world"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::PlainText("Hello ".into()),
                StreamEvent::ThinkingText("reasoning".into()),
                StreamEvent::PlainText(" world".into()),
                StreamEvent::StreamEnd,
            ]
        );
    }

    #[test]
    fn test_every_thinking_variant() {
        for (open, close) in THINK_OPEN_TAGS.iter().zip(THINK_CLOSE_TAGS) {
            let input = format!("a{}b{}c", open, close);
            assert_eq!(
                run(&[&input]),
                vec![
                    StreamEvent::PlainText("a".into()),
                    StreamEvent::ThinkingText("b".into()),
                    StreamEvent::PlainText("c".into()),
                    StreamEvent::StreamEnd,
                ],
                "variant {}",
                open
            );
        }
    }

    #[test]
    fn test_streaming_chunks_hold_back_partial_tag() {
        let mut parser = StreamParser::new();

        let r1 = parser.consume("Hello <thi");
        assert_eq!(r1, vec![StreamEvent::PlainText("Hello ".into())]);
        assert_eq!(parser.pending_len(), 4);

        let r2 = parser.consume("nk>This is");
        assert_eq!(r2, vec![StreamEvent::ThinkingText("This is".into())]);
        assert_eq!(parser.mode(), ParserMode::Thinking);

        let r3 = parser.consume(" reasoning</think> done");
        assert_eq!(
            r3,
            vec![
                StreamEvent::ThinkingText(" reasoning".into()),
                StreamEvent::PlainText(" done".into()),
            ]
        );
    }

    #[test]
    fn test_false_tag_prefix_is_released() {
        let mut parser = StreamParser::new();
        assert_eq!(parser.consume("a <th"), vec![StreamEvent::PlainText("a ".into())]);
        assert_eq!(
            parser.consume("ree"),
            vec![StreamEvent::PlainText("<three".into())]
        );
        assert_eq!(parser.pending_len(), 0);
    }

    #[test]
    fn test_tag_split_invariance() {
        let mut inputs: Vec<String> = all_tags().map(str::to_string).collect();
        inputs.push("pre<think>mid</think>post".to_string());
        inputs.push("x[THINK]y[/THINK]z<tool_call>{\"type\":\"t\"}</tool_call>".to_string());
        inputs.push("é<seed:think>ü</seed:think>ö".to_string());

        for input in inputs {
            let whole = coalesce(run(&[&input]));
            for (a, b) in split_at_every_point(&input) {
                assert_eq!(coalesce(run(&[&a, &b])), whole, "split {:?} | {:?}", a, b);
            }
            for size in 1..=4 {
                let chunks = chunks_of(&input, size);
                let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
                assert_eq!(coalesce(run(&refs)), whole, "chunk size {}", size);
            }
        }
    }

    #[test]
    fn test_no_tag_leaks_into_text() {
        let input = "a<think>b</think>c[THINK]d[/THINK]e<seed:think>f</seed:think>g";
        for size in 1..=input.len() {
            let chunks = chunks_of(input, size);
            let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
            for event in run(&refs) {
                let text = match event {
                    StreamEvent::PlainText(t) | StreamEvent::ThinkingText(t) => t,
                    _ => continue,
                };
                for tag in all_tags() {
                    assert!(!text.contains(tag), "{:?} leaked in {:?}", tag, text);
                }
            }
        }
    }

    #[test]
    fn test_bounded_buffering() {
        let input = "<<<[[[<thin<seed:<tool_ca</thin[/THI</seed:thin</tool_cal<<<";
        let mut parser = StreamParser::new();
        for c in input.chars() {
            parser.consume(&c.to_string());
            assert!(parser.pending_len() <= max_hold_len());
        }
        let mut parser = StreamParser::new();
        parser.consume("<think>");
        for c in input.chars() {
            parser.consume(&c.to_string());
            assert!(parser.pending_len() <= max_hold_len());
        }
    }

    #[test]
    fn test_tool_payload_round_trip_any_chunking() {
        let payload = json!({
            "type": "editFile",
            "uri": "file:///tmp/a.rs",
            "edits": [{"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 3}, "newText": "fn main() {}"}]
        });
        let input = format!("before{}{}{}after", TOOL_CALL_OPEN, payload, TOOL_CALL_CLOSE);
        for size in 1..=input.len() {
            let chunks = chunks_of(&input, size);
            let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
            assert_eq!(
                coalesce(run(&refs)),
                vec![
                    StreamEvent::PlainText("before".into()),
                    StreamEvent::ToolCallComplete(payload.clone()),
                    StreamEvent::PlainText("after".into()),
                    StreamEvent::StreamEnd,
                ],
                "chunk size {}",
                size
            );
        }
    }

    #[test]
    fn test_curly_quotes_are_normalized() {
        let events = run(&["<tool_call>{\u{201C}type\u{201D}: \u{201C}noop\u{201D}}</tool_call>"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCallComplete(json!({"type": "noop"})),
                StreamEvent::StreamEnd,
            ]
        );
    }

    #[test]
    fn test_malformed_payload_is_dropped_and_stream_continues() {
        let mut parser = StreamParser::new();
        let mut events = parser.consume("a<tool_call>{not json</tool_call>b");
        events.extend(parser.finish());
        assert_eq!(
            events,
            vec![
                StreamEvent::PlainText("a".into()),
                StreamEvent::PlainText("b".into()),
                StreamEvent::StreamEnd,
            ]
        );
        assert_eq!(parser.parse_failures(), 1);
    }

    #[test]
    fn test_unclosed_tool_call_is_discarded_at_end() {
        let mut parser = StreamParser::new();
        let mut events = parser.consume("a<tool_call>{\"type\":\"editFile\"");
        events.extend(parser.finish());
        assert_eq!(
            events,
            vec![StreamEvent::PlainText("a".into()), StreamEvent::StreamEnd]
        );
        assert_eq!(parser.parse_failures(), 1);
    }

    #[test]
    fn test_stray_close_tag_is_plain_text() {
        assert_eq!(
            run(&["x</think>y"]),
            vec![StreamEvent::PlainText("x</think>y".into()), StreamEvent::StreamEnd]
        );
    }

    #[test]
    fn test_tool_call_inside_thinking_resumes_thinking() {
        let events = run(&["<think>a<tool_call>{\"type\":\"t\"}</tool_call>b</think>c"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::ThinkingText("a".into()),
                StreamEvent::ToolCallComplete(json!({"type": "t"})),
                StreamEvent::ThinkingText("b".into()),
                StreamEvent::PlainText("c".into()),
                StreamEvent::StreamEnd,
            ]
        );
    }

    #[test]
    fn test_tool_tags_visible_without_tool_calls() {
        let mut parser = StreamParser::without_tool_calls();
        let mut events = parser.consume("<tool_call>{}</tool_call>");
        events.extend(parser.finish());
        assert_eq!(
            coalesce(events),
            vec![
                StreamEvent::PlainText("<tool_call>{}</tool_call>".into()),
                StreamEvent::StreamEnd,
            ]
        );
    }

    #[test]
    fn test_empty_chunks_are_no_ops() {
        let mut parser = StreamParser::new();
        assert!(parser.consume("").is_empty());
        parser.consume("<thi");
        assert!(parser.consume("").is_empty());
        assert_eq!(parser.pending_len(), 4);
    }

    #[test]
    fn test_single_terminal_event() {
        let mut parser = StreamParser::new();
        parser.consume("hello");
        let end = parser.finish();
        assert_eq!(end.last(), Some(&StreamEvent::StreamEnd));
        assert!(parser.consume("more").is_empty());
        assert!(parser.finish().is_empty());
        assert!(parser.fail(StreamErrorKind::Aborted, true).is_empty());
    }

    #[test]
    fn test_fail_flushes_pending_in_current_mode() {
        let mut parser = StreamParser::new();
        parser.consume("<think>partial [/TH");
        assert_eq!(
            parser.fail(StreamErrorKind::Unknown, true),
            vec![
                StreamEvent::ThinkingText("[/TH".into()),
                StreamEvent::StreamError(StreamErrorKind::Unknown),
            ]
        );

        let mut parser = StreamParser::new();
        parser.consume("text <thi");
        assert_eq!(
            parser.fail(StreamErrorKind::Aborted, false),
            vec![StreamEvent::StreamError(StreamErrorKind::Aborted)]
        );
    }

    #[test]
    fn test_oversized_tool_call_is_dropped() {
        let mut parser = StreamParser::new();
        parser.consume(TOOL_CALL_OPEN);
        let filler = "x".repeat(MAX_TOOL_PAYLOAD + 1);
        assert!(parser.consume(&filler).is_empty());
        let mut events = parser.consume("</tool_call>ok");
        events.extend(parser.finish());
        assert_eq!(
            events,
            vec![StreamEvent::PlainText("ok".into()), StreamEvent::StreamEnd]
        );
        assert_eq!(parser.parse_failures(), 1);
    }

    #[test]
    fn test_reset() {
        let mut parser = StreamParser::new();
        parser.consume("<think>partial");
        assert_eq!(parser.mode(), ParserMode::Thinking);

        parser.reset();
        assert_eq!(parser.mode(), ParserMode::ScanningForToolCall);
        assert!(!parser.is_finished());
    }
}
