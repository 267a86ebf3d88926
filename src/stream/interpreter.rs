//! 流式响应解析
//!
//! 增量扫描模型输出（buffer + mode），识别 `<action ...>...</action>` 与 `<output ...>...</output>`。
//! 分隔符被切在两个 chunk 之间时先留在 buffer 里等下一块；流结束时仍未闭合的标签按普通文本输出并记 warn，
//! 模型输出格式错误不会让本轮失败。一个实例只服务一次生成。

use serde_json::Value;

use crate::actions::parser::{find_tag_end, parse_attributes};
use crate::actions::CallParams;
use crate::stream::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Action,
    Output,
}

impl TagKind {
    const ALL: [TagKind; 2] = [TagKind::Action, TagKind::Output];

    fn open_prefix(self) -> &'static str {
        match self {
            TagKind::Action => "<action",
            TagKind::Output => "<output",
        }
    }

    fn close_tag(self) -> &'static str {
        match self {
            TagKind::Action => "</action>",
            TagKind::Output => "</output>",
        }
    }
}

#[derive(Debug)]
enum Mode {
    Text,
    InTag {
        kind: TagKind,
        /// 原始开标签，降级为文本时原样输出
        open_tag: String,
        attrs: Vec<(String, String)>,
    },
}

/// 在文本模式下扫描到的下一个位置
enum Scan {
    /// buffer 中没有可能的标签
    Clear,
    /// 从该位置起可能是标签开头，但还不完整
    Partial(usize),
    /// 完整开标签：起点、`>` 之后的位置、标签种类
    Open(usize, usize, TagKind),
}

#[derive(Debug)]
pub struct StreamInterpreter {
    buffer: String,
    mode: Mode,
}

impl Default for StreamInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamInterpreter {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            mode: Mode::Text,
        }
    }

    /// 追加一块输出，返回这块输出使之完整的事件
    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            match &self.mode {
                Mode::Text => match scan_text(&self.buffer) {
                    Scan::Clear => {
                        let text = std::mem::take(&mut self.buffer);
                        push_text(&mut events, text);
                        break;
                    }
                    Scan::Partial(at) => {
                        let text: String = self.buffer.drain(..at).collect();
                        push_text(&mut events, text);
                        break;
                    }
                    Scan::Open(start, end, kind) => {
                        let before: String = self.buffer.drain(..start).collect();
                        push_text(&mut events, before);
                        let open_tag: String = self.buffer.drain(..end - start).collect();
                        self.open(kind, open_tag, &mut events);
                    }
                },
                Mode::InTag { kind, .. } => {
                    let close = kind.close_tag();
                    let Some(at) = self.buffer.find(close) else {
                        break;
                    };
                    let content: String = self.buffer.drain(..at).collect();
                    self.buffer.drain(..close.len());
                    if let Mode::InTag { kind, attrs, .. } =
                        std::mem::replace(&mut self.mode, Mode::Text)
                    {
                        events.push(build_event(kind, attrs, content));
                    }
                }
            }
        }

        events
    }

    /// 流结束：未闭合的标签与残留片段降级为文本，最后是 StreamEnd
    pub fn finish(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        match std::mem::replace(&mut self.mode, Mode::Text) {
            Mode::Text => push_text(&mut events, rest),
            Mode::InTag { kind, open_tag, .. } => {
                tracing::warn!(
                    tag = kind.open_prefix(),
                    "Unterminated tag at end of stream; treating it as text"
                );
                push_text(&mut events, open_tag + &rest);
            }
        }
        events.push(StreamEvent::StreamEnd);
        events
    }

    fn open(&mut self, kind: TagKind, open_tag: String, events: &mut Vec<StreamEvent>) {
        let inner = open_tag[kind.open_prefix().len()..open_tag.len() - 1].trim_end();
        let self_closing = inner.ends_with('/');
        let attrs = parse_attributes(inner.trim_end_matches('/'));

        if kind == TagKind::Action && !attrs.iter().any(|(k, _)| k == "name") {
            tracing::warn!(tag = %open_tag, "Action tag without a name; treating it as text");
            push_text(events, open_tag);
            return;
        }

        if self_closing {
            events.push(build_event(kind, attrs, String::new()));
        } else {
            self.mode = Mode::InTag {
                kind,
                open_tag,
                attrs,
            };
        }
    }
}

fn push_text(events: &mut Vec<StreamEvent>, text: String) {
    if text.is_empty() {
        return;
    }
    // 相邻文本合并，减少碎片
    if let Some(StreamEvent::TextDelta { text: last }) = events.last_mut() {
        last.push_str(&text);
        return;
    }
    events.push(StreamEvent::TextDelta { text });
}

fn scan_text(buffer: &str) -> Scan {
    for (at, _) in buffer.match_indices('<') {
        let rest = &buffer[at..];
        for kind in TagKind::ALL {
            let prefix = kind.open_prefix();
            if rest.len() < prefix.len() {
                if prefix.starts_with(rest) {
                    return Scan::Partial(at);
                }
                continue;
            }
            if !rest.starts_with(prefix) {
                continue;
            }
            match rest.as_bytes().get(prefix.len()) {
                None => return Scan::Partial(at),
                Some(b) if b.is_ascii_whitespace() || *b == b'>' || *b == b'/' => {
                    return match find_tag_end(rest) {
                        Some(gt) => Scan::Open(at, at + gt + 1, kind),
                        None => Scan::Partial(at),
                    };
                }
                // <actions>、<outputs> 之类只是普通文本
                Some(_) => {}
            }
        }
    }
    Scan::Clear
}

fn build_event(kind: TagKind, attrs: Vec<(String, String)>, content: String) -> StreamEvent {
    let mut name = None;
    let mut params = CallParams::default();
    for (key, value) in attrs {
        match (kind, key.as_str()) {
            (TagKind::Action, "name") | (TagKind::Output, "type") => name = Some(value),
            (_, "contextKey") => params.context_key = Some(value),
            _ => {
                params.extra.insert(key, Value::String(value));
            }
        }
    }
    match kind {
        TagKind::Action => StreamEvent::ActionCallDetected {
            name: name.unwrap_or_default(),
            content,
            params,
        },
        TagKind::Output => StreamEvent::OutputCallDetected {
            output_type: name.unwrap_or_else(|| "text".to_string()),
            content,
            params,
        },
    }
}
