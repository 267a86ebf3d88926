//! Mock LLM 客户端（用于演示与测试，无需 API）
//!
//! 按脚本逐轮回放预先写好的输出块；脚本用完后把最后一条 User 消息包成 echo 动作调用回显。

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;

use crate::llm::{LlmClient, Message, Role, TokenStream};

/// 回显时每块的字符数，刻意切碎以覆盖跨块的标签
const ECHO_CHUNK_CHARS: usize = 7;

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Vec<String>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个元素是一轮输出，按块给出
    pub fn scripted<I, T, S>(turns: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script = turns
            .into_iter()
            .map(|chunks| chunks.into_iter().map(Into::into).collect())
            .collect();
        Self {
            script: Mutex::new(script),
        }
    }

    pub fn remaining_turns(&self) -> usize {
        self.script.lock().len()
    }

    fn next_chunks(&self, messages: &[Message]) -> Vec<String> {
        if let Some(chunks) = self.script.lock().pop_front() {
            return chunks;
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let reply = format!("Echo from Mock: <action name=\"echo\">{last_user}</action>");
        let chars: Vec<char> = reply.chars().collect();
        chars
            .chunks(ECHO_CHUNK_CHARS)
            .map(|c| c.iter().collect())
            .collect()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        Ok(self.next_chunks(messages).concat())
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let chunks = self.next_chunks(messages);
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_script_then_echo() {
        let llm = MockLlmClient::scripted(vec![vec!["a", "b"]]);
        let chunks: Vec<_> = llm
            .complete_stream(&[])
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(chunks, vec![Ok("a".to_string()), Ok("b".to_string())]);
        assert_eq!(llm.remaining_turns(), 0);

        let echoed = llm.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(echoed, "Echo from Mock: <action name=\"echo\">hi</action>");
    }
}
