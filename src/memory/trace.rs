//! 对话轨迹中的动作结果
//!
//! 每个调用的终态结果都追加到这里；下一轮生成前取出尚未回灌的结果并标记 processed。

use serde::Serialize;

use crate::actions::ActionResult;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultTrace {
    results: Vec<ActionResult>,
    /// 最多保留多少条（0 为不限）
    #[serde(skip)]
    max_entries: usize,
}

impl ResultTrace {
    pub fn new(max_entries: usize) -> Self {
        Self {
            results: Vec::new(),
            max_entries,
        }
    }

    pub fn push(&mut self, result: ActionResult) {
        self.results.push(result);
        self.prune();
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = ActionResult>) {
        self.results.extend(results);
        self.prune();
    }

    pub fn results(&self) -> &[ActionResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// 取出尚未回灌的结果（按追加顺序），并标记为已处理
    pub fn take_unprocessed(&mut self) -> Vec<ActionResult> {
        let mut pending = Vec::new();
        for result in self.results.iter_mut().filter(|r| !r.processed) {
            result.processed = true;
            pending.push(result.clone());
        }
        pending
    }

    /// 给模型看的文本形式：有 formatted 用 formatted，否则用 JSON data
    pub fn render(results: &[ActionResult]) -> String {
        results
            .iter()
            .map(|r| match &r.formatted {
                Some(text) => format!("[{}] {}", r.name, text),
                None => format!("[{}] {}", r.name, r.data),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn prune(&mut self) {
        if self.max_entries > 0 && self.results.len() > self.max_entries {
            let excess = self.results.len() - self.max_entries;
            self.results.drain(..excess);
        }
    }
}
