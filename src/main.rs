//! Hive - Agent 动作执行核心演示
//!
//! 入口：初始化日志、加载配置、构建带待办上下文的 Agent，用脚本化的 Mock LLM 回放两轮输出，
//! 并把每个 ActionResult 以 JSON 打印出来。

use std::sync::Arc;

use anyhow::Context;
use hive::actions::builtin;
use hive::core::create_agent_builder;
use hive::llm::MockLlmClient;
use hive::{observability, ActiveContext};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(Into::into);
    let llm = Arc::new(MockLlmClient::scripted(vec![
        vec![
            "Adding that now. <action name=\"add-task\" context",
            "Key=\"alice\"><title>Buy milk</title><priority>1</prio",
            "rity></action><action name=\"add-task\" contextKey=\"alice\">",
            "<title>Buy milk</title><priority>1</priority></action>",
            "<output type=\"text\">Added to your list.</output>",
        ],
        vec![
            "<action name=\"complete-task\" contextKey=\"alice\">{\"id\": 1}</action>",
            "<action name=\"complete-task\" contextKey=\"alice\"><id>1</id></action>",
            "<action name=\"refund-order\">42</action>",
            "<action name=\"echo\">done for today</action>",
        ],
    ]));

    let agent = create_agent_builder(config_path)
        .with_llm(llm)
        .with_action(builtin::echo())
        .build();

    let active = vec![ActiveContext::new(
        Arc::new(builtin::todo_context()),
        json!({ "user": "alice" }),
    )];

    for input in ["Remind me to buy milk", "Milk is bought"] {
        println!("> {input}");
        let outcome = agent
            .respond(&active, input)
            .await
            .context("Turn failed")?;
        if !outcome.text.trim().is_empty() {
            println!("{}", outcome.text.trim());
        }
        for output in &outcome.outputs {
            println!("[{}] {}", output.output_type, output.content);
        }
        for result in &outcome.results {
            println!("{}", serde_json::to_string(result)?);
        }
    }

    let todo = agent
        .contexts()
        .get("todo", "alice")
        .await
        .context("Failed to read todo context")?;
    if let Some(instance) = todo {
        println!("{}", serde_json::to_string_pretty(&instance.memory)?);
    }

    agent.shutdown();
    Ok(())
}
