//! Incremental parsing against a live chunk channel.


use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use weft::{parse_plan, ArgValue, MessageChunk, PlanParser, TaskKind};

/// **Scenario**: the first task is handed out as soon as its line ends, while the producer is
/// still holding the rest of the plan.
#[tokio::test]
async fn task_is_emitted_before_plan_ends() {
    let (tx, rx) = mpsc::channel(8);
    let mut parser = PlanParser::new(rx);

    tx.send(MessageChunk::new("1. sear")).await.unwrap();
    tx.send(MessageChunk::new("ch(query=\"rust\")\n2. se"))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), parser.next_task())
        .await
        .expect("first task should not wait for the rest of the plan")
        .unwrap();
    assert_eq!(first.index, Some(1));
    assert_eq!(first.kind, TaskKind::tool("search"));
    assert_eq!(
        first.arguments.get("query"),
        Some(&ArgValue::Literal(json!("rust")))
    );

    tx.send(MessageChunk::new("nd(to=$1)\njoin()\n")).await.unwrap();
    drop(tx);
    let second = parser.next_task().await.unwrap();
    assert_eq!(second.arguments.get("to"), Some(&ArgValue::Reference(1)));
    assert!(parser.next_task().await.unwrap().is_join());
    assert!(parser.next_task().await.is_none());
    assert!(parser.is_exhausted());
    assert_eq!(parser.emitted(), 3);
}

/// **Scenario**: after the join the parser closes its receiver, so the producer's next send
/// fails and it can stop generating.
#[tokio::test]
async fn producer_is_stopped_after_join() {
    let (tx, rx) = mpsc::channel(8);
    let mut parser = PlanParser::new(rx);
    tx.send(MessageChunk::new("1. a()\n2. join()\n3. b()\n"))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    while let Some(task) = parser.next_task().await {
        tasks.push(task);
    }
    assert_eq!(tasks.len(), 2);
    assert!(tx.send(MessageChunk::new("4. c()\n")).await.is_err());
}

#[tokio::test]
async fn stream_adapter_yields_the_same_tasks_as_whole_text() {
    let plan = "Thought: look it up\n1. search(query=\"a\")\nsome prose\n2. search(query=${1})\n3. join()\n";
    let (tx, rx) = mpsc::channel(plan.len());
    for c in plan.chars() {
        tx.send(MessageChunk::new(c.to_string())).await.unwrap();
    }
    drop(tx);

    let streamed: Vec<_> = PlanParser::new(rx).into_stream().collect().await;
    let (whole, diagnostics) = parse_plan(plan);
    assert_eq!(streamed, whole);
    assert_eq!(streamed[0].thought.as_deref(), Some("look it up"));
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].line, 3);
}

#[tokio::test]
async fn end_marker_ends_plan_without_join() {
    let (tx, rx) = mpsc::channel(4);
    tx.send(MessageChunk::new("1. a(x=1)\n<END_OF_PLAN>\n2. b()\n"))
        .await
        .unwrap();
    drop(tx);
    let tasks: Vec<_> = PlanParser::new(rx).into_stream().collect().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, TaskKind::tool("a"));
}
