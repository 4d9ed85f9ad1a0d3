use std::collections::BTreeMap;

use fleet_lite::config::ChunkOverflow;
use fleet_lite::error::FleetError;
use fleet_lite::scheduler::{
    assign_round_robin, chunk_inputs, load_input_files, plan_assignments, RenderContext, TaskSpec,
};

fn items(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("host{}.example.com", i)).collect()
}

#[test]
fn test_chunking_preserves_every_item_in_order() {
    let input = items(10);
    let chunks = chunk_inputs(&input, 3);

    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[3], vec!["host10.example.com".to_string()]);
    let flattened: Vec<String> = chunks.concat();
    assert_eq!(flattened, input);
}

#[test]
fn test_non_positive_chunk_size_is_one_chunk() {
    let input = items(5);
    assert_eq!(chunk_inputs(&input, 0), vec![input.clone()]);
    assert_eq!(chunk_inputs(&input, -4), vec![input]);
}

#[test]
fn test_round_robin_reuses_chunks_when_fleet_is_larger() {
    assert_eq!(assign_round_robin(7, 3), vec![0, 1, 2, 0, 1, 2, 0]);
    assert_eq!(assign_round_robin(3, 3), vec![0, 1, 2]);
    assert!(assign_round_robin(3, 0).is_empty());
}

#[test]
fn test_plan_with_fewer_chunks_than_nodes() {
    let plan = plan_assignments(4, 2, ChunkOverflow::Reject).unwrap();
    assert_eq!(plan, vec![vec![0], vec![1], vec![0], vec![1]]);
}

#[test]
fn test_plan_rejects_or_spreads_surplus_chunks() {
    let err = plan_assignments(2, 3, ChunkOverflow::Reject).unwrap_err();
    assert!(matches!(err, FleetError::Config(_)));

    let plan = plan_assignments(2, 3, ChunkOverflow::Spread).unwrap();
    assert_eq!(plan, vec![vec![0, 2], vec![1]]);
}

#[tokio::test]
async fn test_load_input_files_concatenates_and_skips_blanks() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    tokio::fs::write(&a, "one\n\n  two  \n").await.unwrap();
    tokio::fs::write(&b, "three\r\n").await.unwrap();

    let loaded = load_input_files(&[a, b]).await.unwrap();
    assert_eq!(loaded, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_load_input_files_missing_file() {
    let result = load_input_files(&["/nonexistent/input.txt"]).await;
    assert!(matches!(result, Err(FleetError::Config(_))));
}

#[tokio::test]
async fn test_task_module_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resolve.yaml");
    tokio::fs::write(
        &path,
        r#"
name: resolve
description: Resolve hostnames
command: dnsx
args: ["-l", "{{ item }}", "-silent"]
env:
  DNSX_THREADS: "50"
chunk_size: 100
"#,
    )
    .await
    .unwrap();

    let task = TaskSpec::load(&path).await.unwrap();
    assert_eq!(task.name, "resolve");
    assert_eq!(task.args, vec!["-l", "{{ item }}", "-silent"]);
    assert_eq!(task.env.get("DNSX_THREADS").map(String::as_str), Some("50"));
    assert_eq!(task.chunk_size, 100);
    assert!(task.inputs.is_empty());
}

#[test]
fn test_task_module_without_command_is_rejected() {
    let result = TaskSpec::from_yaml("name: broken\ncommand: \"\"\n");
    assert!(matches!(result, Err(FleetError::Config(_))));

    let result = TaskSpec::from_yaml("not: [valid");
    assert!(matches!(result, Err(FleetError::Config(_))));
}

#[test]
fn test_render_without_chunk_keeps_args() {
    let task = TaskSpec::new("uptime", "uptime").with_args(["-p", "{{ item }}"]);
    let env = BTreeMap::new();
    let ctx = RenderContext {
        env: &env,
        timeout_seconds: 30,
        chunk_path: "/tmp/run/uptime-0.txt",
    };

    let req = task.render(&[], &ctx);
    assert_eq!(req.command, "uptime");
    assert_eq!(req.args, vec!["-p", "{{ item }}"]);
    assert!(req.input.is_empty());
    assert_eq!(req.timeout_seconds, 30);
}

#[test]
fn test_render_chunk_is_streamed_as_stdin() {
    let mut task = TaskSpec::new("scan", "nmap").with_args(["-iL", "{{ item }}"]);
    task.env.insert("B".to_string(), "task".to_string());
    task.env.insert("A".to_string(), "task".to_string());
    let mut env = BTreeMap::new();
    env.insert("B".to_string(), "caller".to_string());
    let ctx = RenderContext {
        env: &env,
        timeout_seconds: 0,
        chunk_path: "/tmp/run/scan-1.txt",
    };

    let chunk = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    let req = task.render(&chunk, &ctx);

    assert_eq!(req.command, "sh");
    assert_eq!(req.args[0], "-c");
    assert!(req.args[1].ends_with("exec nmap -iL /tmp/run/scan-1.txt"));
    assert_eq!(req.input, "10.0.0.1\n10.0.0.2\n");
    assert_eq!(req.env, vec!["A=task", "B=caller"]);
}
