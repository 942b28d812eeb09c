//! Tool bridge against a real subprocess speaking line-delimited JSON-RPC

#![cfg(unix)]

use std::collections::HashMap;

use pilotgate_core::bridge::ToolBridge;
use pilotgate_core::config::ToolBridgeConfig;
use pilotgate_core::tools::{ToolBackend, ToolError};
use serde_json::json;

/// A tiny tool server. Before answering `initialize` it writes a garbage
/// line and a response for an id nobody asked for.
const SERVER: &str = r##"
reply() { printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$1" "$2"; }
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      echo 'this is not json'
      reply 9999 '{}'
      reply "$id" '{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"1"}}'
      ;;
    *'"method":"notifications/initialized"'*)
      printf '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}\n'
      ;;
    *'"method":"tools/list"'*'"cursor":"p2"'*)
      reply "$id" '{"tools":[{"name":"slow","inputSchema":{"type":"object"}},{"name":"fail","inputSchema":{"type":"object"}},{"name":"crash","inputSchema":{"type":"object"}},{"name":"where","inputSchema":{"type":"object"}}]}'
      ;;
    *'"method":"tools/list"'*)
      if [ -n "$BRIDGE_LOG" ]; then echo list >> "$BRIDGE_LOG"; fi
      reply "$id" '{"tools":[{"name":"grep","description":"Search files","inputSchema":{"type":"object"}}],"nextCursor":"p2"}'
      ;;
    *'"name":"grep"'*)
      reply "$id" '{"content":[{"type":"text","text":"3 matches"}],"isError":false}'
      ;;
    *'"name":"slow"'*)
      ( sleep 2; reply "$id" '{"content":[{"type":"text","text":"late"}]}' ) &
      ;;
    *'"name":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"disk on fire"}}\n' "$id"
      ;;
    *'"name":"where"'*)
      reply "$id" "{\"content\":[{\"type\":\"text\",\"text\":\"$BRIDGE_TAG $PWD\"}]}"
      ;;
    *'"name":"crash"'*)
      exit 3
      ;;
  esac
done
"##;

/// Answers the handshake and discovery, then stops reading stdin
const STUCK_SERVER: &str = r##"
reply() { printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$1" "$2"; }
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      reply "$id" '{"protocolVersion":"2025-03-26","capabilities":{"tools":{}},"serverInfo":{"name":"stuck","version":"1"}}'
      ;;
    *'"method":"tools/list"'*)
      reply "$id" '{"tools":[{"name":"hang","inputSchema":{"type":"object"}}]}'
      exec sleep 30
      ;;
  esac
done
"##;

fn server_config() -> ToolBridgeConfig {
    let mut config = ToolBridgeConfig::new("sh", vec!["-c".to_string(), SERVER.to_string()]);
    config.timeout_secs = 1;
    config.startup_timeout_secs = 5;
    config
}

#[tokio::test]
async fn test_lists_every_page_and_calls_a_tool() {
    let bridge = ToolBridge::new(server_config());
    bridge.start().await.unwrap();
    assert!(bridge.is_running().await);

    let tools = bridge.list_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["grep", "slow", "fail", "crash", "where"]);
    assert_eq!(tools[0].description, "Search files");

    let result = bridge.call_tool("grep", json!({"pattern": "func"})).await.unwrap();
    assert_eq!(result.content, "3 matches");
    assert!(!result.is_error);

    bridge.stop().await;
    assert!(!bridge.is_running().await);
}

#[tokio::test]
async fn test_unknown_tool_is_not_found() {
    let bridge = ToolBridge::new(server_config());
    bridge.start().await.unwrap();
    let err = bridge.call_tool("delete", json!({})).await.unwrap_err();
    assert!(matches!(err, ToolError::NotFound(name) if name == "delete"));
    bridge.stop().await;
}

#[tokio::test]
async fn test_timeout_leaves_the_process_running() {
    let bridge = ToolBridge::new(server_config());
    bridge.start().await.unwrap();

    let err = bridge.call_tool("slow", json!({})).await.unwrap_err();
    assert!(matches!(err, ToolError::Timeout { ref name, secs: 1 } if name == "slow"));

    // The late answer to "slow" must not disturb later calls
    assert!(bridge.is_running().await);
    let result = bridge.call_tool("grep", json!({})).await.unwrap();
    assert_eq!(result.content, "3 matches");
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    let result = bridge.call_tool("grep", json!({})).await.unwrap();
    assert_eq!(result.content, "3 matches");

    bridge.stop().await;
}

#[tokio::test]
async fn test_rpc_error_is_reported() {
    let bridge = ToolBridge::new(server_config());
    bridge.start().await.unwrap();
    let err = bridge.call_tool("fail", json!({})).await.unwrap_err();
    match err {
        ToolError::Rpc { code, message } => {
            assert_eq!(code, -32000);
            assert_eq!(message, "disk on fire");
        }
        other => panic!("unexpected {:?}", other),
    }
    bridge.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let bridge = std::sync::Arc::new(ToolBridge::new(server_config()));
    bridge.start().await.unwrap();
    bridge.list_tools().await.unwrap();

    let calls = (0..8).map(|i| {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.call_tool("grep", json!({"i": i})).await })
    });
    for call in futures::future::join_all(calls).await {
        assert_eq!(call.unwrap().unwrap().content, "3 matches");
    }
    bridge.stop().await;
}

#[tokio::test]
async fn test_crash_fails_pending_call_and_restart_recovers() {
    let bridge = ToolBridge::new(server_config());
    bridge.start().await.unwrap();

    let err = bridge.call_tool("crash", json!({})).await.unwrap_err();
    assert!(matches!(err, ToolError::BridgeUnavailable(_)));
    assert!(!bridge.is_running().await);

    bridge.restart().await.unwrap();
    let result = bridge.call_tool("grep", json!({})).await.unwrap();
    assert_eq!(result.content, "3 matches");
    bridge.stop().await;
}

#[tokio::test]
async fn test_exited_child_is_started_again_and_tools_relisted() {
    let dir = tempfile::TempDir::new().unwrap();
    let log = dir.path().join("lists.log");
    let mut config = server_config();
    config.env = HashMap::from([("BRIDGE_LOG".to_string(), log.display().to_string())]);

    let bridge = ToolBridge::new(config);
    bridge.start().await.unwrap();
    assert_eq!(bridge.list_tools().await.unwrap().len(), 5);
    assert_eq!(bridge.list_tools().await.unwrap().len(), 5);
    assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);

    let err = bridge.call_tool("crash", json!({})).await.unwrap_err();
    assert!(matches!(err, ToolError::BridgeUnavailable(_)));
    assert!(!bridge.is_running().await);

    let result = bridge.call_tool("grep", json!({})).await.unwrap();
    assert_eq!(result.content, "3 matches");
    assert!(bridge.is_running().await);
    assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 2);
    bridge.stop().await;
}

#[tokio::test]
async fn test_stopped_bridge_stays_down() {
    let bridge = ToolBridge::new(server_config());
    bridge.start().await.unwrap();
    bridge.stop().await;
    assert!(matches!(
        bridge.call_tool("grep", json!({})).await,
        Err(ToolError::BridgeUnavailable(_))
    ));
    assert!(!bridge.is_running().await);
}

#[tokio::test]
async fn test_child_that_stops_reading_times_out() {
    let mut config = ToolBridgeConfig::new("sh", vec!["-c".to_string(), STUCK_SERVER.to_string()]);
    config.timeout_secs = 1;
    let bridge = ToolBridge::new(config);
    bridge.start().await.unwrap();
    bridge.list_tools().await.unwrap();

    // Far more than a pipe buffer holds
    let payload = "x".repeat(4 * 1024 * 1024);
    let call = bridge.call_tool("hang", json!({"data": payload}));
    let err = tokio::time::timeout(std::time::Duration::from_secs(10), call)
        .await
        .expect("call must not block past its timeout")
        .unwrap_err();
    assert!(matches!(err, ToolError::Timeout { ref name, secs: 1 } if name == "hang"));
    bridge.stop().await;
}

#[tokio::test]
async fn test_env_and_working_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = server_config();
    config.env = HashMap::from([("BRIDGE_TAG".to_string(), "tagged".to_string())]);
    config.cwd = Some(dir.path().to_path_buf());

    let bridge = ToolBridge::new(config);
    bridge.start().await.unwrap();
    let result = bridge.call_tool("where", json!({})).await.unwrap();
    let canonical = dir.path().canonicalize().unwrap();
    assert!(result.content.starts_with("tagged "));
    let reported = std::path::PathBuf::from(result.content.trim_start_matches("tagged "));
    assert_eq!(reported.canonicalize().unwrap(), canonical);
    bridge.stop().await;
}

#[tokio::test]
async fn test_usable_as_a_tool_backend() {
    let bridge = ToolBridge::new(server_config());
    bridge.start().await.unwrap();
    let backend: &dyn ToolBackend = &bridge;
    assert_eq!(backend.list_tools().await.unwrap().len(), 5);
    bridge.stop().await;
}
