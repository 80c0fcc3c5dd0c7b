#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use procwire::process::{ProcessEvent, ProcessManager, RestartPolicy, SpawnOptions};
use procwire::value::Value;

#[tokio::test]
async fn spawn_and_roundtrip_request_over_control_channel() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempfile::tempdir()?;
    let worker = write_echo_worker(temp.path())?;

    let manager = ProcessManager::with_namespace("itest");
    let options = SpawnOptions::new(worker);
    manager.spawn("echo-worker", options).await?;

    let control = manager
        .control_channel("echo-worker")
        .expect("control channel present after spawn");

    let mut params = std::collections::BTreeMap::new();
    params.insert("text".to_string(), Value::String("hello".to_string()));
    let result = control
        .request("echo", Value::Map(params), Some(Duration::from_secs(5)))
        .await?;

    match result {
        Value::Map(map) => {
            assert_eq!(map.get("text"), Some(&Value::String("hello".to_string())));
        }
        other => panic!("expected a map result, got {other:?}"),
    }

    manager.terminate("echo-worker").await?;
    Ok(())
}

#[tokio::test]
async fn crash_loop_exhausts_restart_budget_and_reports_crash() -> Result<(), Box<dyn std::error::Error>> {
    let manager = ProcessManager::with_namespace("itest");
    let mut events = manager.subscribe();

    let mut options = SpawnOptions::new("/bin/bash");
    options.args = vec!["-c".into(), "exit 7".into()];
    options.restart_policy = RestartPolicy {
        enabled: true,
        max_restarts: 2,
        backoff: Duration::from_millis(5),
        max_backoff: Some(Duration::from_millis(20)),
    };

    manager.spawn("flaky", options).await?;

    let mut restarts = 0;
    let mut saw_crash = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(ProcessEvent::Restart { id, .. })) if id == "flaky" => restarts += 1,
            Ok(Ok(ProcessEvent::Crash { id })) if id == "flaky" => {
                saw_crash = true;
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    assert_eq!(restarts, 2, "expected exactly max_restarts restart attempts");
    assert!(saw_crash, "expected a final Crash event once the restart budget was exhausted");
    assert!(manager.status("flaky").is_none(), "exhausted entry should be removed from the table");
    Ok(())
}

fn write_echo_worker(dir: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let script_path = dir.join("echo_worker.py");
    let script = r#"#!/usr/bin/env python3
import json
import sys

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    request = json.loads(line)
    response = {
        "jsonrpc": "2.0",
        "id": request.get("id"),
        "result": request.get("params", {}),
    }
    sys.stdout.write(json.dumps(response) + "\n")
    sys.stdout.flush()
"#;
    fs::write(&script_path, script)?;
    let mut permissions = fs::metadata(&script_path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&script_path, permissions)?;
    Ok(script_path)
}
