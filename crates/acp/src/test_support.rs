use std::{path::PathBuf, sync::Arc};

use crate::{
    client::{AgentConnection, ConnectOptions},
    handler::Handler,
    registry::{OrphanRegistry, REGISTRY_FILE_NAME},
    supervisor::PeerProcessConfig,
};

/// Writes an executable fake ACP agent. It prints one diagnostic noise line
/// on startup, answers the agent-routed methods, and exposes scripted
/// behaviors through the prompt text: `exit:<code>` dies immediately,
/// `read:<path>` round-trips an `fs/read_text_file` request through the
/// client, `hang` never answers (until `session/cancel`).
pub(crate) fn write_fake_agent() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-acp-agent");
    let script = r#"#!/usr/bin/env python3
import json
import sys

print("DEBUG: starting agent", flush=True)

pending_reads = {}
hanging = []

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

def prompt_text(params):
    for block in params.get("prompt") or []:
        if block.get("type") == "text":
            return block.get("text", "")
    return ""

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    msg_id = msg.get("id")

    if method is None and msg_id is not None:
        waiter = pending_reads.pop(str(msg_id), None)
        if waiter is None:
            continue
        if "error" in msg:
            send({"jsonrpc": "2.0", "id": waiter, "error": msg["error"]})
        else:
            content = msg.get("result", {}).get("content", "")
            send({"jsonrpc": "2.0", "id": waiter, "result": {"stopReason": "end_turn", "content": content}})
        continue

    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"protocolVersion": 1}})
    elif method == "session/new":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"sessionId": "sess-1"}})
    elif method == "session/load":
        session = msg.get("params", {}).get("sessionId", "")
        if session == "sess-live":
            send({"jsonrpc": "2.0", "id": msg_id, "error": {"code": -32000, "message": "Session is already active"}})
        else:
            send({"jsonrpc": "2.0", "id": msg_id, "result": {}})
    elif method == "session/prompt":
        text = prompt_text(msg.get("params", {}))
        if text.startswith("exit:"):
            sys.exit(int(text.split(":", 1)[1]))
        elif text.startswith("read:"):
            path = text.split(":", 1)[1]
            read_id = "read-%s" % msg_id
            pending_reads[read_id] = msg_id
            send({"jsonrpc": "2.0", "id": read_id, "method": "fs/read_text_file", "params": {"sessionId": "sess-1", "path": path}})
        elif text == "hang":
            hanging.append(msg_id)
        else:
            send({"jsonrpc": "2.0", "method": "session/update", "params": {"sessionId": "sess-1", "update": {"kind": "progress"}}})
            send({"jsonrpc": "2.0", "id": msg_id, "result": {"stopReason": "end_turn"}})
    elif method == "session/cancel":
        for prompt_id in hanging:
            send({"jsonrpc": "2.0", "id": prompt_id, "error": {"code": -32800, "message": "cancelled"}})
        hanging = []
    elif msg_id is not None:
        send({"jsonrpc": "2.0", "id": msg_id, "error": {"code": -32601, "message": "method not found: %s" % method}})
"#;

    std::fs::write(&script_path, script).expect("write script");
    make_executable(&script_path);
    (dir, script_path)
}

pub(crate) fn make_executable(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}

/// Spawns the fake agent with a registry isolated to its tempdir.
pub(crate) async fn connect_fake_agent(
    handler: Option<Arc<dyn Handler>>,
) -> (tempfile::TempDir, AgentConnection) {
    let (dir, script) = write_fake_agent();
    let registry = Arc::new(OrphanRegistry::new(dir.path().join(REGISTRY_FILE_NAME)));
    let options = ConnectOptions {
        handler,
        reap_orphans: false,
        registry: Some(registry),
        ..ConnectOptions::default()
    };
    let connection = AgentConnection::connect(PeerProcessConfig::new(script), options)
        .await
        .expect("connect fake agent");
    (dir, connection)
}
