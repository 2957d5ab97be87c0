use anyhow::Result;
use interprocess::local_socket::{
    tokio::{prelude::*, Stream},
    GenericFilePath, ListenerOptions,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shared::{
    ChangeListResult, ConfirmParams, Event, InsertParams, MoveParams, NodeIdParams, RenameParams,
    Request, Response, TreeError, TreeSnapshot, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR,
    ROOT_ID, SERVER_ERROR,
};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::commit::{CommitOutcome, DeleteOutcome};
use crate::editor::TreeEditor;
use crate::gate::IpcConfirmGate;

pub type EventSender = broadcast::Sender<Event>;

pub struct IpcContext {
    pub editor: Arc<TreeEditor>,
    /// Absent when commits are auto-confirmed
    pub gate: Option<Arc<IpcConfirmGate>>,
    pub event_tx: EventSender,
}

pub async fn start_server(socket_path: &Path, ctx: Arc<IpcContext>) -> Result<()> {
    // Remove existing socket if present
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let name = socket_path.to_fs_name::<GenericFilePath>()?;
    let listener = ListenerOptions::new().name(name).create_tokio()?;

    info!("IPC server listening on {:?}", socket_path);

    loop {
        match listener.accept().await {
            Ok(stream) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        error!("Connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(stream: Stream, ctx: Arc<IpcContext>) -> Result<()> {
    info!("New client connected");

    let (reader, writer) = stream.split();
    serve_lines(reader, writer, ctx).await
}

async fn serve_lines<R, W>(reader: R, mut writer: W, ctx: Arc<IpcContext>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut event_rx = ctx.event_tx.subscribe();
    // Requests that can sit on a confirmation prompt answer through here
    let (response_tx, mut response_rx) = mpsc::channel::<Response>(32);

    let mut line = String::new();

    loop {
        tokio::select! {
            // Handle incoming requests
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => {
                        info!("Client disconnected");
                        break;
                    }
                    Ok(_) => {
                        let parsed = parse_request(&line);
                        line.clear();
                        match parsed {
                            Ok(request) if may_prompt(&request.method) => {
                                let ctx = ctx.clone();
                                let response_tx = response_tx.clone();
                                tokio::spawn(async move {
                                    let response = dispatch(&request, &ctx).await;
                                    let _ = response_tx.send(response).await;
                                });
                            }
                            Ok(request) => {
                                let response = dispatch(&request, &ctx).await;
                                let response_json = serde_json::to_string(&response)? + "\n";
                                writer.write_all(response_json.as_bytes()).await?;
                            }
                            Err(response) => {
                                let response_json = serde_json::to_string(&response)? + "\n";
                                writer.write_all(response_json.as_bytes()).await?;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error: {}", e);
                        break;
                    }
                }
            }

            Some(response) = response_rx.recv() => {
                let response_json = serde_json::to_string(&response)? + "\n";
                writer.write_all(response_json.as_bytes()).await?;
            }

            // Forward events to client
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        let event_json = serde_json::to_string(&event)? + "\n";
                        if let Err(e) = writer.write_all(event_json.as_bytes()).await {
                            warn!("Failed to send event: {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Gestures run inline in arrival order; only these may wait on the user.
fn may_prompt(method: &str) -> bool {
    matches!(method, "tree.commit" | "tree.remove")
}

fn parse_request(line: &str) -> Result<Request, Response> {
    serde_json::from_str(line.trim())
        .map_err(|e| Response::err(0, PARSE_ERROR, format!("Parse error: {}", e)))
}

fn parse_params<T: DeserializeOwned>(request: &Request) -> Result<T, Response> {
    serde_json::from_value(request.params.clone()).map_err(|e| {
        Response::err(request.id, INVALID_PARAMS, format!("Invalid params: {}", e))
    })
}

fn tree_error(id: u64, e: TreeError) -> Response {
    Response::err(id, SERVER_ERROR, e.to_string())
}

fn snapshot_value(snapshot: TreeSnapshot) -> Value {
    serde_json::to_value(snapshot).unwrap_or_default()
}

fn commit_value(outcome: &CommitOutcome) -> Value {
    match outcome {
        CommitOutcome::NoChanges => json!({"status": "no_changes"}),
        CommitOutcome::Committed {
            changes,
            committed,
            skipped,
            id_map,
        } => json!({
            "status": "committed",
            "changes": changes,
            "committed": committed,
            "skipped": skipped,
            "id_map": id_map,
        }),
        CommitOutcome::Rejected => json!({"status": "rejected"}),
        CommitOutcome::Failed { changes, error } => json!({
            "status": "failed",
            "changes": changes,
            "error": error,
        }),
        CommitOutcome::Busy => json!({"status": "busy"}),
    }
}

fn delete_value(outcome: &DeleteOutcome) -> Value {
    match outcome {
        DeleteOutcome::Deleted { removed, .. } => json!({"status": "deleted", "removed": removed}),
        DeleteOutcome::Rejected => json!({"status": "rejected"}),
        DeleteOutcome::Failed { error } => json!({"status": "failed", "error": error}),
        DeleteOutcome::Busy => json!({"status": "busy"}),
    }
}

async fn dispatch(request: &Request, ctx: &IpcContext) -> Response {
    debug!("Request {} {}", request.id, request.method);
    match handle_request(request, ctx).await {
        Ok(response) | Err(response) => response,
    }
}

async fn handle_request(request: &Request, ctx: &IpcContext) -> Result<Response, Response> {
    let id = request.id;
    let editor = &ctx.editor;

    let response = match request.method.as_str() {
        "daemon.ping" => Response::ok(id, json!({"status": "ok"})),

        "tree.get" => Response::ok(id, snapshot_value((&editor.snapshot().await).into())),

        "tree.refresh" => match editor.refresh().await {
            Ok(count) => Response::ok(id, json!({"count": count})),
            Err(e) => Response::err(id, SERVER_ERROR, format!("Failed to refresh: {}", e)),
        },

        "tree.can_drop" => {
            let params: MoveParams = parse_params(request)?;
            match editor.can_drop(&params.node_ids, params.target()).await {
                Ok(()) => Response::ok(id, json!({"allowed": true})),
                Err(e) => Response::ok(id, json!({"allowed": false, "reason": e.to_string()})),
            }
        }

        "tree.move" => {
            let params: MoveParams = parse_params(request)?;
            editor
                .move_nodes(&params.node_ids, params.target(), params.target_index)
                .await
                .map_err(|e| tree_error(id, e))?;
            Response::ok(id, snapshot_value((&editor.snapshot().await).into()))
        }

        "tree.insert" => {
            let params: InsertParams = parse_params(request)?;
            let parent = params.parent_id.as_deref().unwrap_or(ROOT_ID);
            let node_id = editor
                .insert(parent, params.seed)
                .await
                .map_err(|e| tree_error(id, e))?;
            Response::ok(id, json!({"node_id": node_id}))
        }

        "tree.rename" => {
            let params: RenameParams = parse_params(request)?;
            let status = editor
                .rename(&params.node_id, &params.name)
                .await
                .map_err(|e| tree_error(id, e))?;
            Response::ok(id, json!({"status": status}))
        }

        "tree.remove" => {
            let params: NodeIdParams = parse_params(request)?;
            let outcome = editor
                .remove(&params.node_id)
                .await
                .map_err(|e| tree_error(id, e))?;
            Response::ok(id, delete_value(&outcome))
        }

        "tree.diff" => {
            let changes = editor.pending_changes().await;
            Response::ok(
                id,
                serde_json::to_value(ChangeListResult { changes }).unwrap_or_default(),
            )
        }

        "tree.commit" => Response::ok(id, commit_value(&editor.commit().await)),

        "tree.discard" => {
            editor.discard().await;
            Response::ok(id, snapshot_value((&editor.snapshot().await).into()))
        }

        "commit.confirm" => {
            let params: ConfirmParams = parse_params(request)?;
            match &ctx.gate {
                Some(gate) => {
                    let delivered = gate.answer(params.accepted).await;
                    Response::ok(id, json!({"delivered": delivered}))
                }
                None => Response::err(id, SERVER_ERROR, "Commits are auto-confirmed"),
            }
        }

        "changes.last" => match editor.coordinator().journal().last() {
            Ok(batch) => Response::ok(id, json!({"batch": batch})),
            Err(e) => Response::err(id, SERVER_ERROR, format!("Failed to read journal: {}", e)),
        },

        "changes.clear" => match editor.coordinator().journal().clear() {
            Ok(()) => Response::ok(id, json!({"success": true})),
            Err(e) => Response::err(id, SERVER_ERROR, format!("Failed to clear journal: {}", e)),
        },

        _ => Response::err(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        ),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{CommitCoordinator, CommitSettings};
    use crate::config::Config;
    use crate::journal::testing::MemoryKvStore;
    use crate::journal::ChangeJournal;
    use crate::store::testing::MemoryStore;
    use shared::Normalizer;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};

    async fn context() -> (Arc<IpcContext>, broadcast::Receiver<Event>) {
        let store = Arc::new(MemoryStore::with_groups(&[
            ("A", "Alpha", None, 0),
            ("B", "Beta", None, 1),
        ]));
        let (event_tx, event_rx) = broadcast::channel(64);
        let gate = Arc::new(IpcConfirmGate::new(event_tx.clone()));
        let coordinator = CommitCoordinator::new(
            store.clone(),
            gate.clone(),
            ChangeJournal::new(Arc::new(MemoryKvStore::default())),
            CommitSettings::from_config(&Config::default()),
        );
        let editor = Arc::new(TreeEditor::new(
            store,
            Normalizer::default(),
            Arc::new(coordinator),
            event_tx.clone(),
        ));
        editor.refresh().await.unwrap();
        let ctx = Arc::new(IpcContext {
            editor,
            gate: Some(gate),
            event_tx,
        });
        (ctx, event_rx)
    }

    async fn call(ctx: &IpcContext, method: &str, params: Value) -> Response {
        let request = Request {
            id: 7,
            method: method.to_string(),
            params,
        };
        dispatch(&request, ctx).await
    }

    type ClientLines = Lines<BufReader<ReadHalf<DuplexStream>>>;

    /// Serve one in-memory connection; returns the client's halves.
    fn connect(ctx: Arc<IpcContext>) -> (ClientLines, WriteHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        tokio::spawn(serve_lines(server_read, server_write, ctx));
        let (client_read, client_write) = tokio::io::split(client);
        (BufReader::new(client_read).lines(), client_write)
    }

    /// Next line matching `pred`, skipping everything else.
    async fn next_matching(lines: &mut ClientLines, pred: impl Fn(&Value) -> bool) -> Value {
        loop {
            let line = lines.next_line().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            if pred(&value) {
                return value;
            }
        }
    }

    #[tokio::test]
    async fn test_parse_and_unknown_method_errors() {
        let (ctx, _rx) = context().await;
        let response = parse_request("not json").unwrap_err();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);

        let response = call(&ctx, "tree.shuffle", Value::Null).await;
        assert_eq!(response.id, 7);
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        let response = call(&ctx, "tree.move", json!({"node_ids": "A"})).await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_insert_then_diff() {
        let (ctx, _rx) = context().await;
        let params = json!({"parent_id": "A", "name": "Child"});
        let response = call(&ctx, "tree.insert", params).await;
        let node_id = response.result.unwrap()["node_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = call(&ctx, "tree.diff", Value::Null).await;
        let changes = &response.result.unwrap()["changes"];
        assert_eq!(changes[0]["id"], node_id.as_str());
        assert_eq!(changes[0]["kind"], "create");
    }

    #[tokio::test]
    async fn test_can_drop_reports_reason() {
        let (ctx, _rx) = context().await;
        let response = call(
            &ctx,
            "tree.can_drop",
            json!({"node_ids": ["A"], "target_parent_id": "A"}),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["allowed"], false);
        assert!(result["reason"].is_string());
    }

    #[tokio::test]
    async fn test_pipelined_moves_apply_in_order() {
        let (ctx, _rx) = context().await;
        let (mut lines, mut writer) = connect(ctx.clone());

        // B to the front, then A back in front of it: only the sent order
        // ends with A first
        let batch = concat!(
            r#"{"id":1,"method":"tree.move","params":{"node_ids":["B"],"target_index":0}}"#,
            "\n",
            r#"{"id":2,"method":"tree.move","params":{"node_ids":["A"],"target_index":0}}"#,
            "\n",
        );
        writer.write_all(batch.as_bytes()).await.unwrap();

        let first = next_matching(&mut lines, |v| v.get("id").is_some()).await;
        let second = next_matching(&mut lines, |v| v.get("id").is_some()).await;
        assert_eq!(first["id"], 1);
        assert_eq!(second["id"], 2);
        assert_eq!(ctx.editor.snapshot().await.root().children, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_commit_waits_for_confirm_request() {
        let (ctx, _rx) = context().await;
        let (mut lines, mut writer) = connect(ctx.clone());

        let batch = concat!(
            r#"{"id":1,"method":"tree.move","params":{"node_ids":["B"],"target_index":0}}"#,
            "\n",
            r#"{"id":2,"method":"tree.commit"}"#,
            "\n",
        );
        writer.write_all(batch.as_bytes()).await.unwrap();
        next_matching(&mut lines, |v| v["event"] == "commit.confirm_required").await;

        // The pending commit must not hold up the answer on the same connection
        let confirm = r#"{"id":3,"method":"commit.confirm","params":{"accepted":true}}"#;
        writer
            .write_all(format!("{}\n", confirm).as_bytes())
            .await
            .unwrap();

        let response = next_matching(&mut lines, |v| v["id"] == 2).await;
        assert_eq!(response["result"]["status"], "committed");

        let response = call(&ctx, "changes.last", Value::Null).await;
        let batch = &response.result.unwrap()["batch"];
        assert_eq!(batch["changes"].as_array().unwrap().len(), 2);
    }
}
