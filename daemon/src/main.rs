mod commit;
mod config;
mod editor;
mod gate;
mod ipc;
mod journal;
mod store;

use anyhow::Result;
use shared::{get_socket_path, get_state_dir, Event, Field, Normalizer};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::commit::{CommitCoordinator, CommitSettings};
use crate::config::load_config;
use crate::editor::TreeEditor;
use crate::gate::{AutoConfirm, ConfirmGate, IpcConfirmGate};
use crate::ipc::{start_server, IpcContext};
use crate::journal::{ChangeJournal, EventAction, FileKvStore};
use crate::store::JsonFileStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level)),
        )
        .init();

    info!("Group tree daemon starting...");

    let state_dir = get_state_dir()?;
    let id_attribute = config.attributes.attribute_name(Field::Id).to_string();
    let store = Arc::new(JsonFileStore::open(state_dir.join("groups.json"), id_attribute)?);
    let journal = ChangeJournal::new(Arc::new(FileKvStore::new(state_dir.join("kv"))?));

    let (event_tx, _) = broadcast::channel::<Event>(100);

    let ipc_gate = (!config.commit.auto_confirm)
        .then(|| Arc::new(IpcConfirmGate::new(event_tx.clone())));
    let gate: Arc<dyn ConfirmGate> = match &ipc_gate {
        Some(gate) => gate.clone(),
        None => {
            info!("Structural commits are auto-confirmed");
            Arc::new(AutoConfirm)
        }
    };

    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
    let coordinator = CommitCoordinator::new(
        store.clone(),
        gate,
        journal,
        CommitSettings::from_config(&config),
    )
    .with_action(Arc::new(EventAction::new(event_tx.clone())))
    .with_refresh_notifier(refresh_tx);

    let editor = Arc::new(TreeEditor::new(
        store,
        Normalizer::new(config.attributes.clone()),
        Arc::new(coordinator),
        event_tx.clone(),
    ));

    let count = editor.refresh().await?;
    info!("Loaded {} groups", count);

    // Rebuild the base snapshot once a committed batch has been reloaded
    {
        let editor = editor.clone();
        tokio::spawn(async move {
            while refresh_rx.recv().await.is_some() {
                if let Err(e) = editor.refresh().await {
                    error!("Refresh after commit failed: {}", e);
                }
            }
        });
    }

    let ctx = Arc::new(IpcContext {
        editor,
        gate: ipc_gate,
        event_tx,
    });
    let socket_path = get_socket_path()?;

    start_server(&socket_path, ctx).await?;

    Ok(())
}
