//! End-to-end lifecycle tests driven through stub collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use tempfile::TempDir;
use tokio::sync::Notify;

use notebook_session::comm::{
    CommChannel, CommDispatcher, CommHandler, WidgetManager, LEGACY_WIDGET_TARGET, WIDGET_TARGET,
};
use notebook_session::error::PromptDismissed;
use notebook_session::kernelspec::{KernelspecCatalog, KernelspecInfo, KernelspecMap};
use notebook_session::prompt::{ConfirmPrompt, Dialog, PromptResponse};
use notebook_session::session::StartOptions;
use notebook_session::settings::Settings;
use notebook_session::{
    Collaborators, ContainerState, DocumentError, KernelSession, LifecycleCoordinator,
    LifecycleError, SessionError, SessionId, SessionManager, SessionStatus,
};

const PYTHON_NOTEBOOK: &str = r#"{
  "cells": [
    {
      "cell_type": "code",
      "id": "setup",
      "metadata": {},
      "execution_count": null,
      "outputs": [],
      "source": ["import ipywidgets as w"]
    }
  ],
  "metadata": {
    "kernelspec": {"name": "python3", "display_name": "Python 3", "language": "python"}
  },
  "nbformat": 4,
  "nbformat_minor": 5
}"#;

const CUSTOM_R_NOTEBOOK: &str = r#"{
  "cells": [],
  "metadata": {
    "kernelspec": {"name": "r-custom", "display_name": "R (custom)", "language": "R"}
  },
  "nbformat": 4,
  "nbformat_minor": 5
}"#;

struct StubSession {
    id: SessionId,
    kernel_name: String,
    path: PathBuf,
    status: Mutex<SessionStatus>,
    comms: CommDispatcher,
    shutdowns: AtomicUsize,
}

impl StubSession {
    fn new(kernel_name: &str, path: &Path) -> Self {
        let id = SessionId::new();
        Self {
            comms: CommDispatcher::new(id.clone()),
            id,
            kernel_name: kernel_name.to_string(),
            path: path.to_path_buf(),
            status: Mutex::new(SessionStatus::Idle),
            shutdowns: AtomicUsize::new(0),
        }
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelSession for StubSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    fn kernel_display_name(&self) -> String {
        format!("{} (stub)", self.kernel_name)
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }

    fn register_comm_target(&self, target_name: &str, handler: CommHandler) {
        self.comms.register_target(target_name, handler);
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.set_status(SessionStatus::Dead);
        Ok(())
    }
}

#[derive(Default)]
struct StubManager {
    by_path: Mutex<HashMap<PathBuf, Arc<StubSession>>>,
    starts: Mutex<Vec<StartOptions>>,
    connects: AtomicUsize,
    fail_start: bool,
    start_gate: Option<Arc<Notify>>,
}

impl StubManager {
    fn with_session(session: Arc<StubSession>) -> Self {
        let manager = Self::default();
        manager
            .by_path
            .lock()
            .unwrap()
            .insert(session.path.clone(), session);
        manager
    }

    fn session_for(&self, path: &Path) -> Arc<StubSession> {
        self.by_path.lock().unwrap().get(path).cloned().unwrap()
    }

    fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionManager for StubManager {
    async fn find_by_path(&self, path: &Path) -> Result<SessionId, SessionError> {
        self.by_path
            .lock()
            .unwrap()
            .get(path)
            .filter(|s| !s.status().is_terminal())
            .map(|s| s.id.clone())
            .ok_or_else(|| SessionError::NotFound(path.to_path_buf()))
    }

    async fn connect(&self, id: &SessionId) -> Result<Arc<dyn KernelSession>, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let found = self
            .by_path
            .lock()
            .unwrap()
            .values()
            .find(|s| &s.id == id)
            .cloned();
        match found {
            Some(session) => Ok(session),
            None => Err(SessionError::Unreachable {
                id: id.clone(),
                reason: "unknown".into(),
            }),
        }
    }

    async fn start(&self, options: StartOptions) -> Result<Arc<dyn KernelSession>, SessionError> {
        self.starts.lock().unwrap().push(options.clone());
        if let Some(gate) = &self.start_gate {
            gate.notified().await;
        }
        if self.fail_start {
            return Err(SessionError::StartFailed("kernel exited".into()));
        }
        let session = Arc::new(StubSession::new(&options.kernel_name, &options.path));
        self.by_path
            .lock()
            .unwrap()
            .insert(options.path, session.clone());
        Ok(session)
    }
}

struct StubCatalog;

#[async_trait]
impl KernelspecCatalog for StubCatalog {
    async fn fetch_all(&self) -> Result<KernelspecMap, SessionError> {
        let specs = [
            ("python3", "Python 3", "python"),
            ("ir", "R", "R"),
        ];
        Ok(specs
            .into_iter()
            .map(|(name, display_name, language)| {
                (
                    name.to_string(),
                    KernelspecInfo {
                        name: name.to_string(),
                        display_name: display_name.to_string(),
                        language: language.to_string(),
                    },
                )
            })
            .collect())
    }
}

#[derive(Default)]
struct RecordingWidgets {
    events: Mutex<Vec<(CommChannel, JupyterMessage)>>,
}

impl RecordingWidgets {
    fn msg_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.header.msg_type.clone())
            .collect()
    }
}

impl WidgetManager for RecordingWidgets {
    fn handle_channel_open(&self, channel: &CommChannel, message: &JupyterMessage) {
        self.events
            .lock()
            .unwrap()
            .push((channel.clone(), message.clone()));
    }
}

/// Prompt that answers with fixed text, or dismisses when `answer` is None.
struct ScriptedPrompt {
    answer: Option<&'static str>,
    dialogs: Mutex<Vec<Dialog>>,
}

impl ScriptedPrompt {
    fn answering(answer: Option<&'static str>) -> Self {
        Self {
            answer,
            dialogs: Mutex::new(Vec::new()),
        }
    }

    fn shown(&self) -> usize {
        self.dialogs.lock().unwrap().len()
    }
}

#[async_trait]
impl ConfirmPrompt for ScriptedPrompt {
    async fn show(&self, dialog: Dialog) -> Result<PromptResponse, PromptDismissed> {
        self.dialogs.lock().unwrap().push(dialog);
        match self.answer {
            Some(text) => Ok(PromptResponse::new(text)),
            None => Err(PromptDismissed("closed".into())),
        }
    }
}

struct Harness {
    coordinator: LifecycleCoordinator,
    manager: Arc<StubManager>,
    widgets: Arc<RecordingWidgets>,
    prompt: Arc<ScriptedPrompt>,
    dir: TempDir,
}

impl Harness {
    fn new(manager: StubManager, answer: Option<&'static str>) -> Self {
        Self::with_settings(manager, answer, Settings::default())
    }

    fn with_settings(manager: StubManager, answer: Option<&'static str>, settings: Settings) -> Self {
        let manager = Arc::new(manager);
        let widgets = Arc::new(RecordingWidgets::default());
        let prompt = Arc::new(ScriptedPrompt::answering(answer));
        let coordinator = LifecycleCoordinator::new(
            Collaborators {
                sessions: manager.clone(),
                kernelspecs: Arc::new(StubCatalog),
                widgets: widgets.clone(),
                prompt: prompt.clone(),
            },
            &settings,
        );
        Self {
            coordinator,
            manager,
            widgets,
            prompt,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn notebook(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

fn message(msg_type: &str, content: serde_json::Value) -> JupyterMessage {
    let content = JupyterMessageContent::from_type_and_content(msg_type, content).unwrap();
    JupyterMessage::new(content, None)
}

#[tokio::test]
async fn test_open_reuses_running_session_without_starting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("analysis.ipynb");
    std::fs::write(&path, PYTHON_NOTEBOOK).unwrap();
    let existing = Arc::new(StubSession::new("python3", &path));
    let harness = Harness::new(StubManager::with_session(existing.clone()), Some("OK"));

    let id = harness.coordinator.open(&path).await.unwrap();

    let session = harness.coordinator.current_session(id).unwrap();
    assert_eq!(session.id(), &existing.id);
    assert_eq!(harness.manager.start_count(), 0);
    assert_eq!(harness.manager.connects.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.coordinator.container(id).unwrap().state(),
        ContainerState::SessionAttached
    );
}

#[tokio::test]
async fn test_open_starts_one_session_with_declared_kernel() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("fresh.ipynb", PYTHON_NOTEBOOK);

    let id = harness.coordinator.open(&path).await.unwrap();

    let starts = harness.manager.starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].kernel_name, "python3");
    assert_eq!(starts[0].path, path);
    assert_eq!(
        harness.coordinator.current_session(id).unwrap().kernel_name(),
        "python3"
    );
}

#[tokio::test]
async fn test_open_falls_back_to_language_match() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("stats.ipynb", CUSTOM_R_NOTEBOOK);

    harness.coordinator.open(&path).await.unwrap();

    let starts = harness.manager.starts.lock().unwrap();
    assert_eq!(starts[0].kernel_name, "ir");
}

#[tokio::test]
async fn test_dirty_flags_are_idempotent_and_isolated() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let a = harness
        .coordinator
        .open(harness.notebook("a.ipynb", PYTHON_NOTEBOOK))
        .await
        .unwrap();
    let b = harness
        .coordinator
        .open(harness.notebook("b.ipynb", PYTHON_NOTEBOOK))
        .await
        .unwrap();
    assert!(!harness.coordinator.is_dirty(a));
    assert!(!harness.coordinator.is_dirty(b));

    let model_a = harness.coordinator.current_model(a).unwrap();
    model_a.set_dirty(true);
    model_a.set_dirty(true);
    assert!(harness.coordinator.is_dirty(a));
    assert!(!harness.coordinator.is_dirty(b));

    let container_b = harness.coordinator.container(b).unwrap();
    assert!(container_b.cells().update_cell_source("setup", "x = 2"));
    model_a.set_dirty(false);
    assert!(!harness.coordinator.is_dirty(a));
    assert!(harness.coordinator.is_dirty(b));
    assert_eq!(harness.coordinator.dirty_containers(), vec![b]);
}

#[tokio::test]
async fn test_save_writes_content_and_clears_dirty() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("save.ipynb", PYTHON_NOTEBOOK);
    let id = harness.coordinator.open(&path).await.unwrap();

    let container = harness.coordinator.container(id).unwrap();
    container.cells().update_cell_source("setup", "print('saved')");
    assert!(harness.coordinator.is_dirty(id));

    harness.coordinator.save(id).await.unwrap();

    assert!(!harness.coordinator.is_dirty(id));
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("print('saved')"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_edit_during_save_keeps_unsaved_work() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("racing.ipynb", PYTHON_NOTEBOOK);
    let id = harness.coordinator.open(&path).await.unwrap();
    let container = harness.coordinator.container(id).unwrap();

    for i in 0..50 {
        let text = format!("print({i})");
        let (saved, _) = tokio::join!(harness.coordinator.save(id), async {
            for _ in 0..(i % 4) {
                tokio::task::yield_now().await;
            }
            container.cells().update_cell_source("setup", &text);
        });
        saved.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(
            harness.coordinator.is_dirty(id) || written.contains(&text),
            "edit {i} was neither written nor left dirty"
        );

        harness.coordinator.save(id).await.unwrap();
        assert!(!harness.coordinator.is_dirty(id));
    }
}

#[tokio::test]
async fn test_open_same_path_returns_existing_container() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("shared.ipynb", PYTHON_NOTEBOOK);

    let first = harness.coordinator.open(&path).await.unwrap();
    let second = harness.coordinator.open(&path).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.manager.start_count(), 1);
    assert_eq!(harness.coordinator.open_containers(), vec![first]);

    let outcome = harness.coordinator.close(first).await.unwrap();
    assert!(outcome.shutdown);
    assert!(harness.coordinator.open_containers().is_empty());
    assert_eq!(harness.manager.session_for(&path).shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_with_dead_session_skips_prompt() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("dead.ipynb", PYTHON_NOTEBOOK);
    let id = harness.coordinator.open(&path).await.unwrap();
    let session = harness.manager.session_for(&path);
    session.set_status(SessionStatus::Dead);
    let container = harness.coordinator.container(id).unwrap();

    let outcome = harness.coordinator.close(id).await.unwrap();

    assert!(!outcome.prompted);
    assert!(!outcome.shutdown);
    assert_eq!(harness.prompt.shown(), 0);
    assert_eq!(session.shutdown_count(), 0);
    assert_eq!(container.state(), ContainerState::Closed);
    assert!(harness.coordinator.container(id).is_none());
}

#[tokio::test]
async fn test_close_without_session_skips_prompt() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let container = harness.coordinator.create(harness.dir.path().join("draft.ipynb"));
    harness
        .coordinator
        .populate_from(container.id(), PYTHON_NOTEBOOK)
        .unwrap();

    let outcome = harness.coordinator.close(container.id()).await.unwrap();

    assert_eq!(outcome, Default::default());
    assert_eq!(harness.prompt.shown(), 0);
    assert_eq!(container.state(), ContainerState::Closed);
    assert_eq!(container.model().listener_count(), 0);
}

#[tokio::test]
async fn test_close_affirmative_shuts_down_once() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("live.ipynb", PYTHON_NOTEBOOK);
    let id = harness.coordinator.open(&path).await.unwrap();
    let session = harness.manager.session_for(&path);
    let container = harness.coordinator.container(id).unwrap();

    let outcome = harness.coordinator.close(id).await.unwrap();

    assert!(outcome.prompted);
    assert!(outcome.shutdown);
    assert_eq!(session.shutdown_count(), 1);
    assert_eq!(container.state(), ContainerState::Closed);
    assert!(container.session().is_none());

    let dialogs = harness.prompt.dialogs.lock().unwrap();
    assert_eq!(dialogs.len(), 1);
    assert_eq!(dialogs[0].title, "Shut down kernel?");
    assert!(dialogs[0].body.contains("python3 (stub)"));
    assert!(dialogs[0].body.contains("live.ipynb"));
    assert_eq!(dialogs[0].host, id);
}

#[tokio::test]
async fn test_close_declined_keeps_session_for_reopen() {
    let harness = Harness::new(StubManager::default(), Some("Cancel"));
    let path = harness.notebook("keep.ipynb", PYTHON_NOTEBOOK);
    let id = harness.coordinator.open(&path).await.unwrap();
    let session = harness.manager.session_for(&path);
    let container = harness.coordinator.container(id).unwrap();

    let outcome = harness.coordinator.close(id).await.unwrap();

    assert!(outcome.prompted);
    assert!(!outcome.shutdown);
    assert_eq!(session.shutdown_count(), 0);
    assert_eq!(container.state(), ContainerState::Closed);

    let reopened = harness.coordinator.open(&path).await.unwrap();
    assert_ne!(reopened, id);
    assert_eq!(
        harness.coordinator.current_session(reopened).unwrap().id(),
        &session.id
    );
    assert_eq!(harness.manager.start_count(), 1);
}

#[tokio::test]
async fn test_dismissed_prompt_counts_as_decline() {
    let harness = Harness::new(StubManager::default(), None);
    let path = harness.notebook("dismiss.ipynb", PYTHON_NOTEBOOK);
    let id = harness.coordinator.open(&path).await.unwrap();

    let outcome = harness.coordinator.close(id).await.unwrap();

    assert!(outcome.prompted);
    assert!(!outcome.shutdown);
    assert_eq!(harness.manager.session_for(&path).shutdown_count(), 0);
}

#[tokio::test]
async fn test_close_without_confirmation_setting_shuts_down() {
    let settings = Settings {
        confirm_shutdown_on_close: false,
        ..Settings::default()
    };
    let harness = Harness::with_settings(StubManager::default(), Some("Cancel"), settings);
    let path = harness.notebook("auto.ipynb", PYTHON_NOTEBOOK);
    let id = harness.coordinator.open(&path).await.unwrap();

    let outcome = harness.coordinator.close(id).await.unwrap();

    assert!(!outcome.prompted);
    assert!(outcome.shutdown);
    assert_eq!(harness.prompt.shown(), 0);
}

#[tokio::test]
async fn test_widget_comm_traffic_reaches_widget_manager() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("widgets.ipynb", PYTHON_NOTEBOOK);
    harness.coordinator.open(&path).await.unwrap();
    let session = harness.manager.session_for(&path);

    assert_eq!(
        session.comms.targets().target_names(),
        vec![LEGACY_WIDGET_TARGET, WIDGET_TARGET]
    );

    let open = message(
        "comm_open",
        serde_json::json!({
            "comm_id": "slider",
            "target_name": WIDGET_TARGET,
            "data": {"state": {"value": 3}},
        }),
    );
    let update = message(
        "comm_msg",
        serde_json::json!({
            "comm_id": "slider",
            "data": {"method": "update", "state": {"value": 4}},
        }),
    );
    let close = message("comm_close", serde_json::json!({"comm_id": "slider", "data": {}}));
    assert!(session.comms.dispatch(&open));
    assert!(session.comms.dispatch(&update));
    assert!(session.comms.dispatch(&close));

    assert_eq!(
        harness.widgets.msg_types(),
        vec!["comm_open", "comm_msg", "comm_close"]
    );
    let events = harness.widgets.events.lock().unwrap();
    let (channel, forwarded) = &events[1];
    assert_eq!(channel.comm_id, "slider");
    assert_eq!(channel.target_name, WIDGET_TARGET);
    assert_eq!(channel.session_id, session.id);
    assert_eq!(forwarded.header.msg_id, update.header.msg_id);
    match &forwarded.content {
        JupyterMessageContent::CommMsg(msg) => {
            let data = serde_json::to_value(&msg.data).unwrap();
            assert_eq!(data["state"]["value"], 4);
        }
        other => panic!("unexpected content: {other:?}"),
    }
}

#[tokio::test]
async fn test_legacy_widget_target_is_routed() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("legacy.ipynb", PYTHON_NOTEBOOK);
    harness.coordinator.open(&path).await.unwrap();
    let session = harness.manager.session_for(&path);

    let open = message(
        "comm_open",
        serde_json::json!({
            "comm_id": "old",
            "target_name": LEGACY_WIDGET_TARGET,
            "data": {},
        }),
    );
    assert!(session.comms.dispatch(&open));

    let events = harness.widgets.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0.target_name, LEGACY_WIDGET_TARGET);
}

#[tokio::test]
async fn test_failed_start_releases_container() {
    let manager = StubManager {
        fail_start: true,
        ..Default::default()
    };
    let harness = Harness::new(manager, Some("OK"));
    let path = harness.notebook("broken.ipynb", PYTHON_NOTEBOOK);

    let err = harness.coordinator.open(&path).await.unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Session(SessionError::StartFailed(_))
    ));
    assert!(harness.coordinator.open_containers().is_empty());
    assert!(harness.coordinator.find_by_path(&path).is_none());
}

#[tokio::test]
async fn test_missing_file_is_reported_and_released() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.dir.path().join("missing.ipynb");

    let err = harness.coordinator.open(&path).await.unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Document(DocumentError::Read { .. })
    ));
    assert!(harness.coordinator.open_containers().is_empty());
    assert_eq!(harness.manager.start_count(), 0);
}

#[tokio::test]
async fn test_invalid_content_leaves_container_created() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let container = harness.coordinator.create(harness.dir.path().join("bad.ipynb"));

    let err = harness
        .coordinator
        .populate_from(container.id(), "not json")
        .unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Document(DocumentError::Parse(_))
    ));
    assert_eq!(container.state(), ContainerState::Created);
}

#[tokio::test]
async fn test_attach_requires_populated_container() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let path = harness.notebook("twice.ipynb", PYTHON_NOTEBOOK);
    let id = harness.coordinator.open(&path).await.unwrap();

    let err = match harness.coordinator.attach_session(id).await {
        Ok(_) => panic!("second attach should be rejected"),
        Err(e) => e,
    };

    assert!(matches!(
        err,
        LifecycleError::InvalidState {
            actual: ContainerState::SessionAttached,
            ..
        }
    ));
    assert_eq!(harness.manager.start_count(), 1);
}

#[tokio::test]
async fn test_close_unknown_container_fails() {
    let harness = Harness::new(StubManager::default(), Some("OK"));
    let container = harness.coordinator.create(harness.dir.path().join("x.ipynb"));
    let id = container.id();
    harness.coordinator.close(id).await.unwrap();

    let err = harness.coordinator.close(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::UnknownContainer(other) if other == id));
}

#[tokio::test]
async fn test_close_during_resolution_is_rejected() {
    let gate = Arc::new(Notify::new());
    let manager = StubManager {
        start_gate: Some(gate.clone()),
        ..Default::default()
    };
    let harness = Harness::new(manager, Some("OK"));
    let path = harness.notebook("slow.ipynb", PYTHON_NOTEBOOK);
    let coordinator = &harness.coordinator;

    let (opened, rejected) = tokio::join!(coordinator.open(&path), async {
        let id = loop {
            let resolving = coordinator
                .open_containers()
                .first()
                .copied()
                .filter(|id| coordinator.container(*id).is_some_and(|c| c.is_resolving()));
            if let Some(id) = resolving {
                break id;
            }
            tokio::task::yield_now().await;
        };
        let rejected = coordinator.close(id).await;
        gate.notify_one();
        (id, rejected)
    });

    let (pending_id, rejected) = rejected;
    assert!(matches!(
        rejected,
        Err(LifecycleError::ResolutionPending(id)) if id == pending_id
    ));

    let id = opened.unwrap();
    assert_eq!(id, pending_id);
    assert_eq!(
        coordinator.container(id).unwrap().state(),
        ContainerState::SessionAttached
    );
    assert!(coordinator.close(id).await.unwrap().shutdown);
}

#[tokio::test]
async fn test_dropped_open_releases_container() {
    let manager = StubManager {
        start_gate: Some(Arc::new(Notify::new())),
        ..Default::default()
    };
    let harness = Harness::new(manager, Some("OK"));
    let path = harness.notebook("abandoned.ipynb", PYTHON_NOTEBOOK);

    let opened =
        tokio::time::timeout(Duration::from_millis(50), harness.coordinator.open(&path)).await;

    assert!(opened.is_err());
    assert_eq!(harness.manager.start_count(), 1);
    assert!(harness.coordinator.open_containers().is_empty());
    assert!(harness.coordinator.find_by_path(&path).is_none());
}

#[tokio::test]
async fn test_dropped_attach_clears_resolving() {
    let manager = StubManager {
        start_gate: Some(Arc::new(Notify::new())),
        ..Default::default()
    };
    let harness = Harness::new(manager, Some("OK"));
    let path = harness.notebook("stalled.ipynb", PYTHON_NOTEBOOK);
    let container = harness.coordinator.create(&path);
    let id = container.id();
    harness.coordinator.populate(id).await.unwrap();

    let attached =
        tokio::time::timeout(Duration::from_millis(50), harness.coordinator.attach_session(id))
            .await;

    assert!(attached.is_err());
    assert!(!container.is_resolving());
    let outcome = harness.coordinator.close(id).await.unwrap();
    assert!(!outcome.prompted);
    assert_eq!(container.state(), ContainerState::Closed);
    assert!(harness.coordinator.open_containers().is_empty());
}
