//! In-process session manager that launches kernels on this machine.
//!
//! Sessions outlive the containers that use them: closing a notebook without
//! shutting its kernel down leaves the session registered here, and reopening
//! the same path finds it again.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::{
    ConnectionInfo, JupyterMessage, JupyterMessageContent, KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use tokio::process::Child;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::comm::{CommDispatcher, CommHandler};
use crate::error::SessionError;
use crate::session::{KernelSession, SessionId, SessionManager, SessionStatus, StartOptions};

const KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct LocalSessionManager {
    sessions: Mutex<HashMap<SessionId, Arc<LocalKernelSession>>>,
}

impl LocalSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered sessions, including dead ones not yet pruned.
    pub fn sessions(&self) -> Vec<Arc<LocalKernelSession>> {
        self.lock().values().cloned().collect()
    }

    /// Drop sessions whose kernel is gone.
    pub fn prune(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.status().is_terminal());
        before - sessions.len()
    }

    fn register(&self, session: Arc<LocalKernelSession>) {
        let pruned = self.prune();
        if pruned > 0 {
            debug!("[local-kernel] Pruned {} dead session(s)", pruned);
        }
        self.lock().insert(session.id().clone(), session);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<LocalKernelSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionManager for LocalSessionManager {
    async fn find_by_path(&self, path: &Path) -> Result<SessionId, SessionError> {
        self.lock()
            .values()
            .find(|s| s.path() == path && !s.status().is_terminal())
            .map(|s| s.id().clone())
            .ok_or_else(|| SessionError::NotFound(path.to_path_buf()))
    }

    async fn connect(&self, id: &SessionId) -> Result<Arc<dyn KernelSession>, SessionError> {
        let session = self.lock().get(id).cloned();
        match session {
            Some(session) if !session.status().is_terminal() => Ok(session),
            Some(_) => Err(SessionError::Unreachable {
                id: id.clone(),
                reason: "kernel is dead".into(),
            }),
            None => Err(SessionError::Unreachable {
                id: id.clone(),
                reason: "unknown session".into(),
            }),
        }
    }

    async fn start(&self, options: StartOptions) -> Result<Arc<dyn KernelSession>, SessionError> {
        let session = Arc::new(LocalKernelSession::launch(options).await?);
        self.register(session.clone());
        Ok(session)
    }
}

/// A kernel process launched from a kernelspec, with its iopub listener.
pub struct LocalKernelSession {
    id: SessionId,
    kernel_name: String,
    display_name: String,
    path: PathBuf,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
    status: Arc<Mutex<SessionStatus>>,
    comms: Arc<CommDispatcher>,
    iopub_task: Mutex<Option<JoinHandle<()>>>,
    process: Mutex<Option<Child>>,
    process_group_id: Mutex<Option<i32>>,
}

impl LocalKernelSession {
    pub async fn launch(options: StartOptions) -> Result<Self, SessionError> {
        let kernelspec = runtimelib::find_kernelspec(&options.kernel_name)
            .await
            .map_err(start_failed)?;
        let display_name = kernelspec.kernelspec.display_name.clone();

        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await.map_err(start_failed)?;
        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(options.kernel_name.clone()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir)
            .await
            .map_err(start_failed)?;
        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(connection_file_name(&kernel_id));

        let cmd = kernelspec
            .command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))
            .map_err(start_failed)?;
        let plan = LaunchPlan {
            options,
            kernel_id,
            display_name,
            connection_info,
            connection_file,
        };
        Self::launch_with_command(cmd, plan).await
    }

    /// Write the connection file and run `cmd` against it. The file is
    /// removed again if the kernel does not come up.
    async fn launch_with_command(
        cmd: tokio::process::Command,
        plan: LaunchPlan,
    ) -> Result<Self, SessionError> {
        let contents =
            serde_json::to_string_pretty(&plan.connection_info).map_err(start_failed)?;
        tokio::fs::write(&plan.connection_file, contents)
            .await
            .map_err(start_failed)?;

        let connection_file = plan.connection_file.clone();
        match Self::spawn(cmd, plan).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(remove) = tokio::fs::remove_file(&connection_file).await {
                    debug!(
                        "[local-kernel] Could not remove {}: {}",
                        connection_file.display(),
                        remove
                    );
                }
                Err(e)
            }
        }
    }

    async fn spawn(mut cmd: tokio::process::Command, plan: LaunchPlan) -> Result<Self, SessionError> {
        let LaunchPlan {
            options,
            kernel_id,
            display_name,
            connection_info,
            connection_file,
        } = plan;
        cmd.current_dir(working_dir(&options.path));

        #[cfg(unix)]
        cmd.process_group(0);

        let process = cmd.kill_on_drop(true).spawn().map_err(start_failed)?;
        let process_group_id = process.id().map(|pid| pid as i32);
        info!(
            "[local-kernel] Launched {} kernel {} for {}",
            options.kernel_name,
            kernel_id,
            options.path.display()
        );

        let id = SessionId::new();
        let status = Arc::new(Mutex::new(SessionStatus::Starting));
        let comms = Arc::new(CommDispatcher::new(id.clone()));

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &id.0)
                .await
                .map_err(start_failed)?;
        let iopub_status = status.clone();
        let iopub_comms = comms.clone();
        let iopub_session = id.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        route_iopub(&iopub_session, &iopub_status, &iopub_comms, &message)
                    }
                    Err(e) => {
                        warn!("[local-kernel] iopub read error on {}: {}", iopub_session, e);
                        set_status(&iopub_status, SessionStatus::Dead);
                        iopub_comms.clear();
                        break;
                    }
                }
            }
        });

        let session = Self {
            id,
            kernel_name: options.kernel_name,
            display_name,
            path: options.path,
            connection_info,
            connection_file,
            status,
            comms,
            iopub_task: Mutex::new(Some(iopub_task)),
            process: Mutex::new(Some(process)),
            process_group_id: Mutex::new(process_group_id),
        };

        // Dropping `session` on failure aborts the listener and kills the kernel.
        session.wait_for_kernel_info().await?;
        if session.status() == SessionStatus::Starting {
            set_status(&session.status, SessionStatus::Idle);
        }
        Ok(session)
    }

    async fn wait_for_kernel_info(&self) -> Result<(), SessionError> {
        let identity = runtimelib::peer_identity_for_session(&self.id.0).map_err(start_failed)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &self.connection_info,
            &self.id.0,
            identity,
        )
        .await
        .map_err(start_failed)?;

        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await.map_err(start_failed)?;

        match tokio::time::timeout(KERNEL_INFO_TIMEOUT, shell.read()).await {
            Ok(Ok(reply)) => {
                info!(
                    "[local-kernel] Kernel {} alive: got {} reply",
                    self.id, reply.header.msg_type
                );
                Ok(())
            }
            Ok(Err(e)) => {
                error!("[local-kernel] Error reading kernel_info_reply: {}", e);
                Err(SessionError::StartFailed(format!(
                    "Kernel did not respond: {}",
                    e
                )))
            }
            Err(_) => {
                error!("[local-kernel] Timeout waiting for kernel_info_reply");
                Err(SessionError::StartFailed(format!(
                    "Kernel did not respond within {}s",
                    KERNEL_INFO_TIMEOUT.as_secs()
                )))
            }
        }
    }

    pub fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    pub fn open_comm_count(&self) -> usize {
        self.comms.open_channel_count()
    }

    fn stop_listener(&self) {
        if let Some(task) = self
            .iopub_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn kill_process_group(&self) -> Result<(), SessionError> {
        let pgid = self
            .process_group_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        #[cfg(unix)]
        if let Some(pgid) = pgid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!("[local-kernel] Failed to kill process group {}: {}", pgid, e);
                    return Err(SessionError::Shutdown(e.to_string()));
                }
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;

        Ok(())
    }
}

#[async_trait]
impl KernelSession for LocalKernelSession {
    fn id(&self) -> &SessionId {
        &self.id
    }

    fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    fn kernel_display_name(&self) -> String {
        self.display_name.clone()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_comm_target(&self, target_name: &str, handler: CommHandler) {
        self.comms.register_target(target_name, handler);
    }

    async fn shutdown(&self) -> Result<(), SessionError> {
        info!("[local-kernel] Shutting down session {}", self.id);
        set_status(&self.status, SessionStatus::Terminating);

        match runtimelib::create_client_control_connection(&self.connection_info, &self.id.0).await
        {
            Ok(mut control) => {
                let request: JupyterMessage = ShutdownRequest { restart: false }.into();
                if let Err(e) = control.send(request).await {
                    warn!("[local-kernel] Failed to send shutdown_request: {}", e);
                }
            }
            Err(e) => warn!("[local-kernel] No control connection for {}: {}", self.id, e),
        }

        self.stop_listener();
        let killed = self.kill_process_group();
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Err(e) = tokio::fs::remove_file(&self.connection_file).await {
            debug!(
                "[local-kernel] Could not remove {}: {}",
                self.connection_file.display(),
                e
            );
        }

        self.comms.clear();
        set_status(&self.status, SessionStatus::Dead);
        killed
    }
}

impl Drop for LocalKernelSession {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

/// Everything a launch needs besides the command itself.
struct LaunchPlan {
    options: StartOptions,
    kernel_id: String,
    display_name: String,
    connection_info: ConnectionInfo,
    connection_file: PathBuf,
}

fn route_iopub(
    session: &SessionId,
    status: &Mutex<SessionStatus>,
    comms: &CommDispatcher,
    message: &JupyterMessage,
) {
    match &message.content {
        JupyterMessageContent::Status(state) => {
            let next = SessionStatus::from(&state.execution_state);
            set_status(status, next);
            debug!("[local-kernel] Session {} is {}", session, next);
        }
        JupyterMessageContent::CommOpen(_)
        | JupyterMessageContent::CommMsg(_)
        | JupyterMessageContent::CommClose(_) => {
            if !comms.dispatch(message) {
                debug!(
                    "[local-kernel] Unrouted {} on session {}",
                    message.header.msg_type, session
                );
            }
        }
        _ => {}
    }
}

fn set_status(status: &Mutex<SessionStatus>, next: SessionStatus) {
    *status.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

fn start_failed(e: impl std::fmt::Display) -> SessionError {
    SessionError::StartFailed(e.to_string())
}

fn connection_file_name(kernel_id: &str) -> String {
    format!("nbsession-kernel-{}.json", kernel_id)
}

/// Kernels run in the notebook's directory.
fn working_dir(notebook: &Path) -> PathBuf {
    notebook
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(std::env::temp_dir)
}
