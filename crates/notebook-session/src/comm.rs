//! Comm target registration and routing.
//!
//! Kernels open comm channels against a named target. Each session keeps a
//! [`CommDispatcher`] that maps target names to handlers and remembers which
//! handler owns each open channel, so later `comm_msg`/`comm_close` traffic
//! reaches the same place as the `comm_open` did.
//!
//! [`CommRouter`] wires the widget targets of a session to the widget
//! manager. Every event, open or not, goes through
//! [`WidgetManager::handle_channel_open`]; the widget manager decides what
//! kind of event it is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use log::{debug, info};

use crate::session::{KernelSession, SessionId};

/// Current ipywidgets comm target.
pub const WIDGET_TARGET: &str = "jupyter.widget";

/// Comm target used by ipywidgets before 7.0.
pub const LEGACY_WIDGET_TARGET: &str = "ipython.widget";

/// An open comm channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommChannel {
    pub comm_id: String,
    pub target_name: String,
    pub session_id: SessionId,
}

/// Handler invoked with the channel and the raw inbound message.
pub type CommHandler = Arc<dyn Fn(&CommChannel, &JupyterMessage) + Send + Sync>;

/// Target name -> handler. Re-registering a name replaces the handler.
#[derive(Default)]
pub struct CommTargetRegistry {
    targets: Mutex<HashMap<String, CommHandler>>,
}

impl CommTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `target_name`. Returns true if a previous
    /// handler was replaced.
    pub fn register(&self, target_name: &str, handler: CommHandler) -> bool {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target_name.to_string(), handler)
            .is_some()
    }

    pub fn get(&self, target_name: &str) -> Option<CommHandler> {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target_name)
            .cloned()
    }

    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

struct OpenChannel {
    channel: CommChannel,
    handler: CommHandler,
}

/// Per-session routing of inbound comm traffic.
pub struct CommDispatcher {
    session_id: SessionId,
    targets: CommTargetRegistry,
    channels: Mutex<HashMap<String, OpenChannel>>,
}

impl CommDispatcher {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            targets: CommTargetRegistry::new(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_target(&self, target_name: &str, handler: CommHandler) {
        if self.targets.register(target_name, handler) {
            debug!(
                "[comm] Replaced handler for target {} on session {}",
                target_name, self.session_id
            );
        }
    }

    pub fn targets(&self) -> &CommTargetRegistry {
        &self.targets
    }

    /// Route one inbound message. Returns true if a handler received it.
    pub fn dispatch(&self, message: &JupyterMessage) -> bool {
        let (channel, handler) = match &message.content {
            JupyterMessageContent::CommOpen(open) => {
                let Some(handler) = self.targets.get(&open.target_name) else {
                    debug!(
                        "[comm] No handler for target {} (comm_id={})",
                        open.target_name, open.comm_id.0
                    );
                    return false;
                };
                let channel = CommChannel {
                    comm_id: open.comm_id.0.clone(),
                    target_name: open.target_name.clone(),
                    session_id: self.session_id.clone(),
                };
                self.lock_channels().insert(
                    channel.comm_id.clone(),
                    OpenChannel {
                        channel: channel.clone(),
                        handler: handler.clone(),
                    },
                );
                (channel, handler)
            }
            JupyterMessageContent::CommMsg(msg) => {
                let channels = self.lock_channels();
                let Some(open) = channels.get(&msg.comm_id.0) else {
                    debug!("[comm] comm_msg for unknown comm_id={}", msg.comm_id.0);
                    return false;
                };
                (open.channel.clone(), open.handler.clone())
            }
            JupyterMessageContent::CommClose(close) => {
                let Some(open) = self.lock_channels().remove(&close.comm_id.0) else {
                    debug!("[comm] comm_close for unknown comm_id={}", close.comm_id.0);
                    return false;
                };
                (open.channel, open.handler)
            }
            _ => return false,
        };

        handler(&channel, message);
        true
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock_channels().len()
    }

    /// Forget all open channels. Called when the kernel goes away.
    pub fn clear(&self) {
        self.lock_channels().clear();
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, OpenChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Widget-management collaborator.
pub trait WidgetManager: Send + Sync {
    /// Sole entry point for all comm traffic on widget channels.
    fn handle_channel_open(&self, channel: &CommChannel, message: &JupyterMessage);
}

pub struct CommRouter {
    widgets: Arc<dyn WidgetManager>,
}

impl CommRouter {
    pub fn new(widgets: Arc<dyn WidgetManager>) -> Self {
        Self { widgets }
    }

    /// Register the widget targets on `session`.
    pub fn attach(&self, session: &dyn KernelSession) {
        for target_name in [LEGACY_WIDGET_TARGET, WIDGET_TARGET] {
            self.register(session, target_name);
        }
        info!(
            "[comm] Registered widget targets on session {}",
            session.id()
        );
    }

    fn register(&self, session: &dyn KernelSession, target_name: &str) {
        let widgets = self.widgets.clone();
        session.register_comm_target(
            target_name,
            Arc::new(move |channel, message| widgets.handle_channel_open(channel, message)),
        );
    }
}
