//! Widget models mirrored from the widget comm channels.
//!
//! [`WidgetStateStore`] sits behind both widget comm targets and sees every
//! open, update and close for them through [`WidgetManager`]. Models are kept
//! in the order their comms opened, which is the order a frontend needs to
//! rebuild views that point at other models.

use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use jupyter_protocol::{JupyterMessage, JupyterMessageContent};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::comm::{CommChannel, WidgetManager};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetSnapshot {
    pub comm_id: String,
    pub target_name: String,
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

impl WidgetSnapshot {
    fn opened(channel: &CommChannel, data: Value, buffers: Vec<Vec<u8>>) -> Self {
        let state = match data {
            Value::Object(mut data) => data.remove("state").unwrap_or_else(empty_state),
            _ => empty_state(),
        };
        let field = |key: &str| state.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            comm_id: channel.comm_id.clone(),
            target_name: channel.target_name.clone(),
            model_module: field("_model_module"),
            model_name: field("_model_name"),
            state,
            buffers,
        }
    }

    fn apply_delta(&mut self, delta: &Value) {
        if let (Some(state), Some(delta)) = (self.state.as_object_mut(), delta.as_object()) {
            state.extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

/// Widget models for one notebook, in comm-open order.
#[derive(Default)]
pub struct WidgetStateStore {
    models: RwLock<Vec<WidgetSnapshot>>,
}

impl WidgetStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, comm_id: &str) -> Option<WidgetSnapshot> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.comm_id == comm_id)
            .cloned()
    }

    pub fn get_all(&self) -> Vec<WidgetSnapshot> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn models_mut(&self) -> RwLockWriteGuard<'_, Vec<WidgetSnapshot>> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WidgetManager for WidgetStateStore {
    fn handle_channel_open(&self, channel: &CommChannel, message: &JupyterMessage) {
        match &message.content {
            JupyterMessageContent::CommOpen(open) => {
                let data = serde_json::to_value(&open.data).unwrap_or_default();
                let buffers = message.buffers.iter().map(|b| b.to_vec()).collect();
                let opened = WidgetSnapshot::opened(channel, data, buffers);

                let mut models = self.models_mut();
                // A reopened comm keeps its original position.
                match models.iter_mut().find(|m| m.comm_id == channel.comm_id) {
                    Some(existing) => *existing = opened,
                    None => models.push(opened),
                }
            }
            JupyterMessageContent::CommMsg(msg) => {
                let data = serde_json::to_value(&msg.data).unwrap_or_default();
                if data.get("method").and_then(Value::as_str) != Some("update") {
                    return;
                }
                let Some(delta) = data.get("state") else {
                    return;
                };
                let mut models = self.models_mut();
                match models.iter_mut().find(|m| m.comm_id == channel.comm_id) {
                    Some(model) => model.apply_delta(delta),
                    None => debug!("[widgets] Update for unknown comm {}", channel.comm_id),
                }
            }
            JupyterMessageContent::CommClose(_) => {
                self.models_mut().retain(|m| m.comm_id != channel.comm_id);
            }
            _ => debug!(
                "[widgets] Ignoring {} on comm {}",
                message.header.msg_type, channel.comm_id
            ),
        }
    }
}

fn empty_state() -> Value {
    Value::Object(Default::default())
}
