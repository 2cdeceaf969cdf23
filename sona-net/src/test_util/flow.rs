use crate::error::FlowError;
use crate::flow::{FlowProgram, FlowRule, PacketEmitter};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
struct ProgramState {
    installed: HashSet<FlowRule>,
    ops: Vec<(bool, FlowRule)>,
    failing: HashSet<String>,
}

/// Keeps the set of installed rules and a log of every applied operation.
///
/// Devices marked with [`RecordingFlowProgram::fail_device`] reject all
/// operations.
#[derive(Default)]
pub struct RecordingFlowProgram {
    state: Mutex<ProgramState>,
}

impl RecordingFlowProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed(&self) -> Vec<FlowRule> {
        self.state.lock().unwrap().installed.iter().cloned().collect()
    }

    pub fn installed_on(&self, device_id: &str) -> Vec<FlowRule> {
        self.state
            .lock()
            .unwrap()
            .installed
            .iter()
            .filter(|rule| rule.device_id == device_id)
            .cloned()
            .collect()
    }

    pub fn is_installed(&self, rule: &FlowRule) -> bool {
        self.state.lock().unwrap().installed.contains(rule)
    }

    /// Every successful operation in order; `true` means install.
    pub fn ops(&self) -> Vec<(bool, FlowRule)> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    pub fn fail_device(&self, device_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(device_id.to_string());
    }

    pub fn heal_device(&self, device_id: &str) {
        self.state.lock().unwrap().failing.remove(device_id);
    }
}

#[async_trait]
impl FlowProgram for RecordingFlowProgram {
    async fn apply(&self, rule: &FlowRule, install: bool) -> Result<(), FlowError> {
        let mut state = self.state.lock().unwrap();
        if state.failing.contains(&rule.device_id) {
            return Err(FlowError::Rejected {
                device_id: rule.device_id.clone(),
                reason: "device unavailable".to_string(),
            });
        }
        state.ops.push((install, rule.clone()));
        if install {
            state.installed.insert(rule.clone());
        } else {
            state.installed.remove(rule);
        }
        Ok(())
    }
}

/// A frame handed to the emitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedFrame {
    pub device_id: String,
    pub port: u32,
    pub frame: Vec<u8>,
}

#[derive(Default)]
pub struct RecordingEmitter {
    frames: Mutex<Vec<EmittedFrame>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<EmittedFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// Remove and return everything emitted so far.
    pub fn take(&self) -> Vec<EmittedFrame> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }
}

impl PacketEmitter for RecordingEmitter {
    fn emit(&self, device_id: &str, port: u32, frame: Vec<u8>) {
        self.frames.lock().unwrap().push(EmittedFrame {
            device_id: device_id.to_string(),
            port,
            frame,
        });
    }
}
