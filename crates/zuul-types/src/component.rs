//! Ephemeral registration of live processes (spec §4.C).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Scheduler,
    Executor,
    Merger,
    Launcher,
    Web,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Scheduler => "scheduler",
            ComponentKind::Executor => "executor",
            ComponentKind::Merger => "merger",
            ComponentKind::Launcher => "launcher",
            ComponentKind::Web => "web",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Stopped,
    Initializing,
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRegistration {
    pub hostname: String,
    pub kind: ComponentKind,
    pub state: ComponentState,
    pub version: String,
    pub zone: Option<String>,
    pub accepting_work: bool,
}

impl ComponentRegistration {
    pub fn new(hostname: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            hostname: hostname.into(),
            kind,
            state: ComponentState::Initializing,
            version: env!("CARGO_PKG_VERSION").to_string(),
            zone: None,
            accepting_work: false,
        }
    }

    pub fn is_eligible_for_work(&self) -> bool {
        matches!(self.state, ComponentState::Running) && self.accepting_work
    }
}
