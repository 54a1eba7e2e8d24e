//! Capability flags gating what model-issued tool calls may do.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// A permission a tool handler may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    FileEdits,
}

impl Capability {
    /// Key used by the panel's `toggleCapability` event
    pub fn key(&self) -> &'static str {
        match self {
            Capability::FileEdits => "allowFileEdits",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "allowFileEdits" => Some(Capability::FileEdits),
            _ => None,
        }
    }
}

/// Uses atomic bools so panels and the dispatcher can share it without locks.
pub struct Capabilities {
    allow_file_edits: AtomicBool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            // Edits stay off until the user opts in
            allow_file_edits: AtomicBool::new(false),
        }
    }
}

impl Capabilities {
    pub fn new(allow_file_edits: bool) -> Self {
        Self {
            allow_file_edits: AtomicBool::new(allow_file_edits),
        }
    }

    pub fn is_enabled(&self, capability: Capability) -> bool {
        match capability {
            Capability::FileEdits => self.allow_file_edits.load(Ordering::Relaxed),
        }
    }

    pub fn set(&self, capability: Capability, value: bool) {
        match capability {
            Capability::FileEdits => self.allow_file_edits.store(value, Ordering::Relaxed),
        }
    }

    /// Returns a serializable snapshot of current flag values
    pub fn snapshot(&self) -> CapabilitiesSnapshot {
        CapabilitiesSnapshot {
            allow_file_edits: self.is_enabled(Capability::FileEdits),
        }
    }
}

/// Serializable snapshot for the panel's `capabilities` notification
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesSnapshot {
    pub allow_file_edits: bool,
}
