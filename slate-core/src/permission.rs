//! Role-keyed permission gating for board actions.
//!
//! Resolution rules:
//! - no configuration at all → every action allowed (legacy default)
//! - configuration present but no record for an action → denied
//! - otherwise → allowed iff the role is listed

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Participant role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
    Observer,
}

/// Every mutating action a replica can attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Draw,
    Erase,
    Undo,
    Redo,
    Clear,
    ChangeColor,
    ChangeWidth,
    ChangeTool,
    ChangePage,
    AttachFile,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::Draw,
        Action::Erase,
        Action::Undo,
        Action::Redo,
        Action::Clear,
        Action::ChangeColor,
        Action::ChangeWidth,
        Action::ChangeTool,
        Action::ChangePage,
        Action::AttachFile,
    ];

    /// Configuration key for this action.
    pub fn key(&self) -> &'static str {
        match self {
            Action::Draw => "whiteboard.draw",
            Action::Erase => "whiteboard.erase",
            Action::Undo => "whiteboard.undo",
            Action::Redo => "whiteboard.redo",
            Action::Clear => "whiteboard.clear",
            Action::ChangeColor => "whiteboard.color",
            Action::ChangeWidth => "whiteboard.width",
            Action::ChangeTool => "whiteboard.tool",
            Action::ChangePage => "whiteboard.page",
            Action::AttachFile => "whiteboard.attach",
        }
    }

    pub fn from_key(key: &str) -> Option<Action> {
        Action::ALL.into_iter().find(|a| a.key() == key)
    }
}

/// Source of role allow-lists, refreshable at runtime by replacing it.
pub trait PermissionSource {
    /// Whether any permission configuration exists.
    fn is_configured(&self) -> bool;

    /// Allowed roles for `action`; `None` when there is no record for it.
    fn allowed_roles(&self, action: Action) -> Option<HashSet<Role>>;

    fn allows(&self, role: Role, action: Action) -> bool {
        if !self.is_configured() {
            return true;
        }
        self.allowed_roles(action)
            .map(|roles| roles.contains(&role))
            .unwrap_or(false)
    }
}

/// In-memory allow-list table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionTable {
    rules: Option<HashMap<Action, HashSet<Role>>>,
}

impl PermissionTable {
    /// No configuration: everything is allowed.
    pub fn unconfigured() -> Self {
        Self { rules: None }
    }

    /// Configured but empty: everything is denied until allowed.
    pub fn new() -> Self {
        Self { rules: Some(HashMap::new()) }
    }

    pub fn allow(mut self, action: Action, roles: impl IntoIterator<Item = Role>) -> Self {
        self.rules
            .get_or_insert_with(HashMap::new)
            .entry(action)
            .or_default()
            .extend(roles);
        self
    }

    /// Build from `(action key, roles)` records. Unknown keys are skipped.
    pub fn from_records<K, R>(records: impl IntoIterator<Item = (K, R)>) -> Self
    where
        K: AsRef<str>,
        R: IntoIterator<Item = Role>,
    {
        let mut table = Self::new();
        for (key, roles) in records {
            match Action::from_key(key.as_ref()) {
                Some(action) => table = table.allow(action, roles),
                None => log::warn!("Ignoring permission record for unknown action {}", key.as_ref()),
            }
        }
        table
    }

    /// Teacher may do everything; students may draw and manage their tools.
    pub fn classroom() -> Self {
        let mut table = Self::new();
        for action in Action::ALL {
            table = table.allow(action, [Role::Teacher]);
        }
        for action in [
            Action::Draw,
            Action::Erase,
            Action::Undo,
            Action::Redo,
            Action::ChangeColor,
            Action::ChangeWidth,
            Action::ChangeTool,
        ] {
            table = table.allow(action, [Role::Student]);
        }
        table
    }
}

impl PermissionSource for PermissionTable {
    fn is_configured(&self) -> bool {
        self.rules.is_some()
    }

    fn allowed_roles(&self, action: Action) -> Option<HashSet<Role>> {
        self.rules.as_ref()?.get(&action).cloned()
    }
}
