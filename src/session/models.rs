use crate::proxy::proxy_manager::ProxyManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLanguage {
    Python,
    Javascript,
    Go,
}

impl DebugLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugLanguage::Python => "python",
            DebugLanguage::Javascript => "javascript",
            DebugLanguage::Go => "go",
        }
    }
}

impl fmt::Display for DebugLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle tag of a session.
///
/// Only `created` is assigned by the store itself. The rest are set by whoever drives
/// the proxy, and callers may introduce their own tags with [`SessionState::custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState(Cow<'static, str>);

impl SessionState {
    pub const CREATED: SessionState = SessionState(Cow::Borrowed("created"));
    pub const INITIALIZING: SessionState = SessionState(Cow::Borrowed("initializing"));
    pub const READY: SessionState = SessionState(Cow::Borrowed("ready"));
    pub const RUNNING: SessionState = SessionState(Cow::Borrowed("running"));
    pub const PAUSED: SessionState = SessionState(Cow::Borrowed("paused"));
    pub const STOPPED: SessionState = SessionState(Cow::Borrowed("stopped"));
    pub const ERROR: SessionState = SessionState(Cow::Borrowed("error"));

    pub fn custom(tag: impl Into<String>) -> Self {
        SessionState(Cow::Owned(tag.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: String,
    pub file: String,
    pub line: u32,
    pub condition: Option<String>,
    pub verified: bool,
}

/// What clients get to see of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugSessionInfo {
    pub id: String,
    pub name: String,
    pub language: DebugLanguage,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full internal record. `python_path`, `breakpoints` and `proxy_manager` never leave
/// the server; use [`ManagedSession::info`] for anything client facing.
#[derive(Debug)]
pub struct ManagedSession {
    pub id: String,
    pub name: String,
    pub language: DebugLanguage,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub python_path: String,
    pub breakpoints: HashMap<String, Breakpoint>,
    pub proxy_manager: Option<Box<dyn ProxyManager>>,
}

impl ManagedSession {
    pub fn info(&self) -> DebugSessionInfo {
        DebugSessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            language: self.language,
            state: self.state.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionParams {
    pub language: DebugLanguage,
    pub name: Option<String>,
    pub python_path: Option<String>,
}

/// Partial update merged by `SessionStore::update`. Unset fields are left alone.
#[derive(Debug, Default)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub state: Option<SessionState>,
    pub python_path: Option<String>,
    pub proxy_manager: Option<Box<dyn ProxyManager>>,
}
