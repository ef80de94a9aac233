use crate::config::default_python;
use crate::error::AppError;
use crate::proxy::proxy_manager::ProxyManager;
use crate::session::models::{
    Breakpoint, CreateSessionParams, DebugLanguage, DebugSessionInfo, ManagedSession,
    SessionState, SessionUpdate,
};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// In-memory registry of debug sessions.
///
/// Pure data: nothing here touches processes or the filesystem, so removing or clearing
/// sessions never shuts down an attached proxy. Callers that own a proxy must stop it
/// first (see `detach_proxy`).
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, ManagedSession>,
    python_path_override: Option<String>,
}

impl ManagedSession {
    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::nanoseconds(1)
        };
    }
}

impl SessionStore {
    /// `python_path_override` is the environment-level interpreter (`PYTHON_PATH`),
    /// consulted when a session is created without an explicit one.
    pub fn new(python_path_override: Option<String>) -> Self {
        Self {
            sessions: HashMap::new(),
            python_path_override,
        }
    }

    pub fn create_session(&mut self, params: CreateSessionParams) -> Result<DebugSessionInfo, AppError> {
        if params.language != DebugLanguage::Python {
            return Err(AppError::UnsupportedLanguage(params.language.to_string()));
        }

        let session_id = Uuid::new_v4().to_string();
        let name = params
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("session-{}", &session_id[..8]));
        let python_path = params
            .python_path
            .filter(|p| !p.is_empty())
            .or_else(|| self.python_path_override.clone())
            .unwrap_or_else(|| default_python().to_string());

        let now = Utc::now();
        let session = ManagedSession {
            id: session_id.clone(),
            name,
            language: params.language,
            state: SessionState::CREATED,
            created_at: now,
            updated_at: now,
            python_path,
            breakpoints: HashMap::new(),
            proxy_manager: None,
        };
        let info = session.info();
        debug!(session_id = %session_id, python_path = %session.python_path, "Created debug session");
        self.sessions.insert(session_id, session);
        Ok(info)
    }

    pub fn get(&self, session_id: &str) -> Option<&ManagedSession> {
        self.sessions.get(session_id)
    }

    pub fn get_or_throw(&self, session_id: &str) -> Result<&ManagedSession, AppError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))
    }

    fn get_mut_or_throw(&mut self, session_id: &str) -> Result<&mut ManagedSession, AppError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))
    }

    /// Inserts a record as-is, replacing any session with the same id.
    pub fn set(&mut self, session_id: &str, session: ManagedSession) {
        self.sessions.insert(session_id.to_string(), session);
    }

    pub fn update(&mut self, session_id: &str, update: SessionUpdate) -> Result<(), AppError> {
        let session = self.get_mut_or_throw(session_id)?;
        if let Some(name) = update.name {
            session.name = name;
        }
        if let Some(state) = update.state {
            session.state = state;
        }
        if let Some(python_path) = update.python_path {
            session.python_path = python_path;
        }
        if let Some(proxy_manager) = update.proxy_manager {
            session.proxy_manager = Some(proxy_manager);
        }
        session.touch();
        Ok(())
    }

    /// Sets the state. Re-applying the current state is a no-op and leaves
    /// `updated_at` untouched.
    pub fn update_state(&mut self, session_id: &str, new_state: SessionState) -> Result<(), AppError> {
        let session = self.get_mut_or_throw(session_id)?;
        if session.state != new_state {
            debug!(session_id = %session_id, from = %session.state, to = %new_state, "Session state change");
            session.state = new_state;
            session.touch();
        }
        Ok(())
    }

    pub fn add_breakpoint(&mut self, session_id: &str, breakpoint: Breakpoint) -> Result<(), AppError> {
        let session = self.get_mut_or_throw(session_id)?;
        session.breakpoints.insert(breakpoint.id.clone(), breakpoint);
        session.touch();
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, session_id: &str, breakpoint_id: &str) -> Result<bool, AppError> {
        let session = self.get_mut_or_throw(session_id)?;
        let removed = session.breakpoints.remove(breakpoint_id).is_some();
        if removed {
            session.touch();
        }
        Ok(removed)
    }

    /// Takes the proxy controller out of the record so the caller can stop it
    /// without holding the store.
    pub fn detach_proxy(&mut self, session_id: &str) -> Result<Option<Box<dyn ProxyManager>>, AppError> {
        let session = self.get_mut_or_throw(session_id)?;
        let proxy = session.proxy_manager.take();
        if proxy.is_some() {
            session.touch();
        }
        Ok(proxy)
    }

    pub fn remove(&mut self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn get_all(&self) -> Vec<DebugSessionInfo> {
        self.sessions.values().map(ManagedSession::info).collect()
    }

    pub fn get_all_managed(&self) -> Vec<&ManagedSession> {
        self.sessions.values().collect()
    }

    pub fn has(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
