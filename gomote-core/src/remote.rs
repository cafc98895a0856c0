//! Remote-session pool and scheduler.
//!
//! These are the stateful collaborators the RPC service and the shell front
//! end share. The server only constructs them and hands them out; session
//! business logic (creating builders, running commands) lives behind the RPC
//! service.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

/// Active remote sessions, instance name to owner.
#[derive(Debug, Default)]
pub struct SessionPool {
    sessions: DashMap<String, String>,
}

impl SessionPool {
    /// Empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Hands out builders to sessions in a pool.
pub struct Scheduler {
    pool: Arc<SessionPool>,
}

impl Scheduler {
    /// Scheduler placing sessions into `pool`.
    #[must_use]
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("active_sessions", &self.pool.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pool_is_empty() {
        let pool = SessionPool::new();
        assert!(pool.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_scheduler_reports_its_pool() {
        let pool = Arc::new(SessionPool::new());
        let scheduler = Scheduler::new(pool.clone());
        assert_eq!(format!("{scheduler:?}"), "Scheduler { active_sessions: 0 }");
        assert_eq!(Arc::strong_count(&pool), 2);
    }
}
