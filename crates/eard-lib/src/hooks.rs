//! Job lifecycle hooks
//!
//! Optional integrations (scheduler plugins, accounting, site scripts)
//! register a [`JobHook`] in the [`HookTable`] at startup. The policy engine
//! invokes every registered hook after the job table has been updated and
//! the state lock released. A failing hook is logged and otherwise ignored.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::policy::ManagedApp;

/// Capability invoked on job start and end
pub trait JobHook: Send + Sync {
    fn name(&self) -> &str;

    fn on_new_job(&self, app: &ManagedApp) -> Result<()>;

    fn on_end_job(&self, app: &ManagedApp) -> Result<()>;
}

/// Hooks registered at startup, invoked in registration order
#[derive(Clone, Default)]
pub struct HookTable {
    hooks: Vec<Arc<dyn JobHook>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn JobHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }

    /// Run every `on_new_job`, returning how many failed
    pub fn run_new_job(&self, app: &ManagedApp) -> usize {
        self.hooks
            .iter()
            .filter(|hook| match hook.on_new_job(app) {
                Ok(()) => false,
                Err(e) => {
                    warn!(hook = hook.name(), pid = app.pid, error = %e, "Job start hook failed");
                    true
                }
            })
            .count()
    }

    /// Run every `on_end_job`, returning how many failed
    pub fn run_end_job(&self, app: &ManagedApp) -> usize {
        self.hooks
            .iter()
            .filter(|hook| match hook.on_end_job(app) {
                Ok(()) => false,
                Err(e) => {
                    warn!(hook = hook.name(), pid = app.pid, error = %e, "Job end hook failed");
                    true
                }
            })
            .count()
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable").field("hooks", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EardError;
    use crate::models::{AppInfo, Policy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        started: AtomicUsize,
        ended: AtomicUsize,
    }

    impl JobHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        fn on_new_job(&self, _app: &ManagedApp) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_end_job(&self, _app: &ManagedApp) -> Result<()> {
            self.ended.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHook;

    impl JobHook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_new_job(&self, _app: &ManagedApp) -> Result<()> {
            Err(EardError::invalid("hook refused"))
        }

        fn on_end_job(&self, _app: &ManagedApp) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failing_hook_does_not_stop_others() {
        let counting = Arc::new(CountingHook {
            started: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
        });

        let mut table = HookTable::new();
        table.register(Arc::new(FailingHook));
        table.register(counting.clone());
        assert_eq!(table.names(), vec!["failing", "counting"]);

        let app = ManagedApp::new(1, AppInfo::default(), Policy::Monitoring, 2_000_000);
        assert_eq!(table.run_new_job(&app), 1);
        assert_eq!(table.run_end_job(&app), 0);

        assert_eq!(counting.started.load(Ordering::SeqCst), 1);
        assert_eq!(counting.ended.load(Ordering::SeqCst), 1);
    }
}
