//! Operation contexts: interruption and per-operation storage state.
//!
//! Interruption is two-level. A context can be *killed* (operation-scoped
//! cancellation) or hit by *shutdown* (process-wide). Code running on
//! behalf of the replication stream suppresses kill signals — a secondary
//! cannot refuse work the log mandates — but shutdown always lands. The
//! suppression scope stacks and is restored on drop.

use crate::error::{Error, Result};
use crate::txn::RecoveryUnit;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum InterruptState {
    #[default]
    Running,
    Killed(String),
    Shutdown,
}

/// Context for a single logical operation: interrupt state, a description
/// for observability, and the storage transaction state.
#[derive(Default)]
pub struct OperationContext {
    description: Mutex<String>,
    state: Mutex<InterruptState>,
    suppression_depth: AtomicU32,
    interrupt_notify: Notify,
    recovery_unit: RecoveryUnit,
}

impl OperationContext {
    /// Create a fresh, uninterrupted context.
    pub fn new() -> Arc<Self> {
        Arc::new(OperationContext::default())
    }

    /// The storage transaction state scoped to this operation.
    pub fn recovery_unit(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    /// Replace the operation description shown in diagnostics.
    pub fn set_description(&self, desc: impl Into<String>) {
        *self.description.lock() = desc.into();
    }

    /// The current operation description.
    pub fn description(&self) -> String {
        self.description.lock().clone()
    }

    /// Kill this operation. The first interrupt wins; a kill never
    /// downgrades an existing shutdown signal.
    pub fn kill(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if *state == InterruptState::Running {
            *state = InterruptState::Killed(reason.into());
            drop(state);
            self.interrupt_notify.notify_waiters();
        }
    }

    /// Deliver the shutdown interrupt. Overrides a pending kill so that
    /// suppressed contexts still unwind.
    pub fn signal_shutdown(&self) {
        {
            let mut state = self.state.lock();
            *state = InterruptState::Shutdown;
        }
        self.interrupt_notify.notify_waiters();
    }

    /// Error for the currently effective interrupt, if any.
    fn effective_interrupt(&self) -> Option<Error> {
        let state = self.state.lock();
        match &*state {
            InterruptState::Running => None,
            InterruptState::Shutdown => Some(Error::InterruptedAtShutdown),
            InterruptState::Killed(reason) => {
                if self.suppression_depth.load(Ordering::Acquire) > 0 {
                    None
                } else {
                    Some(Error::Interrupted(reason.clone()))
                }
            }
        }
    }

    /// Fail if this operation has been interrupted.
    pub fn check_for_interrupt(&self) -> Result<()> {
        match self.effective_interrupt() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve once an effective interrupt is present, yielding its error.
    ///
    /// Under suppression this ignores kills and only resolves on shutdown.
    pub async fn interrupted(&self) -> Error {
        loop {
            let notified = self.interrupt_notify.notified();
            if let Some(err) = self.effective_interrupt() {
                return err;
            }
            notified.await;
        }
    }

    /// Suppress kill signals for the returned guard's lifetime; shutdown
    /// still interrupts. Guards stack.
    pub fn run_without_interruption_except_shutdown(&self) -> InterruptSuppressionGuard<'_> {
        self.suppression_depth.fetch_add(1, Ordering::AcqRel);
        InterruptSuppressionGuard { ctx: self }
    }

    /// True once the shutdown signal has been delivered.
    pub fn is_shutdown(&self) -> bool {
        *self.state.lock() == InterruptState::Shutdown
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("description", &self.description())
            .field("state", &*self.state.lock())
            .field(
                "suppression_depth",
                &self.suppression_depth.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Scope guard restoring the interrupt suppression level on drop.
pub struct InterruptSuppressionGuard<'a> {
    ctx: &'a OperationContext,
}

impl Drop for InterruptSuppressionGuard<'_> {
    fn drop(&mut self) {
        self.ctx.suppression_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kill_interrupts_normal_contexts() {
        let ctx = OperationContext::new();
        assert!(ctx.check_for_interrupt().is_ok());
        ctx.kill("test kill");
        assert!(matches!(
            ctx.check_for_interrupt(),
            Err(Error::Interrupted(_))
        ));
    }

    #[test]
    fn suppression_hides_kill_but_not_shutdown() {
        let ctx = OperationContext::new();
        ctx.kill("test kill");
        {
            let _guard = ctx.run_without_interruption_except_shutdown();
            assert!(ctx.check_for_interrupt().is_ok());
            ctx.signal_shutdown();
            assert!(matches!(
                ctx.check_for_interrupt(),
                Err(Error::InterruptedAtShutdown)
            ));
        }
    }

    #[test]
    fn suppression_stacks() {
        let ctx = OperationContext::new();
        ctx.kill("test kill");
        let outer = ctx.run_without_interruption_except_shutdown();
        {
            let _inner = ctx.run_without_interruption_except_shutdown();
            assert!(ctx.check_for_interrupt().is_ok());
        }
        assert!(ctx.check_for_interrupt().is_ok());
        drop(outer);
        assert!(ctx.check_for_interrupt().is_err());
    }

    #[test]
    fn shutdown_overrides_kill() {
        let ctx = OperationContext::new();
        ctx.kill("test kill");
        ctx.signal_shutdown();
        assert!(matches!(
            ctx.check_for_interrupt(),
            Err(Error::InterruptedAtShutdown)
        ));
    }

    #[tokio::test]
    async fn interrupted_future_resolves_on_kill() {
        let ctx = OperationContext::new();
        let ctx2 = ctx.clone();
        let waiter = tokio::spawn(async move { ctx2.interrupted().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        ctx.kill("late kill");
        let err = waiter.await.unwrap();
        assert!(matches!(err, Error::Interrupted(_)));
    }
}
