// Optimistic mutation primitive shared by every reconciler.
//
// apply locally -> await the remote command -> confirm (replace the
// provisional record by correlation id) or roll back. The state lock is
// only taken inside the closures and never held across the await.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::api::{CommandError, CommandResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Idle,
    OptimisticallyUpdated,
    Confirmed,
    RolledBack,
}

impl MutationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::OptimisticallyUpdated => "optimistically_updated",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
        }
    }
}

pub(crate) fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One in-flight optimistic change, identified by a correlation id.
#[derive(Debug)]
pub struct OptimisticMutation {
    label: &'static str,
    correlation: Uuid,
    phase: MutationPhase,
}

impl OptimisticMutation {
    pub fn new(label: &'static str) -> Self {
        Self::with_correlation(label, Uuid::new_v4())
    }

    pub fn with_correlation(label: &'static str, correlation: Uuid) -> Self {
        Self { label, correlation, phase: MutationPhase::Idle }
    }

    pub fn correlation(&self) -> Uuid {
        self.correlation
    }

    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    fn advance(&mut self, phase: MutationPhase) {
        debug!(
            mutation = self.label,
            correlation = %self.correlation,
            from = self.phase.as_str(),
            to = phase.as_str(),
            "optimistic mutation"
        );
        self.phase = phase;
    }

    /// Run the mutation to completion and return the command's result.
    pub async fn run<S, T, A, F, C, R>(
        mut self,
        state: &Mutex<S>,
        apply: A,
        command: F,
        confirm: C,
        rollback: R,
    ) -> CommandResult<T>
    where
        A: FnOnce(&mut S),
        F: Future<Output = CommandResult<T>>,
        C: FnOnce(&mut S, &T),
        R: FnOnce(&mut S, &CommandError),
    {
        apply(&mut lock(state));
        self.advance(MutationPhase::OptimisticallyUpdated);

        let result = command.await;
        match &result {
            Ok(value) => {
                confirm(&mut lock(state), value);
                self.advance(MutationPhase::Confirmed);
            }
            Err(error) => {
                rollback(&mut lock(state), error);
                self.advance(MutationPhase::RolledBack);
            }
        }
        result
    }
}
