use std::time::Duration;

pub type ReconcileResult<E> = std::result::Result<ReconcileFunctionAction, E>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileFunctionAction {
    /// Run the next function in the reconciler chain
    Continue,

    /// Skip the remaining reconciler chain
    Done,

    /// External state is not there yet, skip the remaining reconciler chain and try again
    /// after the delay
    Requeue { after: Duration, reason: String },
}

impl ReconcileFunctionAction {
    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::Requeue { .. })
    }
}

pub fn create_requeuing_reconcile_function_action(
    secs: u64,
    reason: impl Into<String>,
) -> ReconcileFunctionAction {
    ReconcileFunctionAction::Requeue {
        after: Duration::from_secs(secs),
        reason: reason.into(),
    }
}
