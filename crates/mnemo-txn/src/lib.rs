//! Transaction manager: ordered operations, compensating rollback.
//!
//! Each operation's `execute` returns an idempotent compensation closure.
//! On any failure the collected compensations run in reverse order, each
//! retried with exponential backoff; a compensation that still fails is
//! reported inside `TransactionRollbackError` together with the original
//! cause. The lifecycle is a strict state machine:
//! `pending → executing → (committed | rolling_back → rolled_back)`.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use mnemo_error::{MnemoError, Result, RollbackFailure};
use mnemo_types::Cx;

/// Idempotent compensation for one executed operation.
pub type RollbackFn = Box<dyn FnMut(&Cx) -> Result<()> + Send>;

/// A no-op compensation for operations with nothing to undo.
#[must_use]
pub fn no_rollback() -> RollbackFn {
    Box::new(|_cx| Ok(()))
}

/// One step inside a transaction.
pub trait Operation: Send {
    /// Stable label for logs and error context.
    fn label(&self) -> &str;

    /// Perform the step, returning its compensation.
    fn execute(&mut self, cx: &Cx) -> Result<RollbackFn>;
}

/// Closure-backed operation, the common construction at the facade.
pub struct FnOperation {
    label: String,
    exec: Option<Box<dyn FnOnce(&Cx) -> Result<RollbackFn> + Send>>,
}

impl FnOperation {
    pub fn new(
        label: impl Into<String>,
        exec: impl FnOnce(&Cx) -> Result<RollbackFn> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            exec: Some(Box::new(exec)),
        }
    }
}

impl Operation for FnOperation {
    fn label(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, cx: &Cx) -> Result<RollbackFn> {
        let exec = self
            .exec
            .take()
            .ok_or_else(|| MnemoError::internal("operation executed twice"))?;
        exec(cx)
    }
}

/// Batch several operations into one, amortizing per-operation overhead.
/// Sub-operations execute in order; the batch compensation replays their
/// compensations in reverse.
pub struct BatchOperation {
    label: String,
    ops: Vec<Box<dyn Operation>>,
}

impl BatchOperation {
    pub fn new(label: impl Into<String>, ops: Vec<Box<dyn Operation>>) -> Self {
        Self {
            label: label.into(),
            ops,
        }
    }
}

impl Operation for BatchOperation {
    fn label(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, cx: &Cx) -> Result<RollbackFn> {
        let mut compensations: Vec<RollbackFn> = Vec::with_capacity(self.ops.len());
        for op in &mut self.ops {
            match op.execute(cx) {
                Ok(rollback) => compensations.push(rollback),
                Err(err) => {
                    // Undo the sub-prefix before surfacing; the outer
                    // transaction never saw these succeed.
                    for rollback in compensations.iter_mut().rev() {
                        if let Err(rb_err) = rollback(cx) {
                            warn!(error = %rb_err, "batch sub-rollback failed");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(Box::new(move |cx: &Cx| {
            for rollback in compensations.iter_mut().rev() {
                rollback(cx)?;
            }
            Ok(())
        }))
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Pending,
    Executing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TxnState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Transaction knobs.
#[derive(Debug, Clone)]
pub struct TxnConfig {
    pub max_rollback_retries: u32,
    /// Base backoff between rollback retries (doubles per attempt).
    pub rollback_backoff: Duration,
    /// Whole-transaction deadline.
    pub timeout: Duration,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_rollback_retries: 3,
            rollback_backoff: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// An ordered list of operations executed atomically.
pub struct Transaction {
    state: TxnState,
    operations: Vec<Box<dyn Operation>>,
    config: TxnConfig,
}

impl Transaction {
    #[must_use]
    pub fn new(config: TxnConfig) -> Self {
        Self {
            state: TxnState::Pending,
            operations: Vec::new(),
            config,
        }
    }

    /// Append an operation. Only legal while pending.
    pub fn push(&mut self, op: impl Operation + 'static) -> Result<()> {
        if self.state != TxnState::Pending {
            return Err(MnemoError::InvalidTransactionState {
                expected: TxnState::Pending.as_str(),
                actual: self.state.as_str(),
            });
        }
        self.operations.push(Box::new(op));
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> TxnState {
        self.state
    }

    /// Execute every operation; on failure run compensations in reverse.
    ///
    /// The transaction deadline derives from `cx`, so external
    /// cancellation and the configured timeout both abort mid-flight and
    /// trigger rollback identically.
    pub fn run(&mut self, cx: &Cx) -> Result<()> {
        if self.state != TxnState::Pending {
            return Err(MnemoError::InvalidTransactionState {
                expected: TxnState::Pending.as_str(),
                actual: self.state.as_str(),
            });
        }
        self.state = TxnState::Executing;
        let txn_cx = cx.child_with_timeout(self.config.timeout);

        let mut completed: Vec<(String, RollbackFn)> = Vec::with_capacity(self.operations.len());
        let operations = std::mem::take(&mut self.operations);
        for mut op in operations {
            let label = op.label().to_owned();
            let step = txn_cx
                .checkpoint_with(&label)
                .and_then(|()| op.execute(&txn_cx));
            match step {
                Ok(rollback) => {
                    debug!(operation = %label, "transaction step ok");
                    completed.push((label, rollback));
                }
                Err(cause) => {
                    error!(operation = %label, error = %cause, "transaction step failed, rolling back");
                    self.state = TxnState::RollingBack;
                    let failures = self.run_rollbacks(&mut completed);
                    self.state = TxnState::RolledBack;
                    let wrapped = MnemoError::TransactionExecution {
                        operation: label,
                        cause: Box::new(cause),
                    };
                    if failures.is_empty() {
                        return Err(wrapped);
                    }
                    return Err(MnemoError::TransactionRollback {
                        cause: Box::new(wrapped),
                        failures,
                    });
                }
            }
        }
        self.state = TxnState::Committed;
        info!(operations = completed.len(), "transaction committed");
        Ok(())
    }

    /// Run compensations in reverse under a fresh context: rollback must
    /// proceed even when the transaction died of timeout or cancellation.
    fn run_rollbacks(&self, completed: &mut Vec<(String, RollbackFn)>) -> Vec<RollbackFailure> {
        let rollback_cx = Cx::new();
        let mut failures = Vec::new();
        for (label, rollback) in completed.iter_mut().rev() {
            let mut last_err: Option<MnemoError> = None;
            for attempt in 0..=self.config.max_rollback_retries {
                if attempt > 0 {
                    let backoff = self.config.rollback_backoff * 2_u32.pow(attempt - 1);
                    std::thread::sleep(backoff);
                }
                match rollback(&rollback_cx) {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            operation = %label,
                            attempt,
                            error = %err,
                            "rollback attempt failed"
                        );
                        last_err = Some(err);
                    }
                }
            }
            if let Some(err) = last_err {
                error!(operation = %label, error = %err, "rollback exhausted retries");
                failures.push(RollbackFailure {
                    operation: label.clone(),
                    error: Box::new(err),
                });
            }
        }
        failures
    }
}
