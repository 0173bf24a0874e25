//! Transaction retry on serialization failures and deadlocks.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::db::{Database, Transaction};
use crate::error::{
    DbResultExt, Error, Result, SQLSTATE_DEADLOCK_DETECTED, SQLSTATE_SERIALIZATION_FAILURE,
};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Delay before the first retry; doubled for each further one.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(10);

/// Retry limits for [`TransactionOptimizer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Default: 3.
    pub max_retries: u32,
    /// Default: 10ms.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `base_delay * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Total time slept when every attempt fails with a retryable error.
    pub fn worst_case_delay(&self, max_retries: u32) -> Duration {
        (0..max_retries)
            .map(|a| self.backoff(a))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// True for transient conflicts that are safe to retry.
pub fn is_retryable(err: &Error) -> bool {
    if matches!(
        err.sqlstate(),
        Some(SQLSTATE_SERIALIZATION_FAILURE | SQLSTATE_DEADLOCK_DETECTED)
    ) {
        return true;
    }
    let msg = err.to_string();
    msg.contains("deadlock")
        || msg.contains(SQLSTATE_SERIALIZATION_FAILURE)
        || msg.contains(SQLSTATE_DEADLOCK_DETECTED)
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Runs units of work in a transaction, retrying transient conflicts with
/// exponential backoff.
///
/// ```
/// use pgkeeper_core::db::{Executor, Value};
/// use pgkeeper_core::db::mock::MockDatabase;
/// use pgkeeper_core::error::DbResultExt;
/// use pgkeeper_core::query::TransactionOptimizer;
///
/// let mut db = MockDatabase::new();
/// db.on_execute("UPDATE accounts", 1);
/// let optimizer = TransactionOptimizer::default();
/// let n = optimizer
///     .execute_with_retry(&mut db, 3, |tx| {
///         tx.execute("UPDATE accounts SET balance = balance - $1 WHERE id = $2",
///                    &[Value::from(10), Value::from(7)])
///             .during("debit")
///     })
///     .unwrap();
/// assert_eq!(n, 1);
/// ```
#[derive(Clone)]
pub struct TransactionOptimizer {
    policy: RetryPolicy,
    sleep: Sleeper,
}

impl Default for TransactionOptimizer {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl fmt::Debug for TransactionOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionOptimizer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TransactionOptimizer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Replaces `thread::sleep` between attempts.
    pub fn with_sleeper(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Arc::new(sleep);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// [`execute_with_retry`](Self::execute_with_retry) with the policy's retry count.
    pub fn execute<D, T, F>(&self, db: &mut D, work: F) -> Result<T>
    where
        D: Database + ?Sized,
        F: FnMut(&mut dyn Transaction) -> Result<T>,
    {
        self.execute_with_retry(db, self.policy.max_retries, work)
    }

    /// Runs `work` in a transaction and commits.
    ///
    /// A retryable failure (from `work`, BEGIN or COMMIT) rolls back, sleeps
    /// `base_delay * 2^attempt` and starts over, up to `max_retries` times.
    /// `work` is therefore called at most `max_retries + 1` times and must
    /// not have side effects outside the transaction. Other errors return
    /// immediately.
    pub fn execute_with_retry<D, T, F>(&self, db: &mut D, max_retries: u32, mut work: F) -> Result<T>
    where
        D: Database + ?Sized,
        F: FnMut(&mut dyn Transaction) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match run_in_transaction(db, &mut work) {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "transaction succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if is_retryable(&e) => {
                    if attempt >= max_retries {
                        return Err(Error::RetriesExhausted {
                            retries: max_retries,
                            source: Box::new(e),
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying transaction"
                    );
                    (self.sleep)(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn run_in_transaction<D, T, F>(db: &mut D, work: &mut F) -> Result<T>
where
    D: Database + ?Sized,
    F: FnMut(&mut dyn Transaction) -> Result<T>,
{
    let mut tx = db.transaction().during("begin transaction")?;
    let value = work(&mut *tx)?;
    tx.commit().during("commit transaction")?;
    Ok(value)
}

/// Runs `work` in a transaction with `SET LOCAL statement_timeout`.
///
/// The timeout is rounded down to whole milliseconds; zero is rejected
/// because PostgreSQL reads it as "no timeout".
pub fn with_statement_timeout<D, T, F>(db: &mut D, timeout: Duration, work: F) -> Result<T>
where
    D: Database + ?Sized,
    F: FnOnce(&mut dyn Transaction) -> Result<T>,
{
    let ms = timeout.as_millis();
    if ms == 0 {
        return Err(Error::InvalidArgument(
            "statement timeout must be at least 1ms".to_string(),
        ));
    }
    let mut tx = db.transaction().during("begin transaction")?;
    tx.batch_execute(&format!("SET LOCAL statement_timeout = '{ms}ms'"))
        .during("set statement_timeout")?;
    let value = work(&mut *tx)?;
    tx.commit().during("commit transaction")?;
    Ok(value)
}
