//! Lock-retrying transactions
//!
//! DDL on a busy table queues behind every open transaction that touched it, and
//! everything queued behind the DDL waits too. Instead of waiting indefinitely, each
//! attempt runs with a short `lock_timeout`; when it expires the transaction is rolled
//! back, the session sleeps, and the attempt is repeated with a longer timeout.

use crate::config::{LockRetryConfig, LockRetryTiming};
use crate::error::PartitionError;
use crate::executor::SqlExecutor;
use crate::logger::{LogEntry, PartitionLogger};
use crate::schema::sql;
use crate::schema::LockRetryBlock;
use crate::transaction::Transaction;
use rand::Rng;
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// What a lock-retrying block wants done with its transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Commit,
    Rollback,
}

/// Runs blocks in transactions under an escalating `lock_timeout` schedule
pub struct WithLockRetries<'a> {
    executor: &'a dyn SqlExecutor,
    config: &'a LockRetryConfig,
    logger: &'a dyn PartitionLogger,
}

impl<'a> WithLockRetries<'a> {
    pub fn new(
        executor: &'a dyn SqlExecutor,
        config: &'a LockRetryConfig,
        logger: &'a dyn PartitionLogger,
    ) -> Self {
        Self {
            executor,
            config,
            logger,
        }
    }

    /// Run `block` until it gets through without a lock timeout
    ///
    /// # Errors
    ///
    /// Any error from `block` other than a lock timeout is returned immediately.
    /// With `raise_on_exhaustion`, `PartitionError::LockRetriesExhausted` is returned after
    /// the last scheduled attempt; otherwise one more attempt runs with no lock timeout.
    pub fn run(
        &self,
        raise_on_exhaustion: bool,
        block: &mut LockRetryBlock<'_>,
    ) -> Result<(), PartitionError> {
        let timings = self.config.timings();
        let mut last_error = None;

        for (index, timing) in timings.iter().enumerate() {
            let attempt = index + 1;
            match self.run_block(timing.lock_timeout, block) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_lock_timeout() => {
                    #[cfg(feature = "metrics")]
                    METRICS.record_lock_retry();

                    self.logger.warn(
                        LogEntry::new("Lock timeout exceeded, retrying")
                            .field("attempt", attempt)
                            .field("attempts", timings.len())
                            .field("lock_timeout_ms", timing.lock_timeout.as_millis() as u64)
                            .field("error", e.to_string()),
                    );
                    last_error = Some(e);

                    if attempt < timings.len() {
                        self.sleep(timing);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        #[cfg(feature = "metrics")]
        METRICS.record_lock_retries_exhausted();

        if raise_on_exhaustion {
            return Err(PartitionError::LockRetriesExhausted {
                attempts: timings.len(),
                message: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no attempts were scheduled".to_string()),
            });
        }

        self.logger.warn(
            LogEntry::new("Lock retries exhausted, running without lock timeout")
                .field("attempts", timings.len()),
        );
        self.run_block(Duration::ZERO, block)
    }

    fn run_block(
        &self,
        lock_timeout: Duration,
        block: &mut LockRetryBlock<'_>,
    ) -> Result<(), PartitionError> {
        let transaction = Transaction::begin(self.executor)?;
        transaction.execute(&sql::set_local_lock_timeout(lock_timeout), &[])?;

        match block() {
            Ok(Completion::Commit) => transaction.commit(),
            Ok(Completion::Rollback) => transaction.rollback(),
            Err(e) => {
                // Report the block's error, not a failed rollback
                let _ = transaction.rollback();
                Err(e)
            }
        }
    }

    fn sleep(&self, timing: &LockRetryTiming) {
        let jitter = if self.config.jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=self.config.jitter_ms))
        } else {
            Duration::ZERO
        };
        let pause = timing.sleep + jitter;
        if !pause.is_zero() {
            may::coroutine::sleep(pause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{RecordingExecutor, RecordingLogger};
    use std::cell::Cell;

    fn lock_timeout_error() -> PartitionError {
        PartitionError::Query("canceling statement due to lock timeout".to_string())
    }

    #[test]
    fn test_commits_on_first_success() {
        let executor = RecordingExecutor::default();
        let config = LockRetryConfig::immediate(3);
        let logger = RecordingLogger::default();
        let retries = WithLockRetries::new(&executor, &config, &logger);

        retries
            .run(true, &mut || {
                executor.execute("LOCK TABLE \"events\" IN ACCESS EXCLUSIVE MODE", &[])?;
                Ok(Completion::Commit)
            })
            .unwrap();

        assert_eq!(
            executor.statements(),
            vec![
                "BEGIN",
                "SET LOCAL lock_timeout TO '100ms'",
                "LOCK TABLE \"events\" IN ACCESS EXCLUSIVE MODE",
                "COMMIT",
            ]
        );
        assert!(logger.warnings().is_empty());
    }

    #[test]
    fn test_retries_with_growing_lock_timeout() {
        let executor = RecordingExecutor::default();
        let config = LockRetryConfig::immediate(3);
        let logger = RecordingLogger::default();
        let retries = WithLockRetries::new(&executor, &config, &logger);
        let calls = Cell::new(0);

        retries
            .run(true, &mut || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(lock_timeout_error())
                } else {
                    Ok(Completion::Commit)
                }
            })
            .unwrap();

        assert_eq!(calls.get(), 3);
        let timeouts: Vec<String> = executor
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("SET LOCAL"))
            .collect();
        assert_eq!(
            timeouts,
            vec![
                "SET LOCAL lock_timeout TO '100ms'",
                "SET LOCAL lock_timeout TO '200ms'",
                "SET LOCAL lock_timeout TO '300ms'",
            ]
        );
        assert_eq!(executor.count("ROLLBACK"), 2);
        assert_eq!(executor.count("COMMIT"), 1);
        assert_eq!(logger.warnings().len(), 2);
        assert_eq!(logger.warnings()[0].get("attempt"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_exhaustion_raises_when_requested() {
        let executor = RecordingExecutor::default();
        let config = LockRetryConfig::immediate(2);
        let logger = RecordingLogger::default();
        let retries = WithLockRetries::new(&executor, &config, &logger);

        let err = retries
            .run(true, &mut || Err(lock_timeout_error()))
            .unwrap_err();

        assert!(matches!(err, PartitionError::LockRetriesExhausted { attempts: 2, .. }));
        assert_eq!(executor.count("BEGIN"), 2);
    }

    #[test]
    fn test_exhaustion_without_raise_runs_without_timeout() {
        let executor = RecordingExecutor::default();
        let config = LockRetryConfig::immediate(2);
        let logger = RecordingLogger::default();
        let retries = WithLockRetries::new(&executor, &config, &logger);
        let calls = Cell::new(0);

        retries
            .run(false, &mut || {
                calls.set(calls.get() + 1);
                if calls.get() <= 2 {
                    Err(lock_timeout_error())
                } else {
                    Ok(Completion::Commit)
                }
            })
            .unwrap();

        assert_eq!(calls.get(), 3);
        assert!(executor
            .statements()
            .contains(&"SET LOCAL lock_timeout TO '0ms'".to_string()));
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let executor = RecordingExecutor::default();
        let config = LockRetryConfig::immediate(5);
        let logger = RecordingLogger::default();
        let retries = WithLockRetries::new(&executor, &config, &logger);
        let calls = Cell::new(0);

        let err = retries
            .run(true, &mut || {
                calls.set(calls.get() + 1);
                Err(PartitionError::UnableToPartition("constraint missing".to_string()))
            })
            .unwrap_err();

        assert!(matches!(err, PartitionError::UnableToPartition(_)));
        assert_eq!(calls.get(), 1);
        assert_eq!(executor.count("ROLLBACK"), 1);
    }

    #[test]
    fn test_rollback_completion_rolls_back_without_error() {
        let executor = RecordingExecutor::default();
        let config = LockRetryConfig::immediate(1);
        let logger = RecordingLogger::default();
        let retries = WithLockRetries::new(&executor, &config, &logger);

        retries.run(true, &mut || Ok(Completion::Rollback)).unwrap();

        assert_eq!(executor.count("ROLLBACK"), 1);
        assert_eq!(executor.count("COMMIT"), 0);
    }
}
