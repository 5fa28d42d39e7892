//! Dedicated single-thread executor for confined backends
//!
//! Some native OCR bridges drive a callback-style completion and are not
//! reentrant: one thread, one call at a time. This worker owns that
//! thread. Jobs queue over a channel and run strictly in order; the async
//! caller waits with a bounded timeout and gives up rather than hang. A
//! timed-out job is never cancelled, it just answers nobody.

use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{BackendError, BrokerError};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ConfinedWorker {
    jobs: Sender<Job>,
    wait_limit: Duration,
}

impl ConfinedWorker {
    /// Spawn the worker thread. It exits when the worker is dropped and
    /// the queue drains.
    pub fn new(wait_limit: Duration) -> Self {
        let (jobs, job_rx) = unbounded::<Job>();
        std::thread::spawn(move || {
            debug!("confined worker thread starting");
            while let Ok(job) = job_rx.recv() {
                job();
            }
            debug!("confined worker thread exiting");
        });
        Self { jobs, wait_limit }
    }

    /// Run `task` on the worker thread.
    ///
    /// The outer error is broker-level: the bounded wait expired. The
    /// inner result is whatever the backend said.
    pub async fn run<T, F>(
        &self,
        engine: &str,
        task: F,
    ) -> Result<Result<T, BackendError>, BrokerError>
    where
        F: FnOnce() -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = reply_tx.send(task());
        });
        if self.jobs.send(job).is_err() {
            return Ok(Err(BackendError::native("confined worker is gone")));
        }
        match tokio::time::timeout(self.wait_limit, reply_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(Err(BackendError::native(
                "confined job dropped its reply",
            ))),
            Err(_) => {
                warn!(engine, limit = ?self.wait_limit, "confined backend call timed out");
                Err(BrokerError::RunLoopTimeout {
                    engine: engine.to_string(),
                    waited: self.wait_limit,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::join_all;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_jobs_one_at_a_time() {
        let worker = ConfinedWorker::new(Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = (0..4).map(|_| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            worker.run("test", move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, BackendError>(())
            })
        });
        for outcome in join_all(calls).await {
            outcome.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_wait_fails_without_cancelling_the_job() {
        let worker = ConfinedWorker::new(Duration::from_millis(40));
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);

        let outcome = worker
            .run("slow", move || {
                std::thread::sleep(Duration::from_millis(150));
                flag.store(true, Ordering::SeqCst);
                Ok::<_, BackendError>(7u32)
            })
            .await;

        assert!(matches!(
            outcome,
            Err(BrokerError::RunLoopTimeout { ref engine, .. }) if engine == "slow"
        ));
        assert!(!done.load(Ordering::SeqCst));

        // The job keeps running on the worker and finishes later.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn backend_errors_pass_through() {
        let worker = ConfinedWorker::new(Duration::from_secs(1));
        let outcome: Result<Result<(), _>, _> = worker
            .run("broken", || {
                Err(BackendError::Inference("bad tensor".to_string()))
            })
            .await;
        let inner = outcome.unwrap();
        assert!(matches!(inner, Err(BackendError::Inference(_))));
    }
}
