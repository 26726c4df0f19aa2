// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded worker pool for per-client jobs
//!
//! Jobs go out over a crossbeam channel to scoped worker threads; results come
//! back keyed by client id, and `run` returns only after every worker joined.

use crossbeam_channel::{bounded, unbounded};
use fedclust_core::{ClientId, Result};
use std::collections::BTreeMap;
use std::thread;

/// Fixed-size pool of scoped worker threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    /// Pool with `workers` threads (at least one)
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// One worker per available core
    pub fn available() -> Self {
        Self::new(thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` once per client and collect the results by client id
    ///
    /// All jobs run to completion even if one fails. The error returned is
    /// the one from the lowest failing client id, so failures are reported
    /// the same way regardless of scheduling.
    pub fn run<T, F>(&self, clients: &[ClientId], job: F) -> Result<BTreeMap<ClientId, T>>
    where
        T: Send,
        F: Fn(ClientId) -> Result<T> + Sync,
    {
        let threads = self.workers.min(clients.len());
        let outcomes: Vec<(ClientId, Result<T>)> = if threads <= 1 {
            clients.iter().map(|&c| (c, job(c))).collect()
        } else {
            let (job_tx, job_rx) = bounded::<ClientId>(clients.len());
            let (result_tx, result_rx) = unbounded();
            for &client in clients {
                // Capacity equals the job count, so this never blocks
                let _ = job_tx.send(client);
            }
            drop(job_tx);

            thread::scope(|scope| {
                for worker in 0..threads {
                    let job_rx = job_rx.clone();
                    let result_tx = result_tx.clone();
                    let job = &job;
                    scope.spawn(move || {
                        for client in job_rx.iter() {
                            tracing::trace!(worker, client, "Running client job");
                            if result_tx.send((client, job(client))).is_err() {
                                break;
                            }
                        }
                    });
                }
            });
            drop(result_tx);
            result_rx.iter().collect()
        };

        let mut results = BTreeMap::new();
        let mut first_error: Option<(ClientId, fedclust_core::FedError)> = None;
        for (client, outcome) in outcomes {
            match outcome {
                Ok(value) => {
                    results.insert(client, value);
                }
                Err(err) => {
                    if first_error.as_ref().map_or(true, |(c, _)| client < *c) {
                        first_error = Some((client, err));
                    }
                }
            }
        }

        match first_error {
            Some((_, err)) => Err(err),
            None => Ok(results),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedclust_core::FedError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_results_keyed_by_client() {
        let pool = WorkerPool::new(4);
        let clients: Vec<ClientId> = (0..17).collect();
        let results = pool.run(&clients, |c| Ok(c * c)).unwrap();
        assert_eq!(results.len(), 17);
        for (c, sq) in results {
            assert_eq!(sq, c * c);
        }
    }

    #[test]
    fn test_every_job_runs_once() {
        let calls = AtomicUsize::new(0);
        let pool = WorkerPool::new(3);
        pool.run(&[5, 1, 9, 2], |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_lowest_failing_client_wins() {
        for workers in [1, 4] {
            let pool = WorkerPool::new(workers);
            let err = pool
                .run(&[0, 1, 2, 3, 4, 5], |c| {
                    if c == 2 || c == 4 {
                        Err(FedError::Config(format!("client {} failed", c)))
                    } else {
                        Ok(c)
                    }
                })
                .unwrap_err();
            assert_eq!(err.to_string(), "Invalid configuration: client 2 failed");
        }
    }

    #[test]
    fn test_inline_path_runs_past_failures() {
        let calls = AtomicUsize::new(0);
        let pool = WorkerPool::new(1);
        let err = pool
            .run(&[3, 0, 1, 2], |c| {
                calls.fetch_add(1, Ordering::SeqCst);
                if c == 3 || c == 1 {
                    Err(FedError::Config(format!("client {} failed", c)))
                } else {
                    Ok(c)
                }
            })
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.to_string(), "Invalid configuration: client 1 failed");
    }

    #[test]
    fn test_zero_workers_clamped() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.workers(), 1);
        assert!(pool.run(&[], |c| Ok(c)).unwrap().is_empty());
    }
}
