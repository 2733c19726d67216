//! Bounded worker pool for blocking batch jobs.
//!
//! Jobs run on tokio's blocking threads, at most `width` at a time. Each
//! job's error or panic is captured against its key; one failure never
//! cancels the rest of the batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of one job.
#[derive(Debug, Clone)]
pub struct BatchItem<K, T> {
    pub key: K,
    pub result: Result<T, String>,
    pub elapsed: Duration,
}

/// Per-key outcomes in submission order.
#[derive(Debug, Clone)]
pub struct BatchReport<K, T> {
    pub items: Vec<BatchItem<K, T>>,
    pub elapsed: Duration,
}

impl<K, T> BatchReport<K, T> {
    pub fn succeeded(&self) -> impl Iterator<Item = (&K, &T)> {
        self.items
            .iter()
            .filter_map(|i| i.result.as_ref().ok().map(|v| (&i.key, v)))
    }

    pub fn failed(&self) -> impl Iterator<Item = (&K, &str)> {
        self.items
            .iter()
            .filter_map(|i| i.result.as_ref().err().map(|e| (&i.key, e.as_str())))
    }

    pub fn success_count(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.items.len() - self.success_count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count() == 0
    }
}

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    width: usize,
}

impl WorkerPool {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run every job and collect its result under its key.
    pub async fn run_blocking<K, T, E, F>(&self, jobs: Vec<(K, F)>) -> BatchReport<K, T>
    where
        K: Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let started = Instant::now();
        let total = jobs.len();
        info!(jobs = total, width = self.width, "starting batch");

        let mut keys: Vec<Option<K>> = Vec::with_capacity(total);
        let mut set = JoinSet::new();
        for (index, (key, job)) in jobs.into_iter().enumerate() {
            keys.push(Some(key));
            let semaphore = Arc::clone(&self.semaphore);
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (index, Err("worker pool closed".to_string()), Duration::ZERO)
                    }
                };
                let job_started = Instant::now();
                let result = match tokio::task::spawn_blocking(job).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(join) if join.is_panic() => Err(format!("job panicked: {join}")),
                    Err(join) => Err(format!("job cancelled: {join}")),
                };
                (index, result, job_started.elapsed())
            });
        }

        let mut results: Vec<Option<(Result<T, String>, Duration)>> =
            (0..total).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result, elapsed)) => {
                    if let Err(e) = &result {
                        warn!(index, error = %e, "batch job failed");
                    }
                    results[index] = Some((result, elapsed));
                }
                Err(e) => warn!(error = %e, "batch task aborted"),
            }
        }

        let items: Vec<BatchItem<K, T>> = keys
            .into_iter()
            .zip(results)
            .filter_map(|(key, outcome)| {
                let key = key?;
                let (result, elapsed) =
                    outcome.unwrap_or_else(|| (Err("job did not finish".into()), Duration::ZERO));
                Some(BatchItem {
                    key,
                    result,
                    elapsed,
                })
            })
            .collect();

        let report = BatchReport {
            items,
            elapsed: started.elapsed(),
        };
        debug!(
            ok = report.success_count(),
            failed = report.failure_count(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_width_is_respected() {
        let pool = WorkerPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<(usize, _)> = (0..12)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                let job = move || -> Result<usize, String> {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i * 2)
                };
                (i, job)
            })
            .collect();

        let report = pool.run_blocking(jobs).await;
        assert!(report.all_succeeded());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let values: Vec<usize> = report.succeeded().map(|(_, v)| *v).collect();
        assert_eq!(values, (0..12).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let pool = WorkerPool::new(2);
        let jobs: Vec<(&str, Box<dyn FnOnce() -> Result<u32, String> + Send>)> = vec![
            ("ok", Box::new(|| Ok(1))),
            ("err", Box::new(|| Err("disk full".to_string()))),
            ("panic", Box::new(|| panic!("boom"))),
            ("ok2", Box::new(|| Ok(2))),
        ];
        let report = pool.run_blocking(jobs).await;
        assert_eq!(report.success_count(), 2);
        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0], (&"err", "disk full"));
        assert_eq!(failed[1].0, &"panic");
        assert!(failed[1].1.contains("panicked"));
    }
}
