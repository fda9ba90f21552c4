use super::process::{WorkerProcess, WorkerSpec};
use super::protocol::WorkerResponse;
use crate::error::WorkerError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub generation: u64,
    pub size: usize,
    pub idle: usize,
    pub requests: u64,
    pub respawns: u64,
}

/// Fixed-size pool of persistent workers.
///
/// Each slot serves one request at a time. Process-level failures are
/// handled inside `submit`: the worker is replaced and the request retried
/// once before the error reaches the caller.
pub struct WorkerPool {
    spec: WorkerSpec,
    slots: Vec<Mutex<Option<WorkerProcess>>>,
    idle: StdMutex<VecDeque<usize>>,
    semaphore: Semaphore,
    shut_down: AtomicBool,
    generation: u64,
    requests: AtomicU64,
    respawns: AtomicU64,
}

impl WorkerPool {
    /// Spawn `size` workers. Fails if any of them cannot be started.
    pub fn start(spec: WorkerSpec, size: usize, generation: u64) -> Result<Self, WorkerError> {
        let size = size.max(1);
        info!(
            "Starting worker pool generation {} with {} worker(s)",
            generation, size
        );

        let mut slots = Vec::with_capacity(size);
        for index in 0..size {
            let worker = WorkerProcess::spawn(&spec).map_err(|e| {
                WorkerError::Unavailable(format!("worker {index} failed to start: {e}"))
            })?;
            slots.push(Mutex::new(Some(worker)));
        }

        Ok(Self {
            spec,
            slots,
            idle: StdMutex::new((0..size).collect()),
            semaphore: Semaphore::new(size),
            shut_down: AtomicBool::new(false),
            generation,
            requests: AtomicU64::new(0),
            respawns: AtomicU64::new(0),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Run one request on the next free worker.
    pub async fn submit(&self, arguments: Vec<String>) -> Result<WorkerResponse, WorkerError> {
        if self.is_shut_down() {
            return Err(WorkerError::ShutDown);
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| WorkerError::ShutDown)?;
        let index = self
            .idle
            .lock()
            .ok()
            .and_then(|mut idle| idle.pop_front())
            .ok_or_else(|| WorkerError::Unavailable("no idle slot".to_string()))?;
        let _slot = IdleReturn { pool: self, index };

        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.slots[index].lock().await;
        if self.is_shut_down() {
            return Err(WorkerError::ShutDown);
        }
        self.submit_on_slot(index, &mut *slot, arguments).await
    }

    async fn submit_on_slot(
        &self,
        index: usize,
        slot: &mut Option<WorkerProcess>,
        arguments: Vec<String>,
    ) -> Result<WorkerResponse, WorkerError> {
        let worker_alive = match slot.as_mut() {
            Some(worker) => worker.is_alive(),
            None => false,
        };
        if !worker_alive {
            debug!("Worker in slot {} is gone, respawning before use", index);
            self.replace_worker(index, slot).await?;
        }

        let first_error = match Self::send(slot, arguments.clone()).await {
            Ok(response) => return Ok(response),
            Err(WorkerError::TimedOut(limit)) => {
                // A stalled worker is replaced, but the request is not
                // replayed: it already consumed its time budget.
                warn!("Worker in slot {} timed out after {:?}", index, limit);
                if let Err(e) = self.replace_worker(index, slot).await {
                    error!("Could not replace stalled worker in slot {}: {}", index, e);
                }
                return Err(WorkerError::TimedOut(limit));
            }
            Err(e) => e,
        };

        warn!(
            "Worker in slot {} failed ({}), respawning and retrying once",
            index, first_error
        );
        self.replace_worker(index, slot).await?;

        match Self::send(slot, arguments).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Retry on fresh worker in slot {} failed: {}", index, e);
                if let Some(mut worker) = slot.take() {
                    worker.kill().await;
                }
                Err(WorkerError::Crashed(format!(
                    "request failed twice: {first_error}; then {e}"
                )))
            }
        }
    }

    async fn send(
        slot: &mut Option<WorkerProcess>,
        arguments: Vec<String>,
    ) -> Result<WorkerResponse, WorkerError> {
        match slot.as_mut() {
            Some(worker) => worker.request(arguments).await,
            None => Err(WorkerError::Crashed("slot has no worker".to_string())),
        }
    }

    async fn replace_worker(
        &self,
        index: usize,
        slot: &mut Option<WorkerProcess>,
    ) -> Result<(), WorkerError> {
        if let Some(mut old) = slot.take() {
            old.kill().await;
        }
        let worker = WorkerProcess::spawn(&self.spec).map_err(|e| {
            WorkerError::Unavailable(format!("respawn of worker {index} failed: {e}"))
        })?;
        self.respawns.fetch_add(1, Ordering::Relaxed);
        info!("Worker slot {} now runs pid {:?}", index, worker.pid());
        *slot = Some(worker);
        Ok(())
    }

    /// Terminate all workers and wait for them to exit. In-flight requests
    /// finish first. Calling this more than once is harmless.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker pool generation {}", self.generation);
        self.semaphore.close();

        let exits = self.slots.iter().map(|slot| async move {
            let worker = slot.lock().await.take();
            if let Some(worker) = worker {
                worker.shutdown().await;
            }
        });
        futures::future::join_all(exits).await;
    }

    /// Pids of the current workers, in slot order. Waits for busy slots.
    pub async fn worker_pids(&self) -> Vec<Option<u32>> {
        let mut pids = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            pids.push(slot.lock().await.as_ref().and_then(|w| w.pid()));
        }
        pids
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            generation: self.generation,
            size: self.slots.len(),
            idle: self.idle.lock().map(|idle| idle.len()).unwrap_or(0),
            requests: self.requests.load(Ordering::Relaxed),
            respawns: self.respawns.load(Ordering::Relaxed),
        }
    }
}

/// Puts a slot index back on the idle queue when a submit finishes.
struct IdleReturn<'a> {
    pool: &'a WorkerPool,
    index: usize,
}

impl Drop for IdleReturn<'_> {
    fn drop(&mut self) {
        if let Ok(mut idle) = self.pool.idle.lock() {
            idle.push_back(self.index);
        }
    }
}
