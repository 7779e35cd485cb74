//! Task execution facilities for the build phase.

use std::fmt;

/// One unit of independent work.
pub type Task<'s> = Box<dyn FnOnce() + Send + 's>;

/// Runs a batch of independent tasks and blocks until all of them finish.
///
/// Implementations must run every task exactly once. Tasks catch their own
/// failures; executors only provide the threads.
pub trait TaskExecutor: Send + Sync {
    fn run_all<'s>(&self, tasks: Vec<Task<'s>>);

    fn name(&self) -> &str;
}

/// Runs tasks in submission order on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialExecutor;

impl TaskExecutor for SerialExecutor {
    fn run_all<'s>(&self, tasks: Vec<Task<'s>>) {
        for task in tasks {
            task();
        }
    }

    fn name(&self) -> &str {
        "serial"
    }
}

/// Runs tasks on rayon, either on the global pool or on a dedicated one.
#[derive(Default)]
pub struct RayonExecutor {
    pool: Option<rayon::ThreadPool>,
}

impl RayonExecutor {
    /// Executor backed by rayon's global pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor with its own pool of `threads` workers; 0 uses the global pool.
    pub fn with_threads(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        if threads == 0 {
            return Ok(Self::new());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("tensorsel-build-{idx}"))
            .build()?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

impl TaskExecutor for RayonExecutor {
    fn run_all<'s>(&self, tasks: Vec<Task<'s>>) {
        let spawn_all = |scope: &rayon::Scope<'s>| {
            for task in tasks {
                scope.spawn(move |_| task());
            }
        };
        match &self.pool {
            Some(pool) => pool.scope(spawn_all),
            None => rayon::scope(spawn_all),
        }
    }

    fn name(&self) -> &str {
        "rayon"
    }
}

impl fmt::Debug for RayonExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayonExecutor")
            .field("threads", &self.threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn every_task_runs_once() {
        let counter = AtomicUsize::new(0);
        let executors: Vec<Box<dyn TaskExecutor>> = vec![
            Box::new(SerialExecutor),
            Box::new(RayonExecutor::with_threads(3).expect("pool")),
        ];
        for executor in &executors {
            let tasks: Vec<Task<'_>> = (0..16)
                .map(|_| {
                    let counter = &counter;
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }) as Task<'_>
                })
                .collect();
            executor.run_all(tasks);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }
}
