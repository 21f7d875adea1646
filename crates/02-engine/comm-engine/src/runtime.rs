use std::time::{Duration, Instant};

use crate::error::EngineResult;

/// Something that makes progress when polled.
pub trait ServiceEngine: Send {
    /// Does whatever work is ready and reports how much was done.
    fn poll(&mut self) -> EngineResult<usize>;
    fn name(&self) -> &'static str;
    fn is_finished(&self) -> bool {
        false
    }
}

/// Round-robin driver for several engines on one thread.
pub struct WorkerRuntime {
    engines: Vec<Box<dyn ServiceEngine>>,
}

impl Default for WorkerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRuntime {
    pub fn new() -> Self {
        Self {
            engines: Vec::new(),
        }
    }

    pub fn register<E>(&mut self, engine: E)
    where
        E: ServiceEngine + 'static,
    {
        self.engines.push(Box::new(engine));
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn run_tick(&mut self) -> EngineResult<usize> {
        let mut work = 0;
        for engine in self.engines.iter_mut() {
            work += engine.poll()?;
        }
        Ok(work)
    }

    /// Ticks until every engine reports finished; `false` if `timeout` ran
    /// out first.
    pub fn run_until_finished(&mut self, timeout: Duration) -> EngineResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_tick()?;
            if self.engines.iter().all(|engine| engine.is_finished()) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                let pending: Vec<_> = self
                    .engines
                    .iter()
                    .filter(|engine| !engine.is_finished())
                    .map(|engine| engine.name())
                    .collect();
                tracing::warn!(?pending, "runtime timed out before all engines finished");
                return Ok(false);
            }
        }
    }
}
