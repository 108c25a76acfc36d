use super::{Fabric, FabricError, Task, TaskResources};
use crate::config::{FabricConfig, HostCapacity};
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::{debug, trace};

// tolerance for accumulated fractional shares
const EPSILON: f64 = 1e-9;

/// Accounting of cpu and gpu shares that are currently free
#[derive(Debug)]
struct ResourceGate {
    available: Mutex<TaskResources>,
    freed: Condvar,
}

impl ResourceGate {
    fn new(capacity: TaskResources) -> Self {
        Self {
            available: Mutex::new(capacity),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self, requested: TaskResources) -> Permit<'_> {
        let mut available = self.available.lock();
        while available.num_cpus + EPSILON < requested.num_cpus
            || available.num_gpus + EPSILON < requested.num_gpus
        {
            self.freed.wait(&mut available);
        }

        available.num_cpus -= requested.num_cpus;
        available.num_gpus -= requested.num_gpus;
        trace!(?available, "Reserved {requested:?}");

        Permit {
            gate: self,
            reserved: requested,
        }
    }

    fn release(&self, reserved: TaskResources) {
        let mut available = self.available.lock();
        available.num_cpus += reserved.num_cpus;
        available.num_gpus += reserved.num_gpus;
        self.freed.notify_all();
    }
}

/// releases its reservation when dropped, also when the task unwinds
struct Permit<'a> {
    gate: &'a ResourceGate,
    reserved: TaskResources,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.gate.release(self.reserved);
    }
}

/// Fabric that works on a local thread pool
pub struct LocalFabric {
    host: HostCapacity,
    pool: Option<ThreadPool>,
    gate: Arc<ResourceGate>,
    capacity: TaskResources,
}

impl LocalFabric {
    pub fn new(host: HostCapacity) -> Self {
        let capacity = TaskResources {
            num_cpus: 0.0,
            num_gpus: 0.0,
        };

        Self {
            host,
            pool: None,
            gate: Arc::new(ResourceGate::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> TaskResources {
        self.capacity
    }

    fn is_feasible(&self, requested: &TaskResources) -> bool {
        requested.num_cpus <= self.capacity.num_cpus + EPSILON
            && requested.num_gpus <= self.capacity.num_gpus + EPSILON
    }
}

impl Fabric for LocalFabric {
    fn start(&mut self, config: &FabricConfig) -> Result<(), FabricError> {
        if self.pool.is_some() {
            return Err(FabricError::AlreadyStarted);
        }

        let thread_number = config.num_cpus.max(1);
        self.capacity = TaskResources {
            num_cpus: thread_number as f64,
            num_gpus: config.gpu_capacity(self.host) as f64,
        };

        debug!("Starting thread pool with {thread_number} threads");

        self.pool = Some(
            ThreadPoolBuilder::new()
                .num_threads(thread_number)
                .thread_name(|index| format!("flotilla-worker-{index}"))
                .build()?,
        );
        self.gate = Arc::new(ResourceGate::new(self.capacity));

        Ok(())
    }

    fn submit(&self, resources: TaskResources, task: Task) -> Result<(), FabricError> {
        let pool = self.pool.as_ref().ok_or(FabricError::NotStarted)?;

        if !self.is_feasible(&resources) {
            return Err(FabricError::Infeasible {
                requested: resources,
                capacity: self.capacity,
            });
        }

        let gate = self.gate.clone();
        pool.spawn(move || {
            let _permit = gate.acquire(resources);
            task();
        });

        Ok(())
    }

    /// pending tasks still run to completion on the detached workers
    fn shutdown(&mut self) {
        if self.pool.take().is_some() {
            debug!("Released local thread pool");
        }
    }

    fn is_running(&self) -> bool {
        self.pool.is_some()
    }
}
