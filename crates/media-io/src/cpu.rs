use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

use crate::MediaError;

/// CPU usage of the current process, as a percentage of the whole machine,
/// measured since the last [`CpuSampler::reset`].
pub trait CpuSampler {
    fn usage(&mut self) -> f32;
    fn reset(&mut self);
}

pub trait CpuSamplerFactory {
    fn sampler(&self) -> Box<dyn CpuSampler>;
}

impl<F> CpuSamplerFactory for F
where
    F: Fn() -> Box<dyn CpuSampler>,
{
    fn sampler(&self) -> Box<dyn CpuSampler> { self() }
}

pub struct SystemCpuSampler {
    system: System,
    pid: Pid,
    cpus: f32,
}

impl SystemCpuSampler {
    pub fn new() -> Result<Self, MediaError> {
        let pid = sysinfo::get_current_pid().map_err(|e| MediaError::CpuSampler(e.to_string()))?;
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f32;
        let mut sampler = Self { system: System::new(), pid, cpus };
        sampler.refresh();
        debug!(pid = %pid, cpus, "cpu sampler ready");
        Ok(sampler)
    }

    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu(),
        );
    }
}

impl CpuSampler for SystemCpuSampler {
    fn usage(&mut self) -> f32 {
        self.refresh();
        self.system
            .process(self.pid)
            .map(|p| p.cpu_usage() / self.cpus)
            .unwrap_or(0.0)
    }

    fn reset(&mut self) { self.refresh(); }
}
