use std::time::Duration;

use media_io::{CpuSampler, MediaError, Pipeline, PipelineState, SeekFlags};
use timeline::ClockTime;
use tracing::{debug, trace, warn};

const SLOWER: f64 = 0.9;
const FASTER: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimits {
    /// CPU percentage above which the rate shrinks.
    pub target: f32,
    /// Below this rate the pipeline is suspended instead of slowed further.
    pub floor: f64,
    /// A suspended pipeline resumes once the rate recovered above this.
    pub resume_above: f64,
}

/// Modulates the playback rate of a flowing pipeline so analysis backs off
/// while the process is busy.
///
/// The controller does not own the pipeline: the owning job lends it for every
/// [`RateController::cycle`] and forwards its state changes.
pub struct RateController {
    sampler: Box<dyn CpuSampler>,
    limits: RateLimits,
    rate: f64,
    suspended: bool,
    resuming: bool,
    last_position: ClockTime,
    stopped: bool,
}

impl RateController {
    pub fn new(mut sampler: Box<dyn CpuSampler>, limits: RateLimits) -> Self {
        sampler.reset();
        Self { sampler, limits, rate: 1.0, suspended: false, resuming: false, last_position: 0, stopped: false }
    }

    pub fn rate(&self) -> f64 { self.rate }

    pub fn is_suspended(&self) -> bool { self.suspended }

    pub fn is_stopped(&self) -> bool { self.stopped }

    /// The next cycle returns false without touching the pipeline.
    pub fn stop(&mut self) { self.stopped = true; }

    /// Samples CPU usage and adapts the rate. Returns whether the caller
    /// should schedule another cycle.
    pub fn cycle(&mut self, pipeline: &mut dyn Pipeline) -> bool {
        if self.stopped {
            return false;
        }
        let usage = self.sampler.usage();
        self.sampler.reset();

        if usage >= self.limits.target {
            if self.rate < self.limits.floor {
                if !self.suspended {
                    self.suspend(pipeline);
                }
            } else {
                self.rate *= SLOWER;
            }
        } else {
            self.rate *= FASTER;
            if self.suspended && !self.resuming && self.rate > self.limits.resume_above {
                debug!(rate = self.rate, "resuming suspended pipeline");
                match pipeline.set_state(PipelineState::Paused) {
                    Ok(()) => self.resuming = true,
                    Err(e) => warn!(error = %e, "could not resume pipeline"),
                }
            }
        }
        trace!(usage, rate = self.rate, suspended = self.suspended, "rate cycle");

        if !self.suspended {
            match pipeline.query_position() {
                Some(position) => {
                    if let Err(e) = reseek(pipeline, self.rate, position) {
                        warn!(error = %e, rate = self.rate, "rate change failed");
                    }
                }
                None => debug!("position unknown, keeping current rate"),
            }
        }
        true
    }

    /// Forwarded pipeline state changes; completes a resume from suspension.
    pub fn on_state_changed(&mut self, prev: PipelineState, new: PipelineState, pipeline: &mut dyn Pipeline) {
        if !(self.suspended && prev == PipelineState::Ready && new == PipelineState::Paused) {
            return;
        }
        debug!(position = self.last_position, "pipeline resumed, seeking back");
        self.suspended = false;
        self.resuming = false;
        let resumed = pipeline
            .seek(1.0, SeekFlags::FLUSH_ACCURATE, self.last_position)
            .and_then(|_| pipeline.set_state(PipelineState::Playing));
        if let Err(e) = resumed {
            warn!(error = %e, "could not restart suspended pipeline");
        }
    }

    fn suspend(&mut self, pipeline: &mut dyn Pipeline) {
        self.last_position = pipeline.query_position().unwrap_or(self.last_position);
        debug!(rate = self.rate, position = self.last_position, "suspending pipeline");
        match pipeline.set_state(PipelineState::Ready) {
            Ok(()) => self.suspended = true,
            Err(e) => warn!(error = %e, "could not suspend pipeline"),
        }
    }
}

fn reseek(pipeline: &mut dyn Pipeline, rate: f64, position: ClockTime) -> Result<(), MediaError> {
    pipeline.set_state(PipelineState::Paused)?;
    pipeline.seek(rate, SeekFlags::FLUSH_ACCURATE, position)?;
    pipeline.set_state(PipelineState::Playing)
}

/// Adapts the delay between two thumbnail requests to the measured CPU usage.
pub struct IntervalController {
    sampler: Box<dyn CpuSampler>,
    target: f32,
    interval: Duration,
}

impl IntervalController {
    pub fn new(mut sampler: Box<dyn CpuSampler>, target: f32, initial: Duration) -> Self {
        sampler.reset();
        Self { sampler, target, interval: initial }
    }

    pub fn interval(&self) -> Duration { self.interval }

    /// Samples usage and returns the delay until the next request.
    pub fn cycle(&mut self) -> Duration {
        let usage = self.sampler.usage();
        self.sampler.reset();
        self.interval = if usage < self.target {
            self.interval.mul_f64(SLOWER)
        } else {
            self.interval.mul_f64(FASTER)
        };
        trace!(usage, interval_ms = self.interval.as_millis() as u64, "interval cycle");
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, CpuScript, FakeFactory};
    use timeline::SECOND;

    const LIMITS: RateLimits = RateLimits { target: 30.0, floor: 0.1, resume_above: 0.5 };

    #[test]
    fn test_rate_shrinks_until_suspension() {
        let factory = FakeFactory::default();
        factory.state().position = Some(5 * SECOND);
        let mut pipeline = factory.pipeline();
        let cpu = CpuScript::constant(90.0);
        let mut controller = RateController::new(cpu.sampler(), LIMITS);

        let mut previous = controller.rate();
        while !controller.is_suspended() {
            assert!(controller.cycle(pipeline.as_mut()));
            if !controller.is_suspended() {
                assert!(controller.rate() < previous);
                assert!(controller.rate() > 0.0);
                previous = controller.rate();
            }
            assert!(previous > 0.05, "never suspended");
        }
        assert!(controller.rate() < LIMITS.floor);
        assert_eq!(factory.calls().last(), Some(&Call::SetState(PipelineState::Ready)));

        // no seeks while suspended
        let seeks = factory.seeks().len();
        controller.cycle(pipeline.as_mut());
        assert_eq!(factory.seeks().len(), seeks);
    }

    #[test]
    fn test_each_cycle_reseeks_at_new_rate() {
        let factory = FakeFactory::default();
        factory.state().position = Some(2 * SECOND);
        let mut pipeline = factory.pipeline();
        let cpu = CpuScript::new(&[50.0, 10.0]);
        let mut controller = RateController::new(cpu.sampler(), LIMITS);

        controller.cycle(pipeline.as_mut());
        controller.cycle(pipeline.as_mut());
        let seeks = factory.seeks();
        assert_eq!(seeks.len(), 2);
        assert!((seeks[0].0 - 0.9).abs() < 1e-9);
        assert!((seeks[1].0 - 0.99).abs() < 1e-9);
        assert!(seeks.iter().all(|(_, position)| *position == 2 * SECOND));
        assert_eq!(
            factory.calls()[..3],
            [Call::SetState(PipelineState::Paused), Call::Seek { rate: 0.9, position: 2 * SECOND }, Call::SetState(PipelineState::Playing)]
        );
    }

    #[test]
    fn test_suspended_pipeline_resumes_at_remembered_position() {
        let factory = FakeFactory::default();
        factory.state().position = Some(7 * SECOND);
        let mut pipeline = factory.pipeline();
        let cpu = CpuScript::constant(90.0);
        let mut controller = RateController::new(cpu.sampler(), LIMITS);
        while !controller.is_suspended() {
            controller.cycle(pipeline.as_mut());
        }
        factory.state().position = None;

        cpu.set(5.0);
        while controller.rate() <= LIMITS.resume_above {
            controller.cycle(pipeline.as_mut());
        }
        assert_eq!(factory.calls().last(), Some(&Call::SetState(PipelineState::Paused)));
        assert!(controller.is_suspended());

        factory.clear_calls();
        controller.on_state_changed(PipelineState::Ready, PipelineState::Paused, pipeline.as_mut());
        assert!(!controller.is_suspended());
        assert_eq!(
            factory.calls(),
            vec![Call::Seek { rate: 1.0, position: 7 * SECOND }, Call::SetState(PipelineState::Playing)]
        );
    }

    #[test]
    fn test_unrelated_state_changes_are_ignored() {
        let factory = FakeFactory::default();
        let mut pipeline = factory.pipeline();
        let mut controller = RateController::new(CpuScript::constant(0.0).sampler(), LIMITS);
        controller.on_state_changed(PipelineState::Ready, PipelineState::Paused, pipeline.as_mut());
        assert!(factory.calls().is_empty());
    }

    #[test]
    fn test_stopped_controller_ends_cycling() {
        let factory = FakeFactory::default();
        let mut pipeline = factory.pipeline();
        let mut controller = RateController::new(CpuScript::constant(0.0).sampler(), LIMITS);
        controller.stop();
        assert!(!controller.cycle(pipeline.as_mut()));
        assert!(factory.calls().is_empty());
    }

    #[test]
    fn test_interval_tracks_usage() {
        let cpu = CpuScript::new(&[5.0, 5.0, 40.0]);
        let mut controller = IntervalController::new(cpu.sampler(), 20.0, Duration::from_millis(500));
        let close = |actual: Duration, millis: f64| (actual.as_secs_f64() * 1000.0 - millis).abs() < 1e-3;
        assert!(close(controller.cycle(), 450.0));
        assert!(close(controller.cycle(), 405.0));
        assert!(close(controller.cycle(), 445.5));
        assert!(close(controller.interval(), 445.5));
    }
}
