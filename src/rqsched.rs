//! Request schedulers: policies assigning arrival times to a step's batch.
//!
//! The `step` hook runs under the workload's step mutex and returns the
//! full arrival plan for the step; request creation consumes it. `simple`
//! is stateless, `iat` accumulates inter-arrival draws, `think` models a
//! closed user population and reschedules each user from `post_request`.
//!
//! Distributions are sampled in seconds and converted to nanoseconds.

use crate::config::RqschedSpec;
use crate::errors::{Error, Result};
use crate::randgen::{self, RandomGen, RandomVariate};
use crate::time::{TimeNs, T_SEC};
use crate::workload::Request;

/// One planned arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    /// Nanoseconds relative to the workload's start clock.
    pub sched_time: TimeNs,
    pub user_id: u32,
}

/// Arrival policy of one workload.
pub trait RequestScheduler: Send {
    /// Plan the arrivals of step `step_id`. `count` is the externally
    /// provided demand; closed-population policies may ignore it.
    fn step(&mut self, step_id: u64, count: u32, quantum: TimeNs) -> Vec<Arrival>;

    /// Observe a completed request. Only stateful policies care.
    fn post_request(&mut self, _rq: &Request) {}

    fn name(&self) -> &'static str;
}

/// Every request of step k arrives at `k * quantum`.
pub struct SimpleScheduler;

impl RequestScheduler for SimpleScheduler {
    fn step(&mut self, step_id: u64, count: u32, quantum: TimeNs) -> Vec<Arrival> {
        let sched_time = step_id as TimeNs * quantum;
        (0..count)
            .map(|_| Arrival {
                sched_time,
                user_id: 0,
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

/// Inter-arrival-time scheduler: consecutive arrivals are separated by
/// draws from the variate, optionally clamped around the mean by `scope`.
pub struct IatScheduler {
    gen: Box<dyn RandomGen>,
    var: Box<dyn RandomVariate>,
    scope: f64,
    next: TimeNs,
}

impl IatScheduler {
    pub fn new(
        gen: Box<dyn RandomGen>,
        var: Box<dyn RandomVariate>,
        scope: f64,
    ) -> Result<IatScheduler> {
        if !(0.0..=1.0).contains(&scope) {
            return Err(Error::invalid_value(
                "rqsched.scope",
                format!("scope {scope} outside [0, 1]"),
            ));
        }
        Ok(IatScheduler {
            gen,
            var,
            scope,
            next: 0,
        })
    }

    fn draw_interval(&mut self) -> TimeNs {
        let mut x = self.var.sample(self.gen.as_mut());
        if self.scope > 0.0 {
            let mean = self.var.mean();
            let lo = (1.0 - self.scope) * mean;
            let hi = (1.0 + self.scope) * mean;
            x = x.clamp(lo, hi);
        }
        (x.max(0.0) * T_SEC as f64) as TimeNs
    }
}

impl RequestScheduler for IatScheduler {
    fn step(&mut self, step_id: u64, count: u32, quantum: TimeNs) -> Vec<Arrival> {
        // A quiet step leaves `next` in the past; resume at the step
        // boundary. Arrivals projected past the boundary are still
        // assigned (late arrivals are the discard policy's call).
        let step_start = step_id as TimeNs * quantum;
        if self.next < step_start {
            self.next = step_start;
        }
        let mut plan = Vec::with_capacity(count as usize);
        for _ in 0..count {
            plan.push(Arrival {
                sched_time: self.next,
                user_id: 0,
            });
            self.next += self.draw_interval();
        }
        plan
    }

    fn name(&self) -> &'static str {
        "iat"
    }
}

const USER_WAITING: TimeNs = TimeNs::MAX;

/// Think-time scheduler: `nusers` users each issue a request, think for a
/// drawn interval after completion, then issue again.
pub struct ThinkScheduler {
    gen: Box<dyn RandomGen>,
    var: Box<dyn RandomVariate>,
    /// Per-user next think-end; `USER_WAITING` while a request is out.
    users: Vec<TimeNs>,
}

impl ThinkScheduler {
    pub fn new(
        gen: Box<dyn RandomGen>,
        var: Box<dyn RandomVariate>,
        nusers: u32,
    ) -> Result<ThinkScheduler> {
        if nusers == 0 {
            return Err(Error::invalid_value(
                "rqsched.nusers",
                "user population must be at least 1",
            ));
        }
        Ok(ThinkScheduler {
            gen,
            var,
            users: vec![0; nusers as usize],
        })
    }
}

impl RequestScheduler for ThinkScheduler {
    fn step(&mut self, step_id: u64, _count: u32, quantum: TimeNs) -> Vec<Arrival> {
        let step_start = step_id as TimeNs * quantum;
        let step_end = step_start + quantum;
        let mut plan = Vec::new();
        for (uid, next_start) in self.users.iter_mut().enumerate() {
            if *next_start < step_end {
                plan.push(Arrival {
                    sched_time: (*next_start).max(step_start),
                    user_id: uid as u32,
                });
                *next_start = USER_WAITING;
            }
        }
        plan.sort_by_key(|a| a.sched_time);
        plan
    }

    fn post_request(&mut self, rq: &Request) {
        let uid = rq.user_id as usize;
        if uid < self.users.len() {
            let think = (self.var.sample(self.gen.as_mut()).max(0.0) * T_SEC as f64) as TimeNs;
            self.users[uid] = rq.end_time + think;
        }
    }

    fn name(&self) -> &'static str {
        "think"
    }
}

/// Build a scheduler from its spec. Malformed configuration is rejected
/// before any state is created.
pub fn create_scheduler(spec: &RqschedSpec) -> Result<Box<dyn RequestScheduler>> {
    match spec {
        RqschedSpec::Simple => Ok(Box::new(SimpleScheduler)),
        RqschedSpec::Iat {
            randgen,
            distribution,
            scope,
        } => {
            let gen = randgen::create_generator(randgen)?;
            let var = randgen::create_variate(distribution)?;
            Ok(Box::new(IatScheduler::new(gen, var, *scope)?))
        }
        RqschedSpec::Think {
            randgen,
            distribution,
            nusers,
        } => {
            let gen = randgen::create_generator(randgen)?;
            let var = randgen::create_variate(distribution)?;
            Ok(Box::new(ThinkScheduler::new(gen, var, *nusers)?))
        }
    }
}
