//! Workloads: lifecycle state machine, step queue and request factory.
//!
//! A workload binds a workload type to a threadpool (or chains onto
//! another workload), owns its parameter generators and scheduler, and
//! feeds the controller one step's worth of requests at a time. Status
//! transitions are latched into a history bitset so fast paths can check
//! "has this ever been X" without taking the status mutex.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::TraceRequestSpec;
use crate::errors::{Error, Result};
use crate::reporter::NotifierHandle;
use crate::rqsched::{Arrival, RequestScheduler};
use crate::time::{self, TimeNs, TIME_MAX};
use crate::wlparam::{ParamDescr, ParamValue};
use crate::wlpgen::PgenSet;

/// Step queue depth. Power of two; one slot is reserved for the step the
/// controller may still be processing.
pub const WL_STEP_QUEUE_SIZE: usize = 16;
const WL_STEP_QUEUE_MASK: usize = WL_STEP_QUEUE_SIZE - 1;

/// Request was handed to the workload module.
pub const RQF_STARTED: u16 = 0x01;
/// Request execution completed (module returned).
pub const RQF_FINISHED: u16 = 0x02;
/// Request started no later than its scheduled arrival.
pub const RQF_ONTIME: u16 = 0x04;
/// Module reported success.
pub const RQF_SUCCESS: u16 = 0x08;
/// Request was supplied externally (trace replay).
pub const RQF_TRACE: u16 = 0x10;

/// Workload lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WlStatus {
    New = 0,
    Chained,
    Configuring,
    CfgFail,
    Configured,
    Started,
    Running,
    Finished,
    Stopped,
    Destroyed,
}

impl WlStatus {
    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WlStatus::CfgFail | WlStatus::Finished | WlStatus::Stopped | WlStatus::Destroyed
        )
    }
}

impl std::fmt::Display for WlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WlStatus::New => "new",
            WlStatus::Chained => "chained",
            WlStatus::Configuring => "configuring",
            WlStatus::CfgFail => "cfg_fail",
            WlStatus::Configured => "configured",
            WlStatus::Started => "started",
            WlStatus::Running => "running",
            WlStatus::Finished => "finished",
            WlStatus::Stopped => "stopped",
            WlStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// The four callbacks a workload module provides. `run_request` is foreign
/// code: the engine never holds internal locks across the call.
pub trait WorkloadModule: Send + Sync {
    fn config(&self, _wl: &Workload) -> Result<()> {
        Ok(())
    }

    fn unconfig(&self, _wl: &Workload) -> Result<()> {
        Ok(())
    }

    fn run_request(&self, rq: &Request) -> Result<()>;
}

/// A registered workload type: parameter declarations plus module callbacks.
pub struct WorkloadType {
    pub name: String,
    pub params: Vec<ParamDescr>,
    pub module: Box<dyn WorkloadModule>,
}

impl WorkloadType {
    pub fn request_params(&self) -> impl Iterator<Item = &ParamDescr> {
        self.params.iter().filter(|d| d.per_request)
    }
}

/// A single unit of work. Owned by exactly one queue (or thread) at a
/// time; a chained child rides in `chain_next` until its parent finishes.
pub struct Request {
    pub id: u32,
    pub step: u64,
    pub user_id: u32,

    /// Worker the request was (or will be) dispatched to; -1 if unassigned.
    pub worker_id: i32,

    /// Request id of the chain parent; -1 for requests with no parent.
    pub chain_request: i32,

    /// Times in nanoseconds relative to the workload's start clock.
    pub sched_time: TimeNs,
    pub start_time: TimeNs,
    pub end_time: TimeNs,

    /// Requests already due on the worker queue when this one was picked.
    pub queue_len: i32,

    pub flags: u16,

    /// Per-request parameter values, ordered like the type's per-request
    /// descriptors.
    pub params: Vec<ParamValue>,

    pub workload: Arc<Workload>,
    pub chain_next: Option<Box<Request>>,
}

impl Request {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    /// Look up a per-request parameter by name.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.workload
            .wltype
            .request_params()
            .position(|d| d.name == name)
            .and_then(|idx| self.params.get(idx))
    }

    /// Absolute arrival time on the monotonic clock.
    pub(crate) fn abs_sched_time(&self) -> TimeNs {
        let start_clock = self.workload.start_clock();
        if start_clock == TIME_MAX {
            self.sched_time
        } else {
            start_clock.saturating_add(self.sched_time)
        }
    }

    /// Queue ordering key: absolute arrival, then step, then id.
    pub(crate) fn sort_key(&self) -> (TimeNs, u64, u32) {
        (self.abs_sched_time(), self.step, self.id)
    }
}

struct StatusState {
    status: WlStatus,
    start_wall: TimeNs,
    notify_time: TimeNs,
}

#[derive(Default)]
struct StepEntry {
    count: u32,
    trace: Vec<Box<Request>>,
}

struct StepState {
    current: i64,
    last: i64,
    current_rq: u32,
    ring: Vec<Option<StepEntry>>,
}

/// Chain edge held by the parent: completions spawn requests of `child`,
/// optionally gated by a probability draw.
pub(crate) struct ChainLink {
    pub(crate) child: Arc<Workload>,
    pub(crate) probability: f64,
    pub(crate) gen: Option<Box<dyn crate::randgen::RandomGen>>,
}

/// A configured workload instance.
pub struct Workload {
    name: String,
    wltype: Arc<WorkloadType>,

    /// Max acceptable start lateness; `TIME_MAX` means unlimited.
    deadline: TimeNs,

    /// Name of the owning threadpool; `None` for chained workloads.
    tp_name: Option<String>,

    notifier: NotifierHandle,
    notify_interval: TimeNs,

    status: Mutex<StatusState>,
    history: AtomicU32,

    /// Mirror of the step state's current step for lock-free reads.
    cur_step: AtomicI64,

    /// Monotonic clock value of "workload time zero"; `TIME_MAX` until the
    /// first step is dispatched.
    start_clock: AtomicI64,

    steps: Mutex<StepState>,
    sched: Mutex<Box<dyn RequestScheduler>>,
    pgen: Mutex<PgenSet>,

    /// Workload-level parameters, fixed after configuration.
    wl_params: Vec<(String, ParamValue)>,

    chain: Mutex<Option<ChainLink>>,
    cfg_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Workload {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        wltype: Arc<WorkloadType>,
        deadline: TimeNs,
        tp_name: Option<String>,
        sched: Box<dyn RequestScheduler>,
        pgen: PgenSet,
        wl_params: Vec<(String, ParamValue)>,
        notifier: NotifierHandle,
        notify_interval: TimeNs,
    ) -> Arc<Workload> {
        Arc::new(Workload {
            name,
            wltype,
            deadline,
            tp_name,
            notifier,
            notify_interval,
            status: Mutex::new(StatusState {
                status: WlStatus::New,
                start_wall: TIME_MAX,
                notify_time: 0,
            }),
            history: AtomicU32::new(WlStatus::New.bit()),
            cur_step: AtomicI64::new(-1),
            start_clock: AtomicI64::new(TIME_MAX),
            steps: Mutex::new(StepState {
                current: -1,
                last: -1,
                current_rq: 0,
                ring: (0..WL_STEP_QUEUE_SIZE).map(|_| None).collect(),
            }),
            sched: Mutex::new(sched),
            pgen: Mutex::new(pgen),
            wl_params,
            chain: Mutex::new(None),
            cfg_thread: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wltype(&self) -> &Arc<WorkloadType> {
        &self.wltype
    }

    pub(crate) fn tp_name(&self) -> Option<&str> {
        self.tp_name.as_deref()
    }

    pub fn deadline(&self) -> TimeNs {
        self.deadline
    }

    /// Workload-level parameter value.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.wl_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn status(&self) -> WlStatus {
        self.status.lock().status
    }

    /// True if the workload has ever been in `status`.
    pub fn had_status(&self, status: WlStatus) -> bool {
        self.history.load(Ordering::Acquire) & status.bit() != 0
    }

    pub(crate) fn start_clock(&self) -> TimeNs {
        self.start_clock.load(Ordering::Acquire)
    }

    pub(crate) fn current_step(&self) -> i64 {
        self.cur_step.load(Ordering::Acquire)
    }

    fn latch(&self, state: &mut StatusState, status: WlStatus) {
        state.status = status;
        self.history.fetch_or(status.bit(), Ordering::AcqRel);
    }

    /// Record a status transition and push a notification. Intermediate
    /// configuration progress is rate limited; everything else always goes
    /// through.
    pub(crate) fn notify(&self, status: WlStatus, progress: i64, message: &str) {
        let now = time::now_wall();
        let mut progress = progress;
        {
            let mut s = self.status.lock();
            if status == WlStatus::Configuring
                && progress > 2
                && progress < 98
                && now - s.notify_time < self.notify_interval
            {
                return;
            }
            s.notify_time = now;
            match status {
                WlStatus::Configuring => progress = progress.clamp(0, 100),
                WlStatus::CfgFail => progress = -1,
                WlStatus::Configured => progress = 100,
                WlStatus::Running
                | WlStatus::Finished
                | WlStatus::Stopped
                | WlStatus::Destroyed => progress = self.cur_step.load(Ordering::Acquire),
                _ => {}
            }
            self.latch(&mut s, status);
        }

        if status == WlStatus::CfgFail {
            warn!(workload = %self.name, %status, message, "workload status");
        } else {
            info!(workload = %self.name, %status, progress, "workload status");
        }

        self.notifier
            .status(&self.name, status, progress, message);
    }

    /// Run the module's `config` callback on a dedicated thread so a slow
    /// or blocking module cannot stall the engine. `on_configured` runs
    /// after a successful callback (the engine attaches the workload to
    /// its threadpool there).
    pub(crate) fn spawn_configure(
        this: &Arc<Workload>,
        on_configured: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        let wl = Arc::clone(this);
        let spawned = thread::Builder::new()
            .name(format!("wl-cfg-{}", this.name))
            .spawn(move || {
                wl.notify(WlStatus::Configuring, 0, "");
                match wl.wltype.module.config(&wl) {
                    Ok(()) => match on_configured() {
                        Ok(()) => wl.notify(WlStatus::Configured, 100, ""),
                        Err(err) => wl.notify(WlStatus::CfgFail, -1, &err.to_string()),
                    },
                    Err(err) => {
                        warn!(workload = %wl.name, error = %err, "module config failed");
                        wl.notify(WlStatus::CfgFail, -1, &err.to_string());
                    }
                }
            });
        match spawned {
            Ok(handle) => *this.cfg_thread.lock() = Some(handle),
            Err(err) => {
                error!(workload = %this.name, error = %err, "failed to spawn config thread");
                this.notify(WlStatus::CfgFail, -1, "config thread did not start");
            }
        }
    }

    /// Arm the start trigger: the workload starts once the wall clock
    /// reaches `at_wall`.
    pub(crate) fn start(&self, at_wall: TimeNs) -> Result<()> {
        let mut s = self.status.lock();
        if s.status != WlStatus::Configured {
            return Err(Error::invalid_state(
                self.name.clone(),
                format!("cannot start workload in state '{}'", s.status),
            ));
        }
        s.start_wall = at_wall;
        Ok(())
    }

    /// Check (and perform) the `CONFIGURED -> STARTED` transition.
    pub(crate) fn is_started(&self, now_wall: TimeNs) -> bool {
        if self.had_status(WlStatus::Started) {
            return true;
        }
        let mut s = self.status.lock();
        if s.status == WlStatus::Configured && now_wall >= s.start_wall {
            info!(workload = %self.name, "starting workload");
            self.latch(&mut s, WlStatus::Started);
            return true;
        }
        false
    }

    /// Queue the demand of one step. Steps must arrive in sequence and the
    /// ring keeps one slot free for the in-flight step.
    pub fn provide_step(
        &self,
        step_id: u64,
        count: u32,
        trace: Vec<Box<Request>>,
    ) -> Result<()> {
        let mut st = self.steps.lock();

        if st.last - st.current + 1 == WL_STEP_QUEUE_SIZE as i64 {
            return Err(Error::StepQueueFull(self.name.clone()));
        }
        if step_id as i64 != st.last + 1 {
            return Err(Error::StepInvalid {
                name: self.name.clone(),
                step_id,
                expected: (st.last + 1) as u64,
            });
        }

        st.last = step_id as i64;
        let count = if trace.is_empty() {
            count
        } else {
            trace.len() as u32
        };
        let slot = (step_id as usize) & WL_STEP_QUEUE_MASK;
        st.ring[slot] = Some(StepEntry { count, trace });
        Ok(())
    }

    /// Number of steps queued ahead of the current one.
    pub fn outstanding_steps(&self) -> usize {
        let st = self.steps.lock();
        (st.last - st.current).max(0) as usize
    }

    fn set_start_clock(&self, clock: TimeNs) {
        if self
            .start_clock
            .compare_exchange(TIME_MAX, clock, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(link) = self.chain.lock().as_ref() {
                link.child.inherit_start_clock(clock);
            }
        }
    }

    /// Chained workloads run on the parent's clock so parent-relative end
    /// times are directly usable as child arrival times.
    pub(crate) fn inherit_start_clock(&self, clock: TimeNs) {
        if self
            .start_clock
            .compare_exchange(TIME_MAX, clock, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut s = self.status.lock();
            self.latch(&mut s, WlStatus::Started);
            drop(s);
            if let Some(link) = self.chain.lock().as_ref() {
                link.child.inherit_start_clock(clock);
            }
        }
    }

    /// Consume the next step and build its request batch.
    ///
    /// `dispatch_clock` is the monotonic time at which the batch will be
    /// handed to workers; the first call stamps it as the workload's time
    /// zero. Returns `None` once the queue is drained, after transitioning
    /// to `FINISHED`.
    pub(crate) fn advance_step(
        this: &Arc<Workload>,
        quantum: TimeNs,
        dispatch_clock: TimeNs,
    ) -> Option<Vec<Box<Request>>> {
        if !this.had_status(WlStatus::Running) {
            this.set_start_clock(dispatch_clock);
            this.notify(WlStatus::Running, 0, "");
        }

        let mut st = this.steps.lock();
        st.current += 1;
        st.current_rq = 0;
        this.cur_step.store(st.current, Ordering::Release);

        if st.current > st.last {
            let step = st.current;
            drop(st);
            debug!(workload = %this.name, step, "no more steps on queue");
            this.notify(WlStatus::Finished, 0, "");
            return None;
        }

        let step_id = st.current as u64;
        let slot = (st.current as usize) & WL_STEP_QUEUE_MASK;
        let entry = st.ring[slot].take().unwrap_or_default();

        if !entry.trace.is_empty() {
            let mut rqs = entry.trace;
            for rq in rqs.iter_mut() {
                rq.step = step_id;
            }
            debug!(workload = %this.name, step = step_id, count = rqs.len(), "trace step");
            return Some(rqs);
        }

        let plan = this.sched.lock().step(step_id, entry.count, quantum);
        let mut rqs = Vec::with_capacity(plan.len());
        for arrival in plan {
            match Workload::create_request(this, &mut st, arrival) {
                Ok(rq) => rqs.push(rq),
                Err(err) => {
                    error!(workload = %this.name, error = %err, "request creation failed");
                    drop(st);
                    this.notify(WlStatus::CfgFail, -1, &err.to_string());
                    return Some(rqs);
                }
            }
        }
        debug!(workload = %this.name, step = step_id, count = rqs.len(), "step advanced");
        Some(rqs)
    }

    fn create_request(
        this: &Arc<Workload>,
        st: &mut StepState,
        arrival: Arrival,
    ) -> Result<Box<Request>> {
        let id = st.current_rq;
        st.current_rq += 1;

        let params = this.pgen.lock().generate(&this.wltype.params)?;
        let mut rq = Box::new(Request {
            id,
            step: st.current as u64,
            user_id: arrival.user_id,
            worker_id: -1,
            chain_request: -1,
            sched_time: arrival.sched_time,
            start_time: 0,
            end_time: 0,
            queue_len: -1,
            flags: 0,
            params,
            workload: Arc::clone(this),
            chain_next: None,
        });
        rq.chain_next = this.maybe_chain(&rq)?;
        Ok(rq)
    }

    fn maybe_chain(&self, parent: &Request) -> Result<Option<Box<Request>>> {
        let mut guard = self.chain.lock();
        let Some(link) = guard.as_mut() else {
            return Ok(None);
        };
        let spawn = match link.gen.as_mut() {
            Some(gen) => gen.generate_double() < link.probability,
            None => true,
        };
        if !spawn {
            return Ok(None);
        }
        let child_wl = Arc::clone(&link.child);
        drop(guard);
        Ok(Some(child_wl.create_chained(parent)?))
    }

    /// Synthesise a chained request inheriting the parent's identity. Its
    /// arrival time is assigned when the parent completes.
    pub(crate) fn create_chained(self: Arc<Self>, parent: &Request) -> Result<Box<Request>> {
        let params = self.pgen.lock().generate(&self.wltype.params)?;
        let mut rq = Box::new(Request {
            id: parent.id,
            step: parent.step,
            user_id: parent.user_id,
            worker_id: -1,
            chain_request: parent.id as i32,
            sched_time: 0,
            start_time: 0,
            end_time: 0,
            queue_len: -1,
            flags: 0,
            params,
            workload: Arc::clone(&self),
            chain_next: None,
        });
        rq.chain_next = self.maybe_chain(&rq)?;
        Ok(rq)
    }

    /// Build an externally timed (trace replay) request.
    pub(crate) fn build_trace_request(
        this: &Arc<Workload>,
        spec: &TraceRequestSpec,
    ) -> Result<Box<Request>> {
        let mut params = Vec::new();
        for descr in this.wltype.request_params() {
            let value = spec
                .params
                .get(&descr.name)
                .cloned()
                .or_else(|| descr.default.clone())
                .ok_or_else(|| {
                    Error::invalid_value(
                        format!("trace request param '{}'", descr.name),
                        "missing value",
                    )
                })?;
            descr.check(&value)?;
            params.push(value);
        }
        Ok(Box::new(Request {
            id: spec.id,
            step: 0,
            user_id: spec.user,
            worker_id: spec.thread,
            chain_request: -1,
            sched_time: spec.sched_time,
            start_time: 0,
            end_time: 0,
            queue_len: -1,
            flags: RQF_TRACE,
            params,
            workload: Arc::clone(this),
            chain_next: None,
        }))
    }

    /// Execute one request on the calling worker thread.
    ///
    /// Stamps start/end times, applies the deadline, invokes the module
    /// and hands back the chained child (scheduled at this request's end
    /// time) if one is due. A request past its deadline is not run: its
    /// `STARTED` flag stays clear and the chain stays attached so the
    /// reporter still sees every created request exactly once.
    pub(crate) fn run_request(&self, rq: &mut Request) -> Option<Box<Request>> {
        if self.had_status(WlStatus::Finished) {
            return None;
        }

        let start_clock = self.start_clock();
        rq.start_time = time::now_clock() - start_clock;

        if rq.start_time - rq.sched_time > self.deadline {
            debug!(
                workload = %self.name,
                request = rq.id,
                step = rq.step,
                lateness = rq.start_time - rq.sched_time,
                "deadline missed, request not run"
            );
            return None;
        }

        rq.flags |= RQF_STARTED;
        let outcome = self.wltype.module.run_request(rq);
        rq.end_time = time::now_clock() - start_clock;

        if rq.start_time <= rq.sched_time {
            rq.flags |= RQF_ONTIME;
        }
        match outcome {
            Ok(()) => rq.flags |= RQF_SUCCESS,
            Err(err) => {
                debug!(workload = %self.name, request = rq.id, error = %err, "request failed")
            }
        }
        rq.flags |= RQF_FINISHED;

        if !rq.has_flag(RQF_TRACE) {
            self.sched.lock().post_request(rq);
        }

        rq.chain_next.take().map(|mut child| {
            child.sched_time = rq.end_time;
            child
        })
    }

    /// Stop feeding steps: the workload drains what is queued and then
    /// finishes normally.
    pub(crate) fn stop(&self) {
        {
            let mut st = self.steps.lock();
            st.last = st.current;
        }
        self.notify(WlStatus::Stopped, 0, "");
    }

    pub(crate) fn unconfigure(&self) -> Result<()> {
        self.wltype.module.unconfig(self)
    }

    /// Wait for an in-flight module `config` callback to finish.
    pub(crate) fn join_config(&self) {
        if let Some(handle) = self.cfg_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Terminal teardown: joins the configuration thread if it is still
    /// running and records the transition.
    pub(crate) fn destroy(&self) {
        self.join_config();
        self.notify(WlStatus::Destroyed, 0, "");
    }

    /// Append `child` at the tail of this workload's chain.
    pub(crate) fn chain_back(
        this: &Arc<Workload>,
        child: Arc<Workload>,
        probability: f64,
        gen: Option<Box<dyn crate::randgen::RandomGen>>,
    ) {
        let mut tail = Arc::clone(this);
        loop {
            let next = tail.chain.lock().as_ref().map(|l| Arc::clone(&l.child));
            match next {
                Some(next) => tail = next,
                None => break,
            }
        }
        {
            let mut s = child.status.lock();
            child.latch(&mut s, WlStatus::Chained);
        }
        *tail.chain.lock() = Some(ChainLink {
            child,
            probability,
            gen,
        });
    }
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("name", &self.name)
            .field("type", &self.wltype.name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NotifierHandle;
    use crate::rqsched::SimpleScheduler;
    use crate::time::{T_MS, T_SEC};
    use crate::wlpgen::PgenSet;

    struct NullModule;

    impl WorkloadModule for NullModule {
        fn run_request(&self, _rq: &Request) -> Result<()> {
            Ok(())
        }
    }

    fn test_workload(deadline: TimeNs) -> Arc<Workload> {
        let wltype = Arc::new(WorkloadType {
            name: "null".into(),
            params: vec![],
            module: Box::new(NullModule),
        });
        let pgen = PgenSet::build(&wltype.params, |_| None).unwrap();
        Workload::new(
            "w_test".into(),
            wltype,
            deadline,
            Some("tp_test".into()),
            Box::new(SimpleScheduler),
            pgen,
            vec![],
            NotifierHandle::discarding(),
            T_SEC / 20,
        )
    }

    #[test]
    fn test_step_sequence_enforced() {
        let wl = test_workload(TIME_MAX);
        assert!(wl.provide_step(0, 1, vec![]).is_ok());
        assert!(wl.provide_step(1, 1, vec![]).is_ok());

        let err = wl.provide_step(5, 1, vec![]).unwrap_err();
        assert!(matches!(err, Error::StepInvalid { expected: 2, .. }));

        // Duplicate of an already queued step.
        let err = wl.provide_step(1, 1, vec![]).unwrap_err();
        assert!(matches!(err, Error::StepInvalid { .. }));
    }

    #[test]
    fn test_step_queue_capacity() {
        let wl = test_workload(TIME_MAX);
        // One slot stays reserved for the in-flight step.
        for step in 0..(WL_STEP_QUEUE_SIZE as u64 - 1) {
            assert!(wl.provide_step(step, 1, vec![]).is_ok(), "step {step}");
        }
        let err = wl
            .provide_step(WL_STEP_QUEUE_SIZE as u64 - 1, 1, vec![])
            .unwrap_err();
        assert!(matches!(err, Error::StepQueueFull(_)));
        assert!(wl.outstanding_steps() <= WL_STEP_QUEUE_SIZE - 1);
    }

    #[test]
    fn test_advance_consumes_and_frees_slots() {
        let wl = test_workload(TIME_MAX);
        for step in 0..(WL_STEP_QUEUE_SIZE as u64 - 1) {
            wl.provide_step(step, 2, vec![]).unwrap();
        }
        let rqs = Workload::advance_step(&wl, 100 * T_MS, time::now_clock()).unwrap();
        assert_eq!(rqs.len(), 2);
        assert!(rqs.iter().all(|rq| rq.step == 0));

        // The consumed slot is free again.
        assert!(wl
            .provide_step(WL_STEP_QUEUE_SIZE as u64 - 1, 1, vec![])
            .is_ok());
    }

    #[test]
    fn test_advance_past_last_step_finishes() {
        let wl = test_workload(TIME_MAX);
        wl.provide_step(0, 1, vec![]).unwrap();
        assert!(Workload::advance_step(&wl, 100 * T_MS, time::now_clock()).is_some());
        assert!(Workload::advance_step(&wl, 100 * T_MS, time::now_clock()).is_none());
        assert!(wl.had_status(WlStatus::Finished));
    }

    #[test]
    fn test_stop_clamps_queue_and_drains() {
        let wl = test_workload(TIME_MAX);
        for step in 0..5 {
            wl.provide_step(step, 1, vec![]).unwrap();
        }
        Workload::advance_step(&wl, 100 * T_MS, time::now_clock()).unwrap();
        wl.stop();
        assert!(wl.had_status(WlStatus::Stopped));
        // Steps 1..4 were dropped by the clamp.
        assert!(Workload::advance_step(&wl, 100 * T_MS, time::now_clock()).is_none());
        assert!(wl.had_status(WlStatus::Finished));
    }

    #[test]
    fn test_request_ids_reset_per_step() {
        let wl = test_workload(TIME_MAX);
        wl.provide_step(0, 3, vec![]).unwrap();
        wl.provide_step(1, 2, vec![]).unwrap();

        let rqs = Workload::advance_step(&wl, 100 * T_MS, time::now_clock()).unwrap();
        assert_eq!(rqs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        let rqs = Workload::advance_step(&wl, 100 * T_MS, time::now_clock()).unwrap();
        assert_eq!(rqs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_run_request_ontime_flags() {
        let wl = test_workload(TIME_MAX);
        wl.provide_step(0, 1, vec![]).unwrap();
        // Start clock now; arrival 50ms in the future, so the request is early.
        let mut rqs = Workload::advance_step(&wl, 100 * T_MS, time::now_clock()).unwrap();
        let rq = &mut rqs[0];
        rq.sched_time = 50 * T_MS;
        assert!(wl.run_request(rq).is_none());
        assert!(rq.has_flag(RQF_STARTED));
        assert!(rq.has_flag(RQF_FINISHED));
        assert!(rq.has_flag(RQF_SUCCESS));
        assert!(rq.has_flag(RQF_ONTIME));
    }

    #[test]
    fn test_run_request_late_clears_ontime() {
        let wl = test_workload(TIME_MAX);
        wl.provide_step(0, 1, vec![]).unwrap();
        let dispatch_clock = time::now_clock() - 200 * T_MS;
        let mut rqs = Workload::advance_step(&wl, 100 * T_MS, dispatch_clock).unwrap();
        let rq = &mut rqs[0];
        // Arrival was 200ms ago; no deadline so it still runs.
        wl.run_request(rq);
        assert!(rq.has_flag(RQF_STARTED));
        assert!(rq.has_flag(RQF_FINISHED));
        assert!(!rq.has_flag(RQF_ONTIME));
    }

    #[test]
    fn test_run_request_deadline_miss_not_started() {
        let wl = test_workload(10 * T_MS);
        wl.provide_step(0, 1, vec![]).unwrap();
        // Start clock far in the past makes the request hopelessly late.
        let dispatch_clock = time::now_clock() - T_SEC;
        let mut rqs = Workload::advance_step(&wl, 100 * T_MS, dispatch_clock).unwrap();
        let rq = &mut rqs[0];
        assert!(wl.run_request(rq).is_none());
        assert_eq!(rq.flags, 0);
    }

    #[test]
    fn test_chained_request_inherits_identity() {
        let parent = test_workload(TIME_MAX);
        let child = test_workload(TIME_MAX);
        Workload::chain_back(&parent, Arc::clone(&child), 1.0, None);
        assert!(child.had_status(WlStatus::Chained));

        parent.provide_step(0, 2, vec![]).unwrap();
        let mut rqs = Workload::advance_step(&parent, 100 * T_MS, time::now_clock()).unwrap();
        for rq in rqs.iter() {
            let chained = rq.chain_next.as_ref().expect("chain child");
            assert_eq!(chained.id, rq.id);
            assert_eq!(chained.step, rq.step);
            assert_eq!(chained.chain_request, rq.id as i32);
            assert!(Arc::ptr_eq(&chained.workload, &child));
        }

        // Completion schedules the child at the parent's end time.
        let rq = &mut rqs[0];
        let spawned = parent.run_request(rq).expect("child released");
        assert_eq!(spawned.sched_time, rq.end_time);
        assert!(rq.chain_next.is_none());
    }

    #[test]
    fn test_chain_probability_zero_never_spawns() {
        let parent = test_workload(TIME_MAX);
        let child = test_workload(TIME_MAX);
        Workload::chain_back(&parent, 
            child,
            0.0,
            Some(Box::new(crate::randgen::LcgGen::new(42))),
        );
        parent.provide_step(0, 10, vec![]).unwrap();
        let rqs = Workload::advance_step(&parent, 100 * T_MS, time::now_clock()).unwrap();
        assert!(rqs.iter().all(|rq| rq.chain_next.is_none()));
    }

    #[test]
    fn test_start_requires_configured() {
        let wl = test_workload(TIME_MAX);
        let err = wl.start(time::now_wall()).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }
}
