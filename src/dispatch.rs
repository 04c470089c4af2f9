//! Threadpool dispatchers: policies mapping requests onto worker queues.
//!
//! Queue-based dispatchers pre-assign each quantum's arrivals to worker
//! queues and sleep out the quantum; the policy only decides the target
//! worker. The first-free dispatcher pre-assigns nothing: the controller
//! walks arrivals in time order and hands each to an idle worker, parking
//! on a condvar when all of them are busy. Either way, finished requests
//! land on the pool's done list and `control_report` drains it.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::config::DispatcherSpec;
use crate::errors::{Error, Result};
use crate::randgen::{LcgGen, RandomGen};
use crate::threadpool::{insert_request_sorted, ThreadPoolShared, WorkerQueue};
use crate::time::{self, TimeNs, TIME_MAX};
use crate::workload::Request;

/// Dispatcher hook set. One instance per threadpool.
pub(crate) trait Dispatcher: Send + Sync {
    /// Validate policy parameters against the now-known pool geometry.
    fn init(&self, _tp: &ThreadPoolShared) -> Result<()> {
        Ok(())
    }

    /// Distribute the quantum's arrivals, then sleep until the quantum
    /// elapses.
    fn control_sleep(&self, tp: &ThreadPoolShared);

    /// Collect the requests to report for the ending quantum.
    fn control_report(&self, tp: &ThreadPoolShared) -> Vec<Box<Request>>;

    /// Block until a request is available for `wid`, then return it.
    /// Returns `None` when the pool is dying.
    fn worker_pick(&self, tp: &ThreadPoolShared, wid: usize) -> Option<Box<Request>>;

    /// Hand a finished request over for reporting.
    fn worker_done(&self, tp: &ThreadPoolShared, wid: usize, rq: Box<Request>);

    /// Wake a (possibly sleeping) worker so it can observe pool death.
    fn worker_signal(&self, tp: &ThreadPoolShared, wid: usize);

    /// Enqueue a request whose arrival time was just assigned (chain
    /// child released by the worker `wid`).
    fn relink_request(&self, tp: &ThreadPoolShared, wid: usize, rq: Box<Request>);

    fn name(&self) -> &'static str;
}

/// Sleep until `rq`'s arrival, shaving off the estimated dispatch
/// overhead. Returns false when the arrival lies more than `max_sleep`
/// ahead (the caller's quantum would end first).
pub(crate) fn wait_for_arrival(tp: &ThreadPoolShared, rq: &Request, max_sleep: TimeNs) -> bool {
    let cur = time::now_clock();
    let next = rq.abs_sched_time();
    let sleep_time = next.saturating_sub(cur).saturating_sub(tp.worker_overhead);

    if sleep_time > max_sleep {
        return false;
    }
    if cur < next && sleep_time > tp.min_sleep {
        time::sleep_nanos(sleep_time, tp.min_sleep);
    }
    true
}

/// Shared report logic: the done list, plus (when discarding) everything
/// still queued, after waiting out requests being executed right now.
fn drain_report(tp: &ThreadPoolShared) -> Vec<Box<Request>> {
    let discard = tp.discard || tp.is_draining();

    if discard {
        let mut leftovers = Vec::new();
        for worker in &tp.workers {
            // Empty the queue before waiting out the in-flight request;
            // in the other order the worker picks the next queued request
            // the moment it finishes.
            let mut q = worker.queue.lock();
            leftovers.extend(q.rqs.drain(..));
            q.cursor = 0;
            while q.busy {
                worker.cv.wait(&mut q);
            }
        }
        {
            let mut list = tp.rq_list.lock();
            leftovers.extend(list.rqs.drain(..));
            list.cursor = 0;
        }
        let mut batch = std::mem::take(&mut *tp.done.lock());
        batch.extend(leftovers);
        batch
    } else {
        std::mem::take(&mut *tp.done.lock())
    }
}

fn wqueue_put(tp: &ThreadPoolShared, wid: usize, mut rq: Box<Request>) {
    rq.worker_id = wid as i32;
    let worker = &tp.workers[wid];
    let mut q = worker.queue.lock();
    let WorkerQueue { rqs, cursor, .. } = &mut *q;
    insert_request_sorted(rqs, rq, cursor);
    worker.cv.notify_all();
}

fn wqueue_pick(tp: &ThreadPoolShared, wid: usize) -> Option<Box<Request>> {
    let worker = &tp.workers[wid];
    let mut q = worker.queue.lock();
    loop {
        if tp.is_dead() {
            return None;
        }
        if !q.rqs.is_empty() {
            break;
        }
        worker.cv.wait(&mut q);
    }
    let rq = q.rqs.pop_front();
    q.cursor = q.cursor.saturating_sub(1);
    q.busy = true;

    // Queue depth seen by this request: already-due requests behind it.
    let now = time::now_clock();
    let qlen = q
        .rqs
        .iter()
        .take_while(|r| r.abs_sched_time() <= now)
        .count();
    drop(q);

    rq.map(|mut rq| {
        rq.queue_len = qlen as i32;
        rq
    })
}

fn wqueue_done(tp: &ThreadPoolShared, wid: usize, rq: Box<Request>) {
    // The request must be on the done list before the busy flag clears:
    // a draining controller stops waiting the moment busy drops, and the
    // drain must see this request.
    tp.done.lock().push(rq);
    let worker = &tp.workers[wid];
    let mut q = worker.queue.lock();
    q.busy = false;
    worker.cv.notify_all();
}

fn wqueue_signal(tp: &ThreadPoolShared, wid: usize) {
    let worker = &tp.workers[wid];
    let _q = worker.queue.lock();
    worker.cv.notify_all();
}

enum QueuePolicy {
    RoundRobin,
    Random,
    FillUp { n: u32, first: usize },
    User,
    Trace,
}

struct QueueState {
    cursor: usize,
    fill_count: u32,
    rng: LcgGen,
}

/// Pre-assigning dispatcher family; the policy picks the worker.
pub(crate) struct QueueDispatcher {
    policy: QueuePolicy,
    state: Mutex<QueueState>,
}

impl QueueDispatcher {
    fn new(policy: QueuePolicy) -> QueueDispatcher {
        QueueDispatcher {
            policy,
            state: Mutex::new(QueueState {
                cursor: 0,
                fill_count: 0,
                rng: LcgGen::new(time::now_wall() as u64),
            }),
        }
    }

    fn reset_for_quantum(&self, num_workers: usize) {
        let mut state = self.state.lock();
        match self.policy {
            QueuePolicy::RoundRobin | QueuePolicy::Random => {
                state.cursor = (state.rng.generate() as usize) % num_workers;
            }
            QueuePolicy::FillUp { first, .. } => {
                state.cursor = first;
                state.fill_count = 0;
            }
            _ => {}
        }
    }

    fn next_wid(&self, num_workers: usize, rq: &Request) -> usize {
        let mut state = self.state.lock();
        match self.policy {
            QueuePolicy::RoundRobin => {
                let wid = state.cursor % num_workers;
                state.cursor = (wid + 1) % num_workers;
                wid
            }
            QueuePolicy::Random => (state.rng.generate() as usize) % num_workers,
            QueuePolicy::FillUp { n, .. } => {
                let wid = state.cursor % num_workers;
                state.fill_count += 1;
                if state.fill_count >= n {
                    state.fill_count = 0;
                    state.cursor = (wid + 1) % num_workers;
                }
                wid
            }
            QueuePolicy::User => rq.user_id as usize % num_workers,
            QueuePolicy::Trace => {
                if rq.worker_id >= 0 {
                    rq.worker_id as usize % num_workers
                } else {
                    // Reproducibility is lost for this request.
                    debug!(
                        request = rq.id,
                        step = rq.step,
                        "trace request without a worker id, falling back to random"
                    );
                    (state.rng.generate() as usize) % num_workers
                }
            }
        }
    }
}

impl Dispatcher for QueueDispatcher {
    fn init(&self, tp: &ThreadPoolShared) -> Result<()> {
        if let QueuePolicy::FillUp { n, first } = self.policy {
            if n == 0 {
                return Err(Error::invalid_value(
                    "disp.n",
                    "fill count must be at least 1",
                ));
            }
            if first >= tp.num_workers {
                return Err(Error::InvalidData {
                    what: "disp.wid".into(),
                    message: format!(
                        "worker id #{first} is too large for a pool of {}",
                        tp.num_workers
                    ),
                });
            }
        }
        Ok(())
    }

    fn control_sleep(&self, tp: &ThreadPoolShared) {
        self.reset_for_quantum(tp.num_workers);

        let mut guards: Vec<_> = tp.workers.iter().map(|w| w.queue.lock()).collect();
        {
            let mut list = tp.rq_list.lock();
            let mut rest = std::collections::VecDeque::new();
            while let Some(rq) = list.rqs.pop_front() {
                // Requests of future steps stay queued untouched.
                if rq.step as i64 != rq.workload.current_step() {
                    rest.push_back(rq);
                    continue;
                }
                let wid = self.next_wid(tp.num_workers, &rq);
                let mut rq = rq;
                rq.worker_id = wid as i32;
                let WorkerQueue { rqs, cursor, .. } = &mut *guards[wid];
                insert_request_sorted(rqs, rq, cursor);
            }
            list.rqs = rest;
            list.cursor = 0;
        }
        for (worker, guard) in tp.workers.iter().zip(guards) {
            worker.cv.notify_all();
            drop(guard);
        }

        let cur = time::now_clock();
        let deadline = tp.quantum_end();
        if cur < deadline {
            time::sleep_nanos(deadline - cur, tp.min_sleep);
        }
    }

    fn control_report(&self, tp: &ThreadPoolShared) -> Vec<Box<Request>> {
        drain_report(tp)
    }

    fn worker_pick(&self, tp: &ThreadPoolShared, wid: usize) -> Option<Box<Request>> {
        let rq = wqueue_pick(tp, wid)?;
        wait_for_arrival(tp, &rq, TIME_MAX);
        Some(rq)
    }

    fn worker_done(&self, tp: &ThreadPoolShared, wid: usize, rq: Box<Request>) {
        wqueue_done(tp, wid, rq);
    }

    fn worker_signal(&self, tp: &ThreadPoolShared, wid: usize) {
        wqueue_signal(tp, wid);
    }

    fn relink_request(&self, tp: &ThreadPoolShared, wid: usize, rq: Box<Request>) {
        wqueue_put(tp, wid, rq);
    }

    fn name(&self) -> &'static str {
        match self.policy {
            QueuePolicy::RoundRobin => "round-robin",
            QueuePolicy::Random => "random",
            QueuePolicy::FillUp { .. } => "fill-up",
            QueuePolicy::User => "user",
            QueuePolicy::Trace => "trace",
        }
    }
}

struct FfState {
    /// Per-worker busy markers; false means the worker is parked.
    working: Vec<bool>,
    /// Request offered to the next worker that frees up.
    handoff: Option<Box<Request>>,
    rng: LcgGen,
}

/// Dispatcher without pre-assignment: near-optimal throughput for
/// heterogeneous request costs, at the price of trace reproducibility.
pub(crate) struct FirstFreeDispatcher {
    state: Mutex<FfState>,
    control_cv: Condvar,
}

impl FirstFreeDispatcher {
    fn new() -> FirstFreeDispatcher {
        FirstFreeDispatcher {
            state: Mutex::new(FfState {
                working: Vec::new(),
                handoff: None,
                rng: LcgGen::new(time::now_wall() as u64),
            }),
            control_cv: Condvar::new(),
        }
    }
}

impl Dispatcher for FirstFreeDispatcher {
    fn init(&self, tp: &ThreadPoolShared) -> Result<()> {
        self.state.lock().working = vec![false; tp.num_workers];
        Ok(())
    }

    fn control_sleep(&self, tp: &ThreadPoolShared) {
        let deadline = tp.quantum_end();

        loop {
            let rq = {
                let mut list = tp.rq_list.lock();
                list.cursor = 0;
                list.rqs.pop_front()
            };
            let Some(rq) = rq else { break };

            let max_sleep = deadline - time::now_clock();
            if !wait_for_arrival(tp, &rq, max_sleep) {
                // The arrival belongs to a later quantum.
                {
                    let mut list = tp.rq_list.lock();
                    list.rqs.push_front(rq);
                }
                break;
            }

            let mut state = self.state.lock();
            let num_workers = tp.num_workers;
            let start = (state.rng.generate() as usize) % num_workers;
            let target = (0..num_workers)
                .map(|i| (start + i) % num_workers)
                .find(|wid| !state.working[*wid]);

            match target {
                Some(wid) => {
                    state.working[wid] = true;
                    drop(state);
                    wqueue_put(tp, wid, rq);
                }
                None => {
                    state.handoff = Some(rq);
                    let timeout = deadline - time::now_clock();
                    if timeout > 0 {
                        self.control_cv
                            .wait_for(&mut state, Duration::from_nanos(timeout as u64));
                    }
                    if let Some(rq) = state.handoff.take() {
                        // Nobody freed up in time; retry next round.
                        drop(state);
                        let mut list = tp.rq_list.lock();
                        list.rqs.push_front(rq);
                        if time::now_clock() >= deadline {
                            return;
                        }
                    }
                }
            }
        }

        let cur = time::now_clock();
        if cur < deadline {
            time::sleep_nanos(deadline - cur, tp.min_sleep);
        }
    }

    fn control_report(&self, tp: &ThreadPoolShared) -> Vec<Box<Request>> {
        drain_report(tp)
    }

    fn worker_pick(&self, tp: &ThreadPoolShared, wid: usize) -> Option<Box<Request>> {
        {
            let mut state = self.state.lock();
            if let Some(mut rq) = state.handoff.take() {
                state.working[wid] = true;
                self.control_cv.notify_all();
                drop(state);
                rq.worker_id = wid as i32;
                let mut q = tp.workers[wid].queue.lock();
                q.busy = true;
                drop(q);
                return Some(rq);
            }
            state.working[wid] = false;
            self.control_cv.notify_all();
        }
        // The controller already waited out the arrival time.
        wqueue_pick(tp, wid)
    }

    fn worker_done(&self, tp: &ThreadPoolShared, wid: usize, rq: Box<Request>) {
        wqueue_done(tp, wid, rq);
    }

    fn worker_signal(&self, tp: &ThreadPoolShared, wid: usize) {
        wqueue_signal(tp, wid);
        self.control_cv.notify_all();
    }

    fn relink_request(&self, tp: &ThreadPoolShared, wid: usize, rq: Box<Request>) {
        wqueue_put(tp, wid, rq);
    }

    fn name(&self) -> &'static str {
        "first-free"
    }
}

/// Build a dispatcher instance from its spec.
pub(crate) fn create_dispatcher(spec: &DispatcherSpec) -> Box<dyn Dispatcher> {
    match spec {
        DispatcherSpec::RoundRobin => Box::new(QueueDispatcher::new(QueuePolicy::RoundRobin)),
        DispatcherSpec::Random => Box::new(QueueDispatcher::new(QueuePolicy::Random)),
        DispatcherSpec::FillUp { n, wid } => Box::new(QueueDispatcher::new(QueuePolicy::FillUp {
            n: *n,
            first: *wid,
        })),
        DispatcherSpec::User => Box::new(QueueDispatcher::new(QueuePolicy::User)),
        DispatcherSpec::Trace => Box::new(QueueDispatcher::new(QueuePolicy::Trace)),
        DispatcherSpec::FirstFree => Box::new(FirstFreeDispatcher::new()),
    }
}
