//! Threadpools: N workers plus one controller driving a quantum loop.
//!
//! Per quantum the controller dispatches the pending arrivals through the
//! dispatcher, sleeps the quantum out, reports the finished batch, then
//! advances every attached workload by one step and merges the new
//! requests into the pending queue in arrival order. Workers block on
//! their queues, sleep until each request's arrival time and execute the
//! module callback.
//!
//! Destruction is collected: marking the pool dead wakes everything, and
//! a background collector joins the threads once they have wound down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::errors::{Error, Result};
use crate::reporter::ReporterHandle;
use crate::time::{self, TimeNs};
use crate::workload::{Request, Workload};

/// Insert `item` into a queue kept sorted by `key`, walking from the
/// position hinted by the previous insertion. Monotone inputs insert in
/// O(1) instead of O(n) per element.
pub(crate) fn insert_sorted_by_key<T, K: Ord, F: Fn(&T) -> K>(
    q: &mut VecDeque<T>,
    item: T,
    cursor: &mut usize,
    key: F,
) {
    let k = key(&item);
    let mut i = (*cursor).min(q.len());
    while i > 0 && key(&q[i - 1]) > k {
        i -= 1;
    }
    while i < q.len() && key(&q[i]) <= k {
        i += 1;
    }
    q.insert(i, item);
    *cursor = i + 1;
}

/// Request-queue insertion ordered by (absolute arrival, step, id).
pub(crate) fn insert_request_sorted(
    q: &mut VecDeque<Box<Request>>,
    rq: Box<Request>,
    cursor: &mut usize,
) {
    insert_sorted_by_key(q, rq, cursor, |rq| rq.sort_key());
}

/// One worker's queue: pending requests sorted by arrival, a busy marker
/// for the request currently being executed, and the insertion cursor.
pub(crate) struct WorkerQueue {
    pub(crate) rqs: VecDeque<Box<Request>>,
    pub(crate) busy: bool,
    pub(crate) cursor: usize,
}

pub(crate) struct WorkerSlot {
    pub(crate) queue: Mutex<WorkerQueue>,
    pub(crate) cv: Condvar,
}

/// The pool-wide pending queue, sorted by arrival.
pub(crate) struct RqList {
    pub(crate) rqs: VecDeque<Box<Request>>,
    pub(crate) cursor: usize,
}

/// State shared between the controller, the workers and the dispatcher.
pub(crate) struct ThreadPoolShared {
    pub(crate) name: String,
    pub(crate) num_workers: usize,
    pub(crate) quantum: TimeNs,
    pub(crate) discard: bool,
    pub(crate) min_sleep: TimeNs,
    pub(crate) worker_overhead: TimeNs,

    dead: AtomicBool,
    draining: AtomicBool,

    /// Start of the current quantum on the monotonic clock.
    time: AtomicI64,

    pub(crate) workers: Vec<WorkerSlot>,
    pub(crate) rq_list: Mutex<RqList>,
    pub(crate) done: Mutex<Vec<Box<Request>>>,
    pub(crate) wl_list: Mutex<Vec<Arc<Workload>>>,

    pub(crate) disp: Box<dyn Dispatcher>,
    pub(crate) reporter: ReporterHandle,
}

impl ThreadPoolShared {
    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn quantum_end(&self) -> TimeNs {
        self.time.load(Ordering::Acquire) + self.quantum
    }
}

fn control_loop(tp: Arc<ThreadPoolShared>) {
    debug!(pool = %tp.name, "controller started");

    loop {
        tp.time.store(time::now_clock(), Ordering::Release);
        tp.disp.control_sleep(&tp);

        let batch = tp.disp.control_report(&tp);
        tp.reporter.report(batch);

        let workloads: Vec<Arc<Workload>> = tp.wl_list.lock().clone();
        let now_wall = time::now_wall();
        // New arrivals are timed against the next quantum boundary, when
        // they will actually reach the workers.
        let dispatch_clock = tp.quantum_end();

        let mut finished = Vec::new();
        for wl in workloads {
            if !wl.is_started(now_wall) {
                continue;
            }
            match Workload::advance_step(&wl, tp.quantum, dispatch_clock) {
                Some(rqs) => {
                    let mut list = tp.rq_list.lock();
                    let RqList { rqs: pending, cursor } = &mut *list;
                    for rq in rqs {
                        insert_request_sorted(pending, rq, cursor);
                    }
                }
                None => finished.push(wl),
            }
        }

        if !finished.is_empty() {
            let mut wl_list = tp.wl_list.lock();
            wl_list.retain(|wl| !finished.iter().any(|f| Arc::ptr_eq(wl, f)));
        }

        if tp.is_dead() && tp.wl_list.lock().is_empty() {
            // Final drain: everything still queued is reported so no
            // request is ever created without being reported.
            tp.draining.store(true, Ordering::Release);
            let rest = tp.disp.control_report(&tp);
            tp.reporter.report(rest);
            break;
        }
    }

    debug!(pool = %tp.name, "controller exited");
}

fn worker_loop(tp: Arc<ThreadPoolShared>, wid: usize) {
    debug!(pool = %tp.name, worker = wid, "worker started");

    while let Some(mut rq) = tp.disp.worker_pick(&tp, wid) {
        let wl = Arc::clone(&rq.workload);
        let chain = wl.run_request(&mut rq);
        if let Some(child) = chain {
            tp.disp.relink_request(&tp, wid, child);
        }
        tp.disp.worker_done(&tp, wid, rq);
    }

    debug!(pool = %tp.name, worker = wid, "worker exited");
}

/// A running threadpool. The engine keeps it in its registry; the
/// collector owns the final join.
pub struct ThreadPool {
    shared: Arc<ThreadPoolShared>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        name: &str,
        num_workers: usize,
        quantum: TimeNs,
        discard: bool,
        disp: Box<dyn Dispatcher>,
        min_sleep: TimeNs,
        worker_overhead: TimeNs,
        reporter: ReporterHandle,
    ) -> Result<Arc<ThreadPool>> {
        let workers = (0..num_workers)
            .map(|_| WorkerSlot {
                queue: Mutex::new(WorkerQueue {
                    rqs: VecDeque::new(),
                    busy: false,
                    cursor: 0,
                }),
                cv: Condvar::new(),
            })
            .collect();

        let shared = Arc::new(ThreadPoolShared {
            name: name.to_string(),
            num_workers,
            quantum,
            discard,
            min_sleep,
            worker_overhead,
            dead: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            time: AtomicI64::new(0),
            workers,
            rq_list: Mutex::new(RqList {
                rqs: VecDeque::new(),
                cursor: 0,
            }),
            done: Mutex::new(Vec::new()),
            wl_list: Mutex::new(Vec::new()),
            disp,
            reporter,
        });

        shared.disp.init(&shared)?;

        let pool = ThreadPool {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(num_workers + 1)),
        };

        {
            let mut threads = pool.threads.lock();
            for wid in 0..num_workers {
                let tp = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("work-{name}-{wid}"))
                    .spawn(move || worker_loop(tp, wid));
                match spawned {
                    Ok(handle) => threads.push(handle),
                    Err(err) => {
                        Self::abort_spawn(&shared, &mut *threads);
                        return Err(Error::Internal(format!(
                            "cannot spawn worker #{wid} of pool '{name}': {err}"
                        )));
                    }
                }
            }

            let tp = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("tp-ctl-{name}"))
                .spawn(move || control_loop(tp));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    Self::abort_spawn(&shared, &mut *threads);
                    return Err(Error::Internal(format!(
                        "cannot spawn controller of pool '{name}': {err}"
                    )));
                }
            }
        }

        info!(
            pool = name,
            workers = num_workers,
            quantum,
            discard,
            disp = shared.disp.name(),
            "created threadpool"
        );
        Ok(Arc::new(pool))
    }

    fn abort_spawn(shared: &Arc<ThreadPoolShared>, threads: &mut Vec<thread::JoinHandle<()>>) {
        shared.dead.store(true, Ordering::Release);
        for wid in 0..shared.num_workers {
            shared.disp.worker_signal(shared, wid);
        }
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn quantum(&self) -> TimeNs {
        self.shared.quantum
    }

    pub fn worker_count(&self) -> usize {
        self.shared.num_workers
    }

    pub(crate) fn attach(&self, wl: Arc<Workload>) {
        debug!(pool = %self.shared.name, workload = wl.name(), "attaching workload");
        self.shared.wl_list.lock().push(wl);
    }

    pub(crate) fn detach(&self, wl: &Workload) {
        self.shared
            .wl_list
            .lock()
            .retain(|w| w.name() != wl.name());
    }

    pub(crate) fn workload_count(&self) -> usize {
        self.shared.wl_list.lock().len()
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.shared.is_dead()
    }

    /// Mark the pool dead and wake every worker. The threads wind down on
    /// their own; the collector joins them.
    pub(crate) fn destroy(&self) {
        self.shared.dead.store(true, Ordering::Release);
        for wid in 0..self.shared.num_workers {
            self.shared.disp.worker_signal(&self.shared, wid);
        }
    }

    /// Join all pool threads if they already exited; returns whether the
    /// pool is fully reaped.
    pub(crate) fn try_reap(&self) -> bool {
        let mut threads = self.threads.lock();
        if threads.iter().any(|handle| !handle.is_finished()) {
            return false;
        }
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        true
    }

    /// Blocking join of all pool threads.
    pub(crate) fn join_threads(&self) {
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Collector: reaps destroyed pools off the controller/worker threads'
/// own context (a thread must not join itself). Polls at the collector
/// interval and drains fully on channel close.
pub(crate) fn collector_loop(rx: Receiver<Arc<ThreadPool>>, interval: TimeNs) {
    let mut pending: Vec<Arc<ThreadPool>> = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_nanos(interval.max(1) as u64)) {
            Ok(pool) => pending.push(pool),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        pending.retain(|pool| {
            if pool.try_reap() {
                debug!(pool = %pool.name(), "threadpool reaped");
                false
            } else {
                true
            }
        });
    }
    for pool in pending {
        pool.join_threads();
        debug!(pool = %pool.name(), "threadpool reaped at shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sorted(q: &VecDeque<i64>) {
        for pair in q.iter().zip(q.iter().skip(1)) {
            assert!(pair.0 <= pair.1, "queue out of order: {q:?}");
        }
    }

    #[test]
    fn test_insert_sorted_monotone_input() {
        let mut q = VecDeque::new();
        let mut cursor = 0;
        for v in [10, 20, 30, 40, 50] {
            insert_sorted_by_key(&mut q, v, &mut cursor, |v| *v);
        }
        assert_eq!(q, VecDeque::from(vec![10, 20, 30, 40, 50]));
    }

    #[test]
    fn test_insert_sorted_backward_walk() {
        let mut q = VecDeque::new();
        let mut cursor = 0;
        for v in [10, 20, 30, 40, 50, 60] {
            insert_sorted_by_key(&mut q, v, &mut cursor, |v| *v);
        }
        // Cursor sits at the tail; a mid-range value walks backward.
        insert_sorted_by_key(&mut q, 45, &mut cursor, |v| *v);
        assert_eq!(q, VecDeque::from(vec![10, 20, 30, 40, 45, 50, 60]));
        // And a follow-up near the new cursor inserts forward.
        insert_sorted_by_key(&mut q, 47, &mut cursor, |v| *v);
        assert_eq!(q, VecDeque::from(vec![10, 20, 30, 40, 45, 47, 50, 60]));
    }

    #[test]
    fn test_insert_sorted_random_permutations() {
        use crate::randgen::{LcgGen, RandomGen};
        let mut rng = LcgGen::new(7);
        for _ in 0..50 {
            let mut q = VecDeque::new();
            let mut cursor = 0;
            let n = 1 + (rng.generate() % 64) as usize;
            for _ in 0..n {
                let v = (rng.generate() % 1000) as i64;
                insert_sorted_by_key(&mut q, v, &mut cursor, |v| *v);
                assert_sorted(&q);
            }
            assert_eq!(q.len(), n);
        }
    }

    #[test]
    fn test_insert_sorted_equal_keys_fifo() {
        // Equal keys insert after the existing run, preserving id order
        // for requests created in sequence.
        let mut q = VecDeque::new();
        let mut cursor = 0;
        insert_sorted_by_key(&mut q, (5, 'a'), &mut cursor, |v| v.0);
        insert_sorted_by_key(&mut q, (5, 'b'), &mut cursor, |v| v.0);
        insert_sorted_by_key(&mut q, (5, 'c'), &mut cursor, |v| v.0);
        assert_eq!(q, VecDeque::from(vec![(5, 'a'), (5, 'b'), (5, 'c')]));
    }
}
