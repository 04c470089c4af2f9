//! Engine façade: registries, public operations and lifecycle.
//!
//! The engine object owns everything: the workload-type, workload and
//! threadpool registries, the reporter and notifier threads and the pool
//! collector. There are no globals; two engines in one process do not
//! interfere. Every user-visible failure is forwarded to the registered
//! event handler with its stable code before being returned.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{
    ThreadPoolConfig, TraceRequestSpec, WlParamSpec, WorkerSchedSpec, WorkloadConfig,
};
use crate::dispatch;
use crate::errors::{Error, Result};
use crate::randgen;
use crate::reporter::{EventHandler, Notifier, NotifierHandle, Reporter, ReporterHandle};
use crate::rqsched;
use crate::threadpool::{collector_loop, ThreadPool};
use crate::time::{TimeNs, T_MS, T_SEC, T_US, TIME_MAX};
use crate::wlpgen::PgenSet;
use crate::workload::{WlStatus, Workload, WorkloadType};

/// Runtime knobs, all defaulted in code.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Smallest accepted threadpool quantum.
    pub min_quantum: TimeNs,
    /// Largest reasonable quantum.
    pub max_quantum: TimeNs,
    /// Upper bound on workers per pool.
    pub max_threads: usize,
    /// Poll period of the threadpool collector.
    pub collector_interval: TimeNs,
    /// Sleep requests below this floor return immediately.
    pub min_sleep: TimeNs,
    /// Estimated dispatch-to-run latency shaved off arrival sleeps.
    pub worker_overhead: TimeNs,
    /// Rate cap for intermediate configuration progress notifications.
    pub notifications_per_sec: u32,
    /// Flush the time-series file on every append.
    pub tsfile_sync: bool,
}

impl Default for Tunables {
    fn default() -> Tunables {
        Tunables {
            min_quantum: T_MS,
            max_quantum: 600 * T_SEC,
            max_threads: 64,
            collector_interval: T_SEC / 2,
            min_sleep: 50 * T_US,
            worker_overhead: 20 * T_US,
            notifications_per_sec: 20,
            tsfile_sync: false,
        }
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Where per-workload `.tsf` files and schema JSONs go. `None`
    /// disables persistence; reports still reach the event handler.
    pub output_dir: Option<PathBuf>,
    pub tunables: Tunables,
}

/// The load-generation engine.
pub struct Engine {
    tunables: Tunables,
    handler: Arc<dyn EventHandler>,

    wltypes: Mutex<HashMap<String, Arc<WorkloadType>>>,
    workloads: Mutex<HashMap<String, Arc<Workload>>>,
    pools: Mutex<HashMap<String, Arc<ThreadPool>>>,

    reporter: Option<Reporter>,
    reporter_handle: ReporterHandle,
    notifier: Option<Notifier>,
    notifier_handle: NotifierHandle,

    collector_tx: Option<Sender<Arc<ThreadPool>>>,
    collector: Option<thread::JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: EngineConfig, handler: Arc<dyn EventHandler>) -> Result<Engine> {
        let reporter = Reporter::start(
            config.output_dir.clone(),
            config.tunables.tsfile_sync,
            Arc::clone(&handler),
        );
        let reporter_handle = reporter.handle();
        let notifier = Notifier::start(Arc::clone(&handler));
        let notifier_handle = notifier.handle();

        let (collector_tx, collector_rx) = unbounded();
        let interval = config.tunables.collector_interval;
        let collector = thread::Builder::new()
            .name("tp-collector".into())
            .spawn(move || collector_loop(collector_rx, interval))
            .map_err(|err| Error::Internal(format!("cannot spawn collector: {err}")))?;

        info!(output = ?config.output_dir, "engine initialised");
        Ok(Engine {
            tunables: config.tunables,
            handler,
            wltypes: Mutex::new(HashMap::new()),
            workloads: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            reporter: Some(reporter),
            reporter_handle,
            notifier: Some(notifier),
            notifier_handle,
            collector_tx: Some(collector_tx),
            collector: Some(collector),
        })
    }

    /// Forward a failure to the error hook and hand it back.
    fn fail(&self, err: Error) -> Error {
        self.handler.error(err.code(), &err.to_string());
        err
    }

    /// Register a workload type under its name.
    pub fn register_workload_type(&self, wltype: Arc<WorkloadType>) -> Result<()> {
        let mut types = self.wltypes.lock();
        if types.contains_key(&wltype.name) {
            return Err(self.fail(Error::AlreadyExists {
                kind: "workload type",
                name: wltype.name.clone(),
            }));
        }
        types.insert(wltype.name.clone(), wltype);
        Ok(())
    }

    fn find_workload(&self, name: &str) -> Result<Arc<Workload>> {
        self.workloads.lock().get(name).cloned().ok_or_else(|| {
            Error::NotFound {
                kind: "workload",
                name: name.to_string(),
            }
        })
    }

    fn find_pool(&self, name: &str) -> Result<Arc<ThreadPool>> {
        self.pools.lock().get(name).cloned().ok_or_else(|| {
            Error::NotFound {
                kind: "threadpool",
                name: name.to_string(),
            }
        })
    }

    /// Create a threadpool and start its threads.
    pub fn create_threadpool(&self, config: &ThreadPoolConfig) -> Result<()> {
        self.create_threadpool_inner(config).map_err(|e| self.fail(e))
    }

    fn create_threadpool_inner(&self, config: &ThreadPoolConfig) -> Result<()> {
        if config.num_threads == 0 || config.num_threads > self.tunables.max_threads {
            return Err(Error::invalid_value(
                "num_threads",
                format!(
                    "{} outside 1..={}",
                    config.num_threads, self.tunables.max_threads
                ),
            ));
        }
        if config.quantum < self.tunables.min_quantum || config.quantum > self.tunables.max_quantum
        {
            return Err(Error::invalid_value(
                "quantum",
                format!(
                    "{}ns outside [{}, {}]",
                    config.quantum, self.tunables.min_quantum, self.tunables.max_quantum
                ),
            ));
        }
        if self.pools.lock().contains_key(&config.name) {
            return Err(Error::AlreadyExists {
                kind: "threadpool",
                name: config.name.clone(),
            });
        }

        let disp = dispatch::create_dispatcher(&config.disp);
        let pool = ThreadPool::create(
            &config.name,
            config.num_threads,
            config.quantum,
            config.discard,
            disp,
            self.tunables.min_sleep,
            self.tunables.worker_overhead,
            self.reporter_handle.clone(),
        )?;

        if let Some(sched) = &config.sched {
            // Worker scheduling is advisory: report problems, keep going.
            if let Err(err) = self.apply_worker_sched(&pool, sched) {
                warn!(pool = %config.name, error = %err, "worker scheduling not applied");
                self.handler.error(err.code(), &err.to_string());
            }
        }

        let mut pools = self.pools.lock();
        if pools.contains_key(&config.name) {
            drop(pools);
            pool.destroy();
            self.reap(Arc::clone(&pool));
            return Err(Error::AlreadyExists {
                kind: "threadpool",
                name: config.name.clone(),
            });
        }
        pools.insert(config.name.clone(), pool);
        Ok(())
    }

    fn apply_worker_sched(&self, pool: &ThreadPool, specs: &[WorkerSchedSpec]) -> Result<()> {
        for spec in specs {
            if spec.wid >= pool.worker_count() {
                return Err(Error::invalid_value(
                    "sched.wid",
                    format!("worker id #{} does not exist in '{}'", spec.wid, pool.name()),
                ));
            }
            // Host topology is discovered outside the engine; the binding
            // itself is advisory and recorded for the operator.
            info!(
                pool = pool.name(),
                worker = spec.wid,
                policy = spec.policy.as_deref().unwrap_or("-"),
                objects = ?spec.objects,
                "worker scheduling requested"
            );
        }
        Ok(())
    }

    /// Re-apply advisory worker scheduling on a live pool.
    pub fn schedule_threadpool(&self, name: &str, specs: &[WorkerSchedSpec]) -> Result<()> {
        let pool = self.find_pool(name).map_err(|e| self.fail(e))?;
        self.apply_worker_sched(&pool, specs).map_err(|e| self.fail(e))
    }

    /// Mark a threadpool dead and hand it to the collector. Fails while
    /// workloads are still attached.
    pub fn destroy_threadpool(&self, name: &str) -> Result<()> {
        self.destroy_threadpool_inner(name).map_err(|e| self.fail(e))
    }

    fn destroy_threadpool_inner(&self, name: &str) -> Result<()> {
        let mut pools = self.pools.lock();
        let pool = pools.get(name).cloned().ok_or_else(|| Error::NotFound {
            kind: "threadpool",
            name: name.to_string(),
        })?;
        if pool.workload_count() > 0 {
            return Err(Error::invalid_state(
                name,
                "threadpool has workloads attached",
            ));
        }
        pools.remove(name);
        drop(pools);

        pool.destroy();
        self.reap(pool);
        Ok(())
    }

    fn reap(&self, pool: Arc<ThreadPool>) {
        if let Some(tx) = &self.collector_tx {
            let _ = tx.send(pool);
        }
    }

    /// Create a workload and configure it asynchronously. The module's
    /// `config` callback runs on its own thread; completion (or failure)
    /// arrives as a status notification.
    pub fn configure_workload(&self, config: &WorkloadConfig) -> Result<()> {
        self.configure_workload_inner(config).map_err(|e| self.fail(e))
    }

    fn configure_workload_inner(&self, config: &WorkloadConfig) -> Result<()> {
        if self.workloads.lock().contains_key(&config.name) {
            return Err(Error::AlreadyExists {
                kind: "workload",
                name: config.name.clone(),
            });
        }

        let wltype = self
            .wltypes
            .lock()
            .get(&config.wltype)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "workload type",
                name: config.wltype.clone(),
            })?;

        let (pool, chain) = match (&config.threadpool, &config.chain) {
            (Some(tp_name), None) => (Some(self.find_pool(tp_name)?), None),
            (None, Some(chain)) => (None, Some(chain)),
            (Some(_), Some(_)) => {
                return Err(Error::invalid_value(
                    "workload",
                    "'threadpool' and 'chain' are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(Error::invalid_value(
                    "workload",
                    "neither 'chain' nor 'threadpool' was defined",
                ))
            }
        };

        // Chained workloads inherit arrivals from the parent; a scheduler
        // of their own would be dead weight.
        let sched: Box<dyn rqsched::RequestScheduler> = match (&config.rqsched, &chain) {
            (Some(spec), None) => rqsched::create_scheduler(spec)?,
            (None, Some(_)) => Box::new(rqsched::SimpleScheduler),
            (Some(_), Some(_)) => {
                return Err(Error::invalid_value(
                    "rqsched",
                    "chained workloads cannot have a request scheduler",
                ))
            }
            (None, None) => {
                return Err(Error::invalid_value("rqsched", "missing request scheduler"))
            }
        };

        let deadline = match config.deadline {
            Some(value) if value < 0 => {
                return Err(Error::invalid_value(
                    "deadline",
                    format!("{value}ns is negative"),
                ))
            }
            Some(value) => value,
            None => TIME_MAX,
        };

        // Reject parameters the type does not declare.
        for name in config.params.keys() {
            if !wltype.params.iter().any(|d| &d.name == name) {
                return Err(Error::invalid_value(
                    format!("param '{name}'"),
                    format!("workload type '{}' has no such parameter", wltype.name),
                ));
            }
        }

        // Workload-level parameters must be constants.
        let mut wl_params = Vec::new();
        for descr in wltype.params.iter().filter(|d| !d.per_request) {
            let value = match config.params.get(&descr.name) {
                Some(WlParamSpec::Const(value)) => {
                    descr.check(value)?;
                    value.clone()
                }
                Some(WlParamSpec::Generated(_)) => {
                    return Err(Error::invalid_value(
                        format!("param '{}'", descr.name),
                        "workload-level parameters cannot be generated per request",
                    ))
                }
                None => descr.default.clone().ok_or_else(|| {
                    Error::invalid_value(
                        format!("param '{}'", descr.name),
                        "required parameter missing and has no default",
                    )
                })?,
            };
            wl_params.push((descr.name.clone(), value));
        }

        let pgen = PgenSet::build(&wltype.params, |name| config.params.get(name).cloned())?;

        let notify_interval = T_SEC / self.tunables.notifications_per_sec.max(1) as TimeNs;
        let wl = Workload::new(
            config.name.clone(),
            Arc::clone(&wltype),
            deadline,
            config.threadpool.clone(),
            sched,
            pgen,
            wl_params,
            self.notifier_handle.clone(),
            notify_interval,
        );

        // Resolve the chain before the workload becomes visible.
        if let Some(chain) = chain {
            let parent = self.find_workload(&chain.workload).map_err(|_| {
                Error::invalid_value(
                    "chain.workload",
                    format!("workload '{}' was not found", chain.workload),
                )
            })?;
            let (probability, gen) = match &chain.probability {
                Some(prob) => {
                    if !(0.0..=1.0).contains(&prob.value) {
                        return Err(Error::invalid_value(
                            "chain.probability",
                            format!("{} outside [0, 1]", prob.value),
                        ));
                    }
                    (prob.value, Some(randgen::create_generator(&prob.randgen)?))
                }
                None => (1.0, None),
            };
            Workload::chain_back(&parent, Arc::clone(&wl), probability, gen);
        }

        self.workloads
            .lock()
            .insert(config.name.clone(), Arc::clone(&wl));

        let reporter = self.reporter_handle.clone();
        let wl_for_cfg = Arc::clone(&wl);
        Workload::spawn_configure(&wl, move || {
            if let Some(pool) = pool {
                if pool.is_dead() {
                    return Err(Error::invalid_state(
                        pool.name(),
                        "threadpool is shutting down",
                    ));
                }
                pool.attach(Arc::clone(&wl_for_cfg));
            }
            reporter.open_sink(wl_for_cfg.name(), wl_for_cfg.wltype());
            Ok(())
        });
        Ok(())
    }

    fn check_step_state(&self, wl: &Workload) -> Result<()> {
        match wl.status() {
            WlStatus::Configured | WlStatus::Started | WlStatus::Running => Ok(()),
            status => Err(Error::invalid_state(
                wl.name(),
                format!("cannot provide steps in state '{status}'"),
            )),
        }
    }

    /// Queue one step's demand for a workload.
    pub fn provide_step(&self, workload: &str, step_id: u64, count: u32) -> Result<()> {
        let wl = self.find_workload(workload).map_err(|e| self.fail(e))?;
        self.check_step_state(&wl).map_err(|e| self.fail(e))?;
        wl.provide_step(step_id, count, vec![]).map_err(|e| self.fail(e))
    }

    /// Queue one step of pre-built trace requests.
    pub fn provide_step_trace(
        &self,
        workload: &str,
        step_id: u64,
        requests: &[TraceRequestSpec],
    ) -> Result<()> {
        let wl = self.find_workload(workload).map_err(|e| self.fail(e))?;
        self.check_step_state(&wl).map_err(|e| self.fail(e))?;
        let mut trace = Vec::with_capacity(requests.len());
        for spec in requests {
            trace.push(Workload::build_trace_request(&wl, spec).map_err(|e| self.fail(e))?);
        }
        wl.provide_step(step_id, trace.len() as u32, trace)
            .map_err(|e| self.fail(e))
    }

    /// Arm a workload to start at the given wall-clock time.
    pub fn start_workload(&self, workload: &str, at_wall: TimeNs) -> Result<()> {
        let wl = self.find_workload(workload).map_err(|e| self.fail(e))?;
        wl.start(at_wall).map_err(|e| self.fail(e))
    }

    /// Stop feeding a workload; it drains queued steps and finishes.
    pub fn stop_workload(&self, workload: &str) -> Result<()> {
        let wl = self.find_workload(workload).map_err(|e| self.fail(e))?;
        match wl.status() {
            WlStatus::Configured | WlStatus::Started | WlStatus::Running => {
                wl.stop();
                Ok(())
            }
            status => Err(self.fail(Error::invalid_state(
                wl.name(),
                format!("cannot stop workload in state '{status}'"),
            ))),
        }
    }

    /// Tear a workload down, running the module's `unconfig` callback.
    pub fn unconfigure_workload(&self, workload: &str) -> Result<()> {
        let wl = self.find_workload(workload).map_err(|e| self.fail(e))?;
        if wl.status() == WlStatus::Configuring {
            return Err(self.fail(Error::invalid_state(
                wl.name(),
                "configuration is still in progress",
            )));
        }
        self.destroy_workload(workload)
    }

    /// Remove a workload from the engine. A second call returns NotFound.
    pub fn destroy_workload(&self, workload: &str) -> Result<()> {
        let removed = self.workloads.lock().remove(workload);
        let Some(wl) = removed else {
            return Err(self.fail(Error::NotFound {
                kind: "workload",
                name: workload.to_string(),
            }));
        };

        wl.join_config();

        if let Some(tp_name) = wl.tp_name() {
            if let Ok(pool) = self.find_pool(tp_name) {
                pool.detach(&wl);
            }
        }

        if wl.had_status(WlStatus::Configured) {
            if let Err(err) = wl.unconfigure() {
                warn!(workload = wl.name(), error = %err, "module unconfig failed");
            }
        }

        self.reporter_handle.close_sink(wl.name());
        wl.destroy();
        Ok(())
    }

    pub fn workload_status(&self, workload: &str) -> Result<WlStatus> {
        let wl = self.find_workload(workload).map_err(|e| self.fail(e))?;
        Ok(wl.status())
    }

    pub fn workload_names(&self) -> Vec<String> {
        self.workloads.lock().keys().cloned().collect()
    }

    pub fn threadpool_names(&self) -> Vec<String> {
        self.pools.lock().keys().cloned().collect()
    }

    /// Tear everything down in reverse dependency order: workloads, then
    /// pools, then the collector, then the reporter and notifier.
    pub fn shutdown(mut self) {
        for name in self.workload_names() {
            let _ = self.destroy_workload(&name);
        }
        for name in self.threadpool_names() {
            let _ = self.destroy_threadpool(&name);
        }

        drop(self.collector_tx.take());
        if let Some(collector) = self.collector.take() {
            let _ = collector.join();
        }

        if let Some(reporter) = self.reporter.take() {
            reporter.shutdown();
        }
        if let Some(notifier) = self.notifier.take() {
            notifier.shutdown();
        }
        info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatcherSpec, RqschedSpec};
    use crate::errors::ErrorCode;
    use crate::modules::null_type;
    use crate::reporter::NullEventHandler;
    use crate::wlparam::ParamValue;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default(), Arc::new(NullEventHandler)).unwrap()
    }

    fn tp_config(name: &str) -> ThreadPoolConfig {
        ThreadPoolConfig {
            name: name.into(),
            num_threads: 2,
            quantum: 50 * T_MS,
            discard: false,
            disp: DispatcherSpec::RoundRobin,
            sched: None,
        }
    }

    #[test]
    fn test_threadpool_validation() {
        let engine = engine();

        let mut config = tp_config("tp_bad");
        config.num_threads = 0;
        assert_eq!(
            engine.create_threadpool(&config).unwrap_err().code(),
            ErrorCode::InvalidValue
        );

        let mut config = tp_config("tp_bad");
        config.num_threads = 100_000;
        assert_eq!(
            engine.create_threadpool(&config).unwrap_err().code(),
            ErrorCode::InvalidValue
        );

        let mut config = tp_config("tp_bad");
        config.quantum = 1;
        assert_eq!(
            engine.create_threadpool(&config).unwrap_err().code(),
            ErrorCode::InvalidValue
        );

        engine.shutdown();
    }

    #[test]
    fn test_threadpool_name_collision_and_idempotent_destroy() {
        let engine = engine();
        engine.create_threadpool(&tp_config("tp1")).unwrap();

        assert_eq!(
            engine.create_threadpool(&tp_config("tp1")).unwrap_err().code(),
            ErrorCode::AlreadyExists
        );

        engine.destroy_threadpool("tp1").unwrap();
        assert_eq!(
            engine.destroy_threadpool("tp1").unwrap_err().code(),
            ErrorCode::NotFound
        );
        engine.shutdown();
    }

    #[test]
    fn test_workload_requires_type_and_pool() {
        let engine = engine();
        engine.create_threadpool(&tp_config("tp1")).unwrap();
        engine.register_workload_type(null_type()).unwrap();

        let config = WorkloadConfig {
            name: "w1".into(),
            wltype: "missing_type".into(),
            threadpool: Some("tp1".into()),
            chain: None,
            deadline: None,
            rqsched: Some(RqschedSpec::Simple),
            params: HashMap::new(),
        };
        assert_eq!(
            engine.configure_workload(&config).unwrap_err().code(),
            ErrorCode::NotFound
        );

        let config = WorkloadConfig {
            name: "w1".into(),
            wltype: "null".into(),
            threadpool: None,
            chain: None,
            deadline: None,
            rqsched: Some(RqschedSpec::Simple),
            params: HashMap::new(),
        };
        assert_eq!(
            engine.configure_workload(&config).unwrap_err().code(),
            ErrorCode::InvalidValue
        );

        engine.shutdown();
    }

    #[test]
    fn test_workload_unknown_param_rejected() {
        let engine = engine();
        engine.create_threadpool(&tp_config("tp1")).unwrap();
        engine.register_workload_type(null_type()).unwrap();

        let mut params = HashMap::new();
        params.insert("bogus".to_string(), WlParamSpec::Const(ParamValue::Int(1)));
        let config = WorkloadConfig {
            name: "w1".into(),
            wltype: "null".into(),
            threadpool: Some("tp1".into()),
            chain: None,
            deadline: None,
            rqsched: Some(RqschedSpec::Simple),
            params,
        };
        assert_eq!(
            engine.configure_workload(&config).unwrap_err().code(),
            ErrorCode::InvalidValue
        );
        engine.shutdown();
    }

    #[test]
    fn test_step_ops_require_existing_workload() {
        let engine = engine();
        assert_eq!(
            engine.provide_step("nope", 0, 5).unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            engine.start_workload("nope", 0).unwrap_err().code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            engine.destroy_workload("nope").unwrap_err().code(),
            ErrorCode::NotFound
        );
        engine.shutdown();
    }

    #[test]
    fn test_destroy_pool_with_workload_attached_fails() {
        let engine = engine();
        engine.create_threadpool(&tp_config("tp1")).unwrap();
        engine.register_workload_type(null_type()).unwrap();

        let config = WorkloadConfig {
            name: "w1".into(),
            wltype: "null".into(),
            threadpool: Some("tp1".into()),
            chain: None,
            deadline: None,
            rqsched: Some(RqschedSpec::Simple),
            params: HashMap::new(),
        };
        engine.configure_workload(&config).unwrap();

        // Wait for the async configuration to attach the workload.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while engine.workload_status("w1").unwrap() != WlStatus::Configured {
            assert!(std::time::Instant::now() < deadline, "configure timed out");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert_eq!(
            engine.destroy_threadpool("tp1").unwrap_err().code(),
            ErrorCode::InvalidState
        );

        engine.destroy_workload("w1").unwrap();
        engine.destroy_threadpool("tp1").unwrap();
        engine.shutdown();
    }
}
