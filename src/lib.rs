//! Synthetic workload generation engine.
//!
//! `tsload` drives user-supplied workload modules against a system under
//! test at precisely controlled request arrival times, records per-request
//! timings and persists them into an append-only binary time-series file.
//!
//! The moving parts:
//!
//! - an [`Engine`] owning the name registries, reporter and notifier
//!   threads and the threadpool collector;
//! - threadpools of worker threads plus one controller, driving a quantum
//!   loop and a pluggable dispatcher (round-robin, random, fill-up,
//!   per-user, trace replay, first-free);
//! - workloads binding a [`WorkloadType`] to a threadpool, with a request
//!   scheduler (`simple`, `iat`, `think`) assigning arrival times and
//!   per-request parameter generators drawing from random variates or
//!   probability maps;
//! - a crash-safe `.tsf` record log with rotating superblocks.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use tsload::config::{DispatcherSpec, RqschedSpec, ThreadPoolConfig, WorkloadConfig};
//! use tsload::{Engine, EngineConfig, NullEventHandler};
//!
//! let engine = Engine::new(EngineConfig::default(), Arc::new(NullEventHandler))?;
//! engine.register_workload_type(tsload::modules::busy_wait_type())?;
//! engine.create_threadpool(&ThreadPoolConfig {
//!     name: "tp1".into(),
//!     num_threads: 2,
//!     quantum: 100_000_000,
//!     discard: false,
//!     disp: DispatcherSpec::RoundRobin,
//!     sched: None,
//! })?;
//! engine.configure_workload(&WorkloadConfig {
//!     name: "w1".into(),
//!     wltype: "busy_wait".into(),
//!     threadpool: Some("tp1".into()),
//!     chain: None,
//!     deadline: None,
//!     rqsched: Some(RqschedSpec::Simple),
//!     params: HashMap::new(),
//! })?;
//! engine.provide_step("w1", 0, 10)?;
//! engine.start_workload("w1", tsload::time::now_wall())?;
//! # Ok::<(), tsload::Error>(())
//! ```

pub mod config;
mod dispatch;
mod engine;
pub mod errors;
pub mod modules;
pub mod randgen;
mod reporter;
pub mod rqsched;
pub mod time;
mod threadpool;
pub mod tsfile;
pub mod wlparam;
pub mod wlpgen;
pub mod workload;

pub use engine::{Engine, EngineConfig, Tunables};
pub use errors::{Error, ErrorCode, Result};
pub use reporter::{EventHandler, NullEventHandler, RequestReport};
pub use threadpool::ThreadPool;
pub use workload::{
    Request, WlStatus, Workload, WorkloadModule, WorkloadType, RQF_FINISHED, RQF_ONTIME,
    RQF_STARTED, RQF_SUCCESS, RQF_TRACE, WL_STEP_QUEUE_SIZE,
};
