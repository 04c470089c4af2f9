//! Typed configuration surface.
//!
//! The front-end hands the engine already-parsed dictionaries; this module
//! defines their shapes. Every struct denies unknown fields so a typo in a
//! configuration key fails the call instead of being silently ignored.
//! Dispatcher and scheduler specs are tagged enums keyed on `type`,
//! variates on `class`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::wlparam::ParamValue;

/// Random generator spec: `{class, seed?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RandGenSpec {
    pub class: String,

    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for RandGenSpec {
    fn default() -> Self {
        RandGenSpec {
            class: "lcg".into(),
            seed: None,
        }
    }
}

/// Random variate spec, keyed on `class`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "lowercase", deny_unknown_fields)]
pub enum RandVarSpec {
    Exponential { rate: f64 },
    Uniform { min: f64, max: f64 },
    Erlang { shape: u32, rate: f64 },
    Normal { mean: f64, stddev: f64 },
}

/// Request scheduler spec, keyed on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum RqschedSpec {
    /// Every request of step k arrives at the step boundary.
    Simple,

    /// Inter-arrival times drawn from a distribution. `scope` in [0, 1]
    /// clamps each draw around the distribution mean (0 disables).
    Iat {
        #[serde(default)]
        randgen: RandGenSpec,
        distribution: RandVarSpec,
        #[serde(default)]
        scope: f64,
    },

    /// Closed population of `nusers` users with per-user think times.
    Think {
        #[serde(default)]
        randgen: RandGenSpec,
        distribution: RandVarSpec,
        nusers: u32,
    },
}

/// Threadpool dispatcher spec, keyed on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum DispatcherSpec {
    #[serde(rename = "round-robin")]
    RoundRobin,

    #[serde(rename = "random")]
    Random,

    /// `n` consecutive requests per worker, starting at worker `wid`.
    #[serde(rename = "fill-up")]
    FillUp { n: u32, wid: usize },

    /// Worker chosen by the request's user id.
    #[serde(rename = "user")]
    User,

    /// Worker chosen by the request's recorded worker id; random fallback.
    #[serde(rename = "trace")]
    Trace,

    /// No pre-assignment; requests go to the first idle worker.
    #[serde(rename = "first-free")]
    FirstFree,
}

impl DispatcherSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            DispatcherSpec::RoundRobin => "round-robin",
            DispatcherSpec::Random => "random",
            DispatcherSpec::FillUp { .. } => "fill-up",
            DispatcherSpec::User => "user",
            DispatcherSpec::Trace => "trace",
            DispatcherSpec::FirstFree => "first-free",
        }
    }
}

/// Advisory per-worker scheduling: policy name, integer params and opaque
/// capability identifiers of the CPU objects to bind to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSchedSpec {
    pub wid: usize,

    #[serde(default)]
    pub policy: Option<String>,

    #[serde(default)]
    pub params: HashMap<String, i64>,

    #[serde(default)]
    pub objects: Vec<String>,
}

/// Threadpool creation spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadPoolConfig {
    pub name: String,

    pub num_threads: usize,

    /// Quantum in nanoseconds.
    pub quantum: i64,

    #[serde(default)]
    pub discard: bool,

    pub disp: DispatcherSpec,

    #[serde(default)]
    pub sched: Option<Vec<WorkerSchedSpec>>,
}

/// Chain probability gate: the generator draws in [0, 1) and the child is
/// synthesised when the draw falls below `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainProbabilitySpec {
    pub randgen: RandGenSpec,
    pub value: f64,
}

/// Chaining spec: this workload's requests are triggered by completions of
/// `workload`'s requests instead of its own scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WlChainSpec {
    pub workload: String,

    #[serde(default)]
    pub probability: Option<ChainProbabilitySpec>,
}

/// One entry of a probability map: a probability and either a single value
/// or a value array consumed round-robin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PmapEntrySpec {
    pub probability: f64,

    #[serde(default)]
    pub value: Option<ParamValue>,

    #[serde(default)]
    pub valarray: Option<Vec<ParamValue>>,
}

/// Generated parameter: a generator plus either a variate or a pmap
/// (neither means raw generator output).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratedParamSpec {
    pub randgen: RandGenSpec,

    #[serde(default)]
    pub randvar: Option<RandVarSpec>,

    #[serde(default)]
    pub pmap: Option<Vec<PmapEntrySpec>>,
}

/// Workload parameter value in configuration: either a constant or a
/// per-request generator description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WlParamSpec {
    Generated(GeneratedParamSpec),
    Const(ParamValue),
}

/// Workload creation spec. Exactly one of `threadpool` and `chain` must be
/// present; chained workloads have no scheduler of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadConfig {
    pub name: String,

    pub wltype: String,

    #[serde(default)]
    pub threadpool: Option<String>,

    #[serde(default)]
    pub chain: Option<WlChainSpec>,

    /// Max acceptable start lateness in nanoseconds; absent means no limit.
    #[serde(default)]
    pub deadline: Option<i64>,

    #[serde(default)]
    pub rqsched: Option<RqschedSpec>,

    #[serde(default)]
    pub params: HashMap<String, WlParamSpec>,
}

/// Externally supplied (trace-replay) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TraceRequestSpec {
    pub id: u32,

    #[serde(default)]
    pub user: u32,

    /// Worker that handled the request during the original run; negative
    /// means unknown.
    #[serde(default = "default_trace_thread")]
    pub thread: i32,

    /// Arrival time in nanoseconds relative to the workload start clock.
    pub sched_time: i64,

    #[serde(default)]
    pub params: HashMap<String, ParamValue>,
}

fn default_trace_thread() -> i32 {
    -1
}
