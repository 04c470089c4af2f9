//! Built-in workload modules.
//!
//! Real deployments load workload types from external modules; these two
//! are compiled in for tests, demos and smoke runs. `busy_wait` spins for
//! a per-request duration, `null` completes immediately.

use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::time::{self, TimeNs, T_SEC};
use crate::wlparam::{ParamDescr, ParamRange, ParamType, ParamValue};
use crate::workload::{Request, Workload, WorkloadModule, WorkloadType};

/// Spins the worker for `delay` nanoseconds per request.
pub struct BusyWaitModule;

impl WorkloadModule for BusyWaitModule {
    fn config(&self, wl: &Workload) -> Result<()> {
        tracing::debug!(workload = wl.name(), "busy_wait configured");
        Ok(())
    }

    fn run_request(&self, rq: &Request) -> Result<()> {
        let delay = rq
            .param("delay")
            .and_then(ParamValue::as_int)
            .ok_or_else(|| Error::Internal("busy_wait request without a delay".into()))?;
        let until = time::now_clock() + delay as TimeNs;
        while time::now_clock() < until {
            std::hint::spin_loop();
        }
        Ok(())
    }
}

/// Workload type descriptor for [`BusyWaitModule`].
pub fn busy_wait_type() -> Arc<WorkloadType> {
    Arc::new(WorkloadType {
        name: "busy_wait".into(),
        params: vec![ParamDescr::new("delay", ParamType::Int, true)
            .with_range(ParamRange::Int {
                min: 0,
                max: 10 * T_SEC,
            })
            .with_default(ParamValue::Int(0))],
        module: Box::new(BusyWaitModule),
    })
}

/// Completes every request immediately.
pub struct NullWorkloadModule;

impl WorkloadModule for NullWorkloadModule {
    fn run_request(&self, _rq: &Request) -> Result<()> {
        Ok(())
    }
}

/// Workload type descriptor for [`NullWorkloadModule`].
pub fn null_type() -> Arc<WorkloadType> {
    Arc::new(WorkloadType {
        name: "null".into(),
        params: vec![],
        module: Box::new(NullWorkloadModule),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::T_MS;

    #[test]
    fn test_busy_wait_type_shape() {
        let wltype = busy_wait_type();
        assert_eq!(wltype.name, "busy_wait");
        assert_eq!(wltype.request_params().count(), 1);
    }

    #[test]
    fn test_busy_wait_spins_for_delay() {
        use crate::reporter::NotifierHandle;
        use crate::rqsched::SimpleScheduler;
        use crate::time::TIME_MAX;
        use crate::wlpgen::PgenSet;

        let wltype = busy_wait_type();
        let pgen = PgenSet::build(&wltype.params, |name| {
            assert_eq!(name, "delay");
            Some(crate::config::WlParamSpec::Const(ParamValue::Int(2 * T_MS)))
        })
        .unwrap();
        let wl = Workload::new(
            "w_busy".into(),
            wltype,
            TIME_MAX,
            Some("tp".into()),
            Box::new(SimpleScheduler),
            pgen,
            vec![],
            NotifierHandle::discarding(),
            T_SEC / 20,
        );
        wl.provide_step(0, 1, vec![]).unwrap();
        let mut rqs = Workload::advance_step(&wl, 10 * T_MS, time::now_clock()).unwrap();

        let before = time::now_clock();
        wl.run_request(&mut rqs[0]);
        let elapsed = time::now_clock() - before;
        assert!(elapsed >= 2 * T_MS, "spun only {elapsed}ns");
        assert!(rqs[0].has_flag(crate::workload::RQF_SUCCESS));
    }
}
