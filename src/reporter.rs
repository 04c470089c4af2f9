//! Asynchronous fan-out of completed requests and status notifications.
//!
//! Workers and controllers never touch the disk: finished request batches
//! go through an MPSC queue to a single consumer thread that converts them
//! into packed records, appends them to the per-workload time-series file
//! and forwards them to the registered event handler. Status notifications
//! flow through a second queue of the same shape.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, error, info, warn};

use crate::errors::ErrorCode;
use crate::time::TimeNs;
use crate::tsfile::{TsFile, TsfFieldType, TsfResult, TsfSchema};
use crate::wlparam::{self, ParamType};
use crate::workload::{Request, WlStatus, WorkloadType};

/// Flattened, engine-independent view of one finished (or discarded)
/// request, as delivered to the event handler.
#[derive(Debug, Clone)]
pub struct RequestReport {
    pub workload: String,
    pub step: u64,
    pub request_id: u32,
    pub chain_request: i32,
    pub worker_id: i32,
    pub user_id: u32,
    pub sched_time: TimeNs,
    pub start_time: TimeNs,
    pub end_time: TimeNs,
    pub queue_len: i32,
    pub flags: u16,
}

impl RequestReport {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Callbacks the embedding front-end registers with the engine.
pub trait EventHandler: Send + Sync {
    fn requests_reported(&self, _reports: &[RequestReport]) {}

    fn workload_status(&self, _workload: &str, _status: WlStatus, _progress: i64, _message: &str) {
    }

    fn error(&self, _code: ErrorCode, _message: &str) {}
}

/// Handler that drops everything; useful when only the files matter.
pub struct NullEventHandler;

impl EventHandler for NullEventHandler {}

/// Fixed prefix of every record, before the per-request parameter suffix.
const RECORD_BASE: [(&str, TsfFieldType, u32); 10] = [
    ("step", TsfFieldType::Int, 4),
    ("request", TsfFieldType::Int, 4),
    ("chain_request", TsfFieldType::Int, 4),
    ("thread", TsfFieldType::Int, 4),
    ("user", TsfFieldType::Int, 4),
    ("sched_time", TsfFieldType::Int, 8),
    ("start_time", TsfFieldType::Int, 8),
    ("end_time", TsfFieldType::Int, 8),
    ("queue_length", TsfFieldType::Int, 4),
    ("flags", TsfFieldType::Int, 2),
];

pub(crate) const RECORD_BASE_SIZE: usize = 50;

fn param_field_type(ptype: ParamType) -> TsfFieldType {
    match ptype {
        ParamType::Bool => TsfFieldType::Bool,
        ParamType::Int => TsfFieldType::Int,
        ParamType::Float => TsfFieldType::Float,
        ParamType::String => TsfFieldType::String,
    }
}

/// Record schema of one workload type: the fixed prefix plus its
/// per-request parameters.
pub fn record_schema(wltype: &WorkloadType) -> TsfResult<TsfSchema> {
    let mut fields: Vec<(String, TsfFieldType, u32)> = RECORD_BASE
        .iter()
        .map(|(name, ftype, size)| ((*name).to_string(), *ftype, *size))
        .collect();
    for descr in wltype.request_params() {
        fields.push((
            descr.name.clone(),
            param_field_type(descr.ptype),
            descr.encoded_size() as u32,
        ));
    }
    let refs: Vec<(&str, TsfFieldType, u32)> = fields
        .iter()
        .map(|(name, ftype, size)| (name.as_str(), *ftype, *size))
        .collect();
    TsfSchema::packed(&refs)
}

fn encode_record(rq: &Request, buf: &mut [u8]) {
    buf[0..4].copy_from_slice(&(rq.step as u32).to_le_bytes());
    buf[4..8].copy_from_slice(&rq.id.to_le_bytes());
    buf[8..12].copy_from_slice(&rq.chain_request.to_le_bytes());
    buf[12..16].copy_from_slice(&rq.worker_id.to_le_bytes());
    buf[16..20].copy_from_slice(&rq.user_id.to_le_bytes());
    buf[20..28].copy_from_slice(&rq.sched_time.to_le_bytes());
    buf[28..36].copy_from_slice(&rq.start_time.to_le_bytes());
    buf[36..44].copy_from_slice(&rq.end_time.to_le_bytes());
    buf[44..48].copy_from_slice(&rq.queue_len.to_le_bytes());
    buf[48..50].copy_from_slice(&rq.flags.to_le_bytes());
    wlparam::encode_request_params(
        &rq.workload.wltype().params,
        &rq.params,
        &mut buf[RECORD_BASE_SIZE..],
    );
}

fn report_of(rq: &Request) -> RequestReport {
    RequestReport {
        workload: rq.workload.name().to_string(),
        step: rq.step,
        request_id: rq.id,
        chain_request: rq.chain_request,
        worker_id: rq.worker_id,
        user_id: rq.user_id,
        sched_time: rq.sched_time,
        start_time: rq.start_time,
        end_time: rq.end_time,
        queue_len: rq.queue_len,
        flags: rq.flags,
    }
}

enum ReportMsg {
    Batch(Vec<Box<Request>>),
    OpenSink {
        workload: String,
        wltype: Arc<WorkloadType>,
    },
    CloseSink {
        workload: String,
    },
    Shutdown,
}

/// Cloneable producer side of the report queue.
#[derive(Clone)]
pub(crate) struct ReporterHandle {
    tx: Sender<ReportMsg>,
}

impl ReporterHandle {
    pub(crate) fn report(&self, batch: Vec<Box<Request>>) {
        if !batch.is_empty() {
            let _ = self.tx.send(ReportMsg::Batch(batch));
        }
    }

    pub(crate) fn open_sink(&self, workload: &str, wltype: &Arc<WorkloadType>) {
        let _ = self.tx.send(ReportMsg::OpenSink {
            workload: workload.to_string(),
            wltype: Arc::clone(wltype),
        });
    }

    pub(crate) fn close_sink(&self, workload: &str) {
        let _ = self.tx.send(ReportMsg::CloseSink {
            workload: workload.to_string(),
        });
    }
}

struct ReporterWorker {
    output_dir: Option<PathBuf>,
    sync_mode: bool,
    handler: Arc<dyn EventHandler>,
    sinks: HashMap<String, TsFile>,
}

impl ReporterWorker {
    fn open_sink(&mut self, workload: &str, wltype: &WorkloadType) {
        let Some(dir) = &self.output_dir else {
            return;
        };
        let schema = match record_schema(wltype) {
            Ok(schema) => schema,
            Err(err) => {
                error!(workload, error = %err, "cannot build record schema");
                return;
            }
        };

        let tsf_path = dir.join(format!("{workload}.tsf"));
        match TsFile::create(&tsf_path, &schema, self.sync_mode) {
            Ok(file) => {
                self.sinks.insert(workload.to_string(), file);
                info!(workload, path = %tsf_path.display(), "opened request log");
            }
            Err(err) => {
                error!(workload, error = %err, "cannot create request log");
                return;
            }
        }

        let schema_path = dir.join(format!("{workload}-schema.json"));
        match serde_json::to_vec_pretty(&schema) {
            Ok(bytes) => {
                if let Err(err) = std::fs::write(&schema_path, bytes) {
                    warn!(workload, error = %err, "cannot write schema companion");
                }
            }
            Err(err) => warn!(workload, error = %err, "cannot serialise schema"),
        }
    }

    fn consume_batch(&mut self, batch: Vec<Box<Request>>) {
        // Records grouped per workload (chained requests may belong to a
        // different workload than their parent).
        let mut records: HashMap<String, Vec<u8>> = HashMap::new();
        let mut reports = Vec::new();

        for rq in &batch {
            let mut cur: Option<&Request> = Some(rq.as_ref());
            while let Some(rq) = cur {
                reports.push(report_of(rq));
                if self.sinks.contains_key(rq.workload.name()) {
                    let entry_size =
                        RECORD_BASE_SIZE + wlparam::request_params_size(&rq.workload.wltype().params);
                    let buf = records.entry(rq.workload.name().to_string()).or_default();
                    let off = buf.len();
                    buf.resize(off + entry_size, 0);
                    encode_record(rq, &mut buf[off..]);
                }
                cur = rq.chain_next.as_deref();
            }
        }

        for (workload, bytes) in records {
            if let Some(sink) = self.sinks.get(&workload) {
                if let Err(err) = sink.append(&bytes) {
                    // A failed append is not fatal for the engine; the
                    // handler still sees the reports.
                    warn!(workload = %workload, error = %err, "request log append failed");
                }
            }
        }

        debug!(count = reports.len(), "requests reported");
        self.handler.requests_reported(&reports);
    }
}

/// Owner of the report queue consumer thread.
pub(crate) struct Reporter {
    tx: Sender<ReportMsg>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Reporter {
    pub(crate) fn start(
        output_dir: Option<PathBuf>,
        sync_mode: bool,
        handler: Arc<dyn EventHandler>,
    ) -> Reporter {
        let (tx, rx) = unbounded();
        let mut worker = ReporterWorker {
            output_dir,
            sync_mode,
            handler,
            sinks: HashMap::new(),
        };
        let thread = thread::Builder::new()
            .name("tsload-reporter".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        ReportMsg::Batch(batch) => worker.consume_batch(batch),
                        ReportMsg::OpenSink { workload, wltype } => {
                            worker.open_sink(&workload, &wltype)
                        }
                        ReportMsg::CloseSink { workload } => {
                            worker.sinks.remove(&workload);
                        }
                        ReportMsg::Shutdown => break,
                    }
                }
            })
            .ok();
        if thread.is_none() {
            error!("failed to spawn reporter thread; reports will be dropped");
        }
        Reporter { tx, thread }
    }

    pub(crate) fn handle(&self) -> ReporterHandle {
        ReporterHandle {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn shutdown(mut self) {
        let _ = self.tx.send(ReportMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

enum NotifyMsg {
    Status {
        workload: String,
        status: WlStatus,
        progress: i64,
        message: String,
    },
    Shutdown,
}

/// Cloneable producer side of the notification queue.
#[derive(Clone)]
pub(crate) struct NotifierHandle {
    tx: Sender<NotifyMsg>,
}

impl NotifierHandle {
    pub(crate) fn status(&self, workload: &str, status: WlStatus, progress: i64, message: &str) {
        let _ = self.tx.send(NotifyMsg::Status {
            workload: workload.to_string(),
            status,
            progress,
            message: message.to_string(),
        });
    }

    /// A handle whose notifications go nowhere. For tests and detached
    /// contexts.
    #[cfg(test)]
    pub(crate) fn discarding() -> NotifierHandle {
        let (tx, _rx) = unbounded();
        NotifierHandle { tx }
    }
}

/// Owner of the notification consumer thread.
pub(crate) struct Notifier {
    tx: Sender<NotifyMsg>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Notifier {
    pub(crate) fn start(handler: Arc<dyn EventHandler>) -> Notifier {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("tsload-notify".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        NotifyMsg::Status {
                            workload,
                            status,
                            progress,
                            message,
                        } => handler.workload_status(&workload, status, progress, &message),
                        NotifyMsg::Shutdown => break,
                    }
                }
            })
            .ok();
        if thread.is_none() {
            error!("failed to spawn notifier thread; notifications will be dropped");
        }
        Notifier { tx, thread }
    }

    pub(crate) fn handle(&self) -> NotifierHandle {
        NotifierHandle {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn shutdown(mut self) {
        let _ = self.tx.send(NotifyMsg::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rqsched::SimpleScheduler;
    use crate::time::{TIME_MAX, T_SEC};
    use crate::wlparam::{ParamDescr, ParamValue};
    use crate::wlpgen::PgenSet;
    use crate::workload::{Workload, WorkloadModule, WL_STEP_QUEUE_SIZE};

    struct NullModule;

    impl WorkloadModule for NullModule {
        fn run_request(&self, _rq: &Request) -> crate::errors::Result<()> {
            Ok(())
        }
    }

    fn delay_type() -> Arc<WorkloadType> {
        Arc::new(WorkloadType {
            name: "busy_wait".into(),
            params: vec![ParamDescr::new("delay", ParamType::Int, true)
                .with_default(ParamValue::Int(1000))],
            module: Box::new(NullModule),
        })
    }

    fn test_workload(wltype: Arc<WorkloadType>) -> Arc<Workload> {
        let pgen = PgenSet::build(&wltype.params, |_| None).unwrap();
        Workload::new(
            "w_report".into(),
            wltype,
            TIME_MAX,
            Some("tp".into()),
            Box::new(SimpleScheduler),
            pgen,
            vec![],
            NotifierHandle::discarding(),
            T_SEC / 20,
        )
    }

    #[test]
    fn test_record_schema_appends_params() {
        let wltype = delay_type();
        let schema = record_schema(&wltype).unwrap();
        assert_eq!(schema.fields.len(), 11);
        assert_eq!(schema.entry_size as usize, RECORD_BASE_SIZE + 8);
        let last = schema.fields.last().unwrap();
        assert_eq!(last.name, "delay");
        assert_eq!(last.ftype, TsfFieldType::Int);
        assert_eq!(last.offset as usize, RECORD_BASE_SIZE);
    }

    #[test]
    fn test_encode_record_layout() {
        let wl = test_workload(delay_type());
        wl.provide_step(0, 1, vec![]).unwrap();
        let mut rqs = Workload::advance_step(&wl, 1000, crate::time::now_clock()).unwrap();
        let rq = &mut rqs[0];
        rq.sched_time = 0x11;
        rq.start_time = 0x22;
        rq.end_time = 0x33;
        rq.flags = 0x0f;
        rq.queue_len = 2;
        rq.worker_id = 1;

        let mut buf = vec![0u8; RECORD_BASE_SIZE + 8];
        encode_record(rq, &mut buf);
        assert_eq!(&buf[0..4], &0u32.to_le_bytes()); // step
        assert_eq!(&buf[4..8], &0u32.to_le_bytes()); // request id
        assert_eq!(&buf[8..12], &(-1i32).to_le_bytes()); // chain_request
        assert_eq!(&buf[12..16], &1i32.to_le_bytes()); // thread
        assert_eq!(&buf[20..28], &0x11i64.to_le_bytes());
        assert_eq!(&buf[28..36], &0x22i64.to_le_bytes());
        assert_eq!(&buf[36..44], &0x33i64.to_le_bytes());
        assert_eq!(&buf[44..48], &2i32.to_le_bytes());
        assert_eq!(&buf[48..50], &0x0fu16.to_le_bytes());
        // Default delay param in the suffix.
        assert_eq!(&buf[50..58], &1000i64.to_le_bytes());
    }

    #[test]
    fn test_step_queue_size_is_power_of_two() {
        assert!(WL_STEP_QUEUE_SIZE.is_power_of_two());
    }
}
