//! Experiment artifact tests: per-workload `.tsf` record logs and their
//! schema companion JSONs, written through a full engine run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tsload::config::{DispatcherSpec, RqschedSpec, ThreadPoolConfig, WlParamSpec, WorkloadConfig};
use tsload::modules::busy_wait_type;
use tsload::time::{now_wall, T_MS};
use tsload::tsfile::{TsFile, TsfFieldType};
use tsload::wlparam::ParamValue;
use tsload::{Engine, EngineConfig, EventHandler, RequestReport, WlStatus, RQF_SUCCESS};

#[derive(Default)]
struct CountingHandler {
    reports: Mutex<Vec<RequestReport>>,
    statuses: Mutex<Vec<(String, WlStatus)>>,
}

impl EventHandler for CountingHandler {
    fn requests_reported(&self, reports: &[RequestReport]) {
        self.reports.lock().unwrap().extend_from_slice(reports);
    }

    fn workload_status(&self, workload: &str, status: WlStatus, _progress: i64, _message: &str) {
        self.statuses
            .lock()
            .unwrap()
            .push((workload.to_string(), status));
    }
}

impl CountingHandler {
    fn wait_status(&self, workload: &str, status: WlStatus, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self
                .statuses
                .lock()
                .unwrap()
                .iter()
                .any(|(wl, st)| wl == workload && *st == status);
            if seen {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {workload} to reach {status}"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

fn read_u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_i64_at(buf: &[u8], off: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(raw)
}

#[test]
fn test_run_produces_tsf_and_schema_json() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(CountingHandler::default());
    let engine = Engine::new(
        EngineConfig {
            output_dir: Some(dir.path().to_path_buf()),
            ..EngineConfig::default()
        },
        handler.clone(),
    )
    .unwrap();

    engine.register_workload_type(busy_wait_type()).unwrap();
    engine
        .create_threadpool(&ThreadPoolConfig {
            name: "tp1".into(),
            num_threads: 1,
            quantum: 50 * T_MS,
            discard: false,
            disp: DispatcherSpec::RoundRobin,
            sched: None,
        })
        .unwrap();

    let mut params = HashMap::new();
    params.insert(
        "delay".to_string(),
        WlParamSpec::Const(ParamValue::Int(T_MS)),
    );
    engine
        .configure_workload(&WorkloadConfig {
            name: "w1".into(),
            wltype: "busy_wait".into(),
            threadpool: Some("tp1".into()),
            chain: None,
            deadline: None,
            rqsched: Some(RqschedSpec::Simple),
            params,
        })
        .unwrap();
    handler.wait_status("w1", WlStatus::Configured, Duration::from_secs(15));

    engine.provide_step("w1", 0, 5).unwrap();
    engine.start_workload("w1", now_wall()).unwrap();
    handler.wait_status("w1", WlStatus::Finished, Duration::from_secs(15));

    // The reporter appends before it notifies the handler, so once all
    // five reports are visible the records are on disk.
    let deadline = Instant::now() + Duration::from_secs(15);
    while handler.reports.lock().unwrap().len() < 5 {
        assert!(Instant::now() < deadline, "timed out waiting for reports");
        std::thread::sleep(Duration::from_millis(10));
    }

    engine.destroy_workload("w1").unwrap();
    engine.destroy_threadpool("tp1").unwrap();
    // Shutdown joins the reporter, so every append has landed.
    engine.shutdown();

    let reports = handler.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 5);
    assert!(reports.iter().all(|r| r.has_flag(RQF_SUCCESS)));

    // Schema companion round-trips through serde and matches the file.
    let schema_json = std::fs::read_to_string(dir.path().join("w1-schema.json")).unwrap();
    let schema: tsload::tsfile::TsfSchema = serde_json::from_str(&schema_json).unwrap();
    let tsf_path = dir.path().join("w1.tsf");
    assert_eq!(TsFile::read_schema(&tsf_path).unwrap(), schema);

    // The delay parameter rides in the record suffix.
    let delay_field = schema.fields.iter().find(|f| f.name == "delay").unwrap();
    assert_eq!(delay_field.ftype, TsfFieldType::Int);

    let file = TsFile::open(&tsf_path, &schema, false).unwrap();
    assert_eq!(file.count(), 5);
    let bytes = file.read(0, 5).unwrap();
    assert_eq!(bytes.len(), 5 * schema.entry_size as usize);

    let mut ids = Vec::new();
    for slot in 0..5usize {
        let rec = &bytes[slot * schema.entry_size as usize..];
        assert_eq!(read_u32_at(rec, 0), 0); // step
        ids.push(read_u32_at(rec, 4)); // request id
        assert_eq!(read_i64_at(rec, 20), 0); // sched_time
        assert_eq!(
            read_i64_at(rec, delay_field.offset as usize),
            T_MS // the delay parameter value
        );
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_no_output_dir_means_no_files() {
    let handler = Arc::new(CountingHandler::default());
    let engine = Engine::new(EngineConfig::default(), handler.clone()).unwrap();
    engine.register_workload_type(busy_wait_type()).unwrap();
    engine
        .create_threadpool(&ThreadPoolConfig {
            name: "tp1".into(),
            num_threads: 1,
            quantum: 50 * T_MS,
            discard: false,
            disp: DispatcherSpec::Random,
            sched: None,
        })
        .unwrap();
    engine
        .configure_workload(&WorkloadConfig {
            name: "w1".into(),
            wltype: "busy_wait".into(),
            threadpool: Some("tp1".into()),
            chain: None,
            deadline: None,
            rqsched: Some(RqschedSpec::Simple),
            params: HashMap::new(),
        })
        .unwrap();
    handler.wait_status("w1", WlStatus::Configured, Duration::from_secs(15));

    engine.provide_step("w1", 0, 3).unwrap();
    engine.start_workload("w1", now_wall()).unwrap();
    handler.wait_status("w1", WlStatus::Finished, Duration::from_secs(15));

    engine.destroy_workload("w1").unwrap();
    engine.destroy_threadpool("tp1").unwrap();
    engine.shutdown();

    // Reports still reached the handler.
    assert_eq!(handler.reports.lock().unwrap().len(), 3);
}
