//! Agent runs against the scripted transport.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use oaiharvest_agent::{
    AgentConfig, AgentListener, BatchReport, FailedRecord, HarvestAgent, MemorySink,
    ParquetRecordSink, RecordSink, SinkError, WritePolicy,
};
use oaiharvest_harvester::testing::{MockTransport, TestRecord, list_records, three_records};
use oaiharvest_harvester::{
    HarvestError, HarvestNotification, HarvestObserver, HarvestParameters, HarvestedRecord,
    NotificationType, Verb,
};

type Ended = Arc<Mutex<Vec<HarvestNotification>>>;

fn ended_log() -> (Ended, Arc<dyn HarvestObserver>) {
    let log: Ended = Arc::default();
    let sink = log.clone();
    let observer: Arc<dyn HarvestObserver> = Arc::new(move |n: &HarvestNotification| {
        if n.kind == NotificationType::Ended {
            sink.lock().unwrap().push(n.clone());
        }
    });
    (log, observer)
}

fn records(prefix: &str, n: usize) -> Vec<TestRecord> {
    (0..n)
        .map(|i| TestRecord::new(format!("oai:{prefix}:{i}"), "2015-01-01"))
        .collect()
}

fn params(base: &str) -> HarvestParameters {
    HarvestParameters::parse(base, Verb::ListRecords).unwrap()
}

#[derive(Default)]
struct Counting {
    written: Mutex<Vec<BatchReport>>,
    failed_batches: Mutex<usize>,
    failed_records: Mutex<usize>,
}

impl AgentListener for Counting {
    fn on_batch_written(&self, report: &BatchReport) {
        self.written.lock().unwrap().push(*report);
    }

    fn on_record_failed(&self, _failure: &FailedRecord) {
        *self.failed_records.lock().unwrap() += 1;
    }

    fn on_batch_failed(&self, _size: usize, _error: &SinkError) {
        *self.failed_batches.lock().unwrap() += 1;
    }
}

#[test]
fn full_batches_then_one_remainder() {
    let transport = Arc::new(MockTransport::new());
    let a = records("a", 7);
    transport
        .reply("http://a.example/oai", list_records(&a[..4], Some("a2")))
        .reply("http://a.example/oai", list_records(&a[4..], None))
        .reply("http://b.example/oai", list_records(&records("b", 5), None))
        .reply("http://c.example/oai", list_records(&records("c", 3), None));

    let agent = HarvestAgent::builder(transport.clone())
        .config(AgentConfig {
            batch_size: 4,
            workers: 3,
            ..AgentConfig::default()
        })
        .build()
        .unwrap();
    let (ended, observer) = ended_log();
    for base in ["http://a.example/oai", "http://b.example/oai", "http://c.example/oai"] {
        agent.add_harvest(params(base), vec![observer.clone()]).unwrap();
    }

    let mut sink = MemorySink::new();
    let summary = agent.start(&mut sink).unwrap();

    assert_eq!(summary.harvests, 3);
    assert_eq!(summary.records_enqueued, 15);
    assert_eq!(summary.records_written, 15);
    assert_eq!(sink.batch_sizes(), [4, 4, 4, 3]);
    assert_eq!(sink.batch_sizes().iter().sum::<usize>(), summary.records_enqueued);
    assert!(sink.is_finished());
    assert_eq!(agent.running_harvests(), 0);

    let ended = ended.lock().unwrap();
    assert_eq!(ended.len(), 3);
    assert!(ended.iter().all(|n| n.cause.is_none()));
}

#[test]
fn records_of_one_harvest_keep_document_order() {
    let transport = Arc::new(MockTransport::new());
    let all = records("x", 9);
    transport
        .reply("http://x.example/oai", list_records(&all[..5], Some("p2")))
        .reply("http://x.example/oai", list_records(&all[5..], None));

    let agent = HarvestAgent::builder(transport)
        .config(AgentConfig {
            batch_size: 2,
            ..AgentConfig::default()
        })
        .build()
        .unwrap();
    agent.add_harvest(params("http://x.example/oai"), Vec::new()).unwrap();

    let mut sink = MemorySink::new();
    agent.start(&mut sink).unwrap();

    let ids: Vec<String> = sink.records().into_iter().map(|r| r.identifier).collect();
    let expected: Vec<String> = (0..9).map(|i| format!("oai:x:{i}")).collect();
    assert_eq!(ids, expected);
}

/// Holds the writer thread on every batch.
struct SlowSink {
    inner: MemorySink,
    delay: Duration,
}

impl RecordSink for SlowSink {
    fn write_batch(
        &mut self,
        batch: Vec<HarvestedRecord>,
        policy: WritePolicy,
    ) -> Result<Vec<FailedRecord>, SinkError> {
        thread::sleep(self.delay);
        self.inner.write_batch(batch, policy)
    }

    fn finish(&mut self) -> Result<usize, SinkError> {
        self.inner.finish()
    }
}

#[test]
fn saturated_queue_interrupts_harvest() {
    let transport = Arc::new(MockTransport::new());
    transport.reply("http://big.example/oai", list_records(&records("big", 40), None));

    let agent = HarvestAgent::builder(transport)
        .config(AgentConfig {
            queue_capacity: 1,
            batch_size: 1,
            offer_timeout: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(10),
            workers: 2,
            ..AgentConfig::default()
        })
        .build()
        .unwrap();
    let (ended, observer) = ended_log();
    agent
        .add_harvest(params("http://big.example/oai"), vec![observer])
        .unwrap();

    let memory = MemorySink::new();
    let mut sink = SlowSink {
        inner: memory.clone(),
        delay: Duration::from_millis(200),
    };
    let summary = agent.start(&mut sink).unwrap();

    let ended = ended.lock().unwrap();
    assert_eq!(ended.len(), 1);
    assert!(ended[0].interrupted);
    assert!(!ended[0].explicitly_stopped);
    assert!(matches!(
        ended[0].cause.as_deref(),
        Some(HarvestError::Capacity { .. })
    ));

    // nothing that made it into the queue is lost
    assert!(summary.records_enqueued < 40);
    assert_eq!(summary.records_written, summary.records_enqueued);
    assert_eq!(memory.len(), summary.records_enqueued);
}

/// Holds the writer on its first batch only.
struct StallOnce {
    inner: MemorySink,
    stall: Option<Duration>,
}

impl RecordSink for StallOnce {
    fn write_batch(
        &mut self,
        batch: Vec<HarvestedRecord>,
        policy: WritePolicy,
    ) -> Result<Vec<FailedRecord>, SinkError> {
        if let Some(stall) = self.stall.take() {
            thread::sleep(stall);
        }
        self.inner.write_batch(batch, policy)
    }

    fn finish(&mut self) -> Result<usize, SinkError> {
        self.inner.finish()
    }
}

type Timeline = Arc<Mutex<Vec<(NotificationType, Instant, HarvestNotification)>>>;

fn timeline() -> (Timeline, Arc<dyn HarvestObserver>) {
    let log: Timeline = Arc::default();
    let sink = log.clone();
    let observer: Arc<dyn HarvestObserver> = Arc::new(move |n: &HarvestNotification| {
        sink.lock().unwrap().push((n.kind, Instant::now(), n.clone()));
    });
    (log, observer)
}

fn at(log: &Timeline, kind: NotificationType) -> (Instant, HarvestNotification) {
    let log = log.lock().unwrap();
    let (_, when, n) = log.iter().find(|(k, _, _)| *k == kind).unwrap();
    (*when, n.clone())
}

#[test]
fn saturated_harvest_does_not_hold_up_others() {
    let offer_timeout = Duration::from_millis(50);
    let stall = Duration::from_millis(1000);
    let transport = Arc::new(MockTransport::new());
    transport
        .reply("http://big.example/oai", list_records(&records("big", 200), None))
        .reply_after(
            "http://small.example/oai",
            Duration::from_millis(1300),
            list_records(&records("small", 3), None),
        );

    let agent = HarvestAgent::builder(transport)
        .config(AgentConfig {
            queue_capacity: 2,
            batch_size: 1,
            offer_timeout,
            poll_timeout: Duration::from_millis(10),
            workers: 2,
            ..AgentConfig::default()
        })
        .build()
        .unwrap();
    let (big, big_observer) = timeline();
    let (small, small_observer) = timeline();
    agent
        .add_harvest(params("http://big.example/oai"), vec![big_observer])
        .unwrap();
    agent
        .add_harvest(params("http://small.example/oai"), vec![small_observer])
        .unwrap();

    let memory = MemorySink::new();
    let mut sink = StallOnce {
        inner: memory.clone(),
        stall: Some(stall),
    };
    let summary = agent.start(&mut sink).unwrap();

    // the saturated harvest gives up after one offer timeout, not when the
    // writer comes back
    let (received, _) = at(&big, NotificationType::ResponseReceived);
    let (ended_at, ended) = at(&big, NotificationType::Ended);
    assert!(ended.interrupted);
    assert!(matches!(
        ended.cause.as_deref(),
        Some(HarvestError::Capacity { .. })
    ));
    let waited = ended_at - received;
    assert!(waited >= offer_timeout, "ended after {waited:?}");
    assert!(waited < stall / 2, "ended after {waited:?}");

    let (_, small_ended) = at(&small, NotificationType::Ended);
    assert!(small_ended.cause.is_none());
    assert!(!small_ended.interrupted);
    assert_eq!(small_ended.stats.records, 3);
    let small_written = memory
        .records()
        .into_iter()
        .filter(|r| r.identifier.starts_with("oai:small:"))
        .count();
    assert_eq!(small_written, 3);
    assert_eq!(summary.records_written, summary.records_enqueued);
}

#[test]
fn stop_with_full_queue_is_not_a_capacity_failure() {
    let transport = Arc::new(MockTransport::new());
    transport.reply("http://q.example/oai", list_records(&records("q", 20), None));

    let agent = Arc::new(
        HarvestAgent::builder(transport)
            .config(AgentConfig {
                queue_capacity: 1,
                batch_size: 100,
                offer_timeout: Duration::from_millis(30),
                poll_timeout: Duration::from_millis(10),
                ..AgentConfig::default()
            })
            .build()
            .unwrap(),
    );
    let (ended, log_observer) = ended_log();
    let stopper: Arc<dyn HarvestObserver> = {
        let agent = agent.clone();
        Arc::new(move |n: &HarvestNotification| {
            if n.kind == NotificationType::ResponseReceived {
                agent.stop();
            }
        })
    };
    agent
        .add_harvest(params("http://q.example/oai"), vec![stopper, log_observer])
        .unwrap();

    let mut sink = MemorySink::new();
    let summary = agent.start(&mut sink).unwrap();

    let ended = ended.lock().unwrap();
    assert_eq!(ended.len(), 1);
    assert!(ended[0].explicitly_stopped);
    assert!(!ended[0].interrupted);
    assert!(ended[0].cause.is_none());
    assert_eq!(ended[0].stats.records, 20);

    assert!(summary.records_dropped >= 1);
    assert_eq!(summary.records_enqueued + summary.records_dropped, 20);
    assert_eq!(summary.records_written, summary.records_enqueued);
    assert_eq!(sink.len(), summary.records_enqueued);
}

#[test]
fn sink_failure_does_not_stop_writer() {
    let transport = Arc::new(MockTransport::new());
    transport.reply("http://f.example/oai", list_records(&records("f", 10), None));

    let listener = Arc::new(Counting::default());
    let agent = HarvestAgent::builder(transport)
        .config(AgentConfig {
            batch_size: 4,
            ..AgentConfig::default()
        })
        .listener(listener.clone())
        .build()
        .unwrap();
    agent.add_harvest(params("http://f.example/oai"), Vec::new()).unwrap();

    let mut sink = MemorySink::new();
    sink.fail_next_batches(1);
    let summary = agent.start(&mut sink).unwrap();

    assert_eq!(sink.batch_sizes(), [4, 4, 2]);
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.failed_batches, 1);
    assert_eq!(summary.records_written, 6);
    assert_eq!(sink.len(), 6);
    assert_eq!(*listener.failed_batches.lock().unwrap(), 1);
    assert_eq!(listener.written.lock().unwrap().len(), 2);
}

#[test]
fn rejected_records_are_reported_individually() {
    let transport = Arc::new(MockTransport::new());
    let dup = vec![
        TestRecord::new("oai:d:1", "2015-01-01"),
        TestRecord::new("oai:d:2", "2015-01-01"),
        TestRecord::new("oai:d:1", "2015-01-02"),
    ];
    transport.reply("http://d.example/oai", list_records(&dup, None));

    let listener = Arc::new(Counting::default());
    let agent = HarvestAgent::builder(transport)
        .config(AgentConfig {
            write_policy: WritePolicy::RejectDuplicates,
            ..AgentConfig::default()
        })
        .listener(listener.clone())
        .build()
        .unwrap();
    agent.add_harvest(params("http://d.example/oai"), Vec::new()).unwrap();

    let mut sink = MemorySink::new();
    let summary = agent.start(&mut sink).unwrap();
    assert_eq!(summary.records_written, 2);
    assert_eq!(summary.records_rejected, 1);
    assert_eq!(summary.failed_batches, 0);
    assert_eq!(*listener.failed_records.lock().unwrap(), 1);
}

#[test]
fn stop_ends_every_harvest() {
    let transport = Arc::new(MockTransport::new());
    transport
        .reply("http://s.example/oai", list_records(&three_records(), Some("more")))
        .reply("http://s.example/oai", list_records(&three_records(), None));

    let agent = Arc::new(
        HarvestAgent::builder(transport.clone())
            .config(AgentConfig {
                batch_size: 100,
                ..AgentConfig::default()
            })
            .build()
            .unwrap(),
    );
    let (ended, log_observer) = ended_log();
    let stopper: Arc<dyn HarvestObserver> = {
        let agent = agent.clone();
        Arc::new(move |n: &HarvestNotification| {
            if n.kind == NotificationType::ResponseProcessed {
                agent.stop();
            }
        })
    };
    agent
        .add_harvest(params("http://s.example/oai"), vec![stopper, log_observer])
        .unwrap();

    let mut sink = MemorySink::new();
    let summary = agent.start(&mut sink).unwrap();

    assert!(agent.is_stopped());
    let ended = ended.lock().unwrap();
    assert_eq!(ended.len(), 1);
    assert!(ended[0].explicitly_stopped);
    assert!(ended[0].cause.is_none());
    assert_eq!(transport.pending(), 1);

    // the partial batch is flushed once on the way out
    assert_eq!(summary.records_enqueued, 3);
    assert_eq!(sink.batch_sizes(), [3]);
    assert_eq!(sink.len(), 3);
}

#[test]
fn parquet_sink_end_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::new());
    transport.reply("http://p.example/oai", list_records(&three_records(), None));

    let agent = HarvestAgent::builder(transport).build().unwrap();
    agent.add_harvest(params("http://p.example/oai"), Vec::new()).unwrap();

    let mut sink = ParquetRecordSink::new(dir.path(), "records", 3).unwrap();
    let summary = agent.start(&mut sink).unwrap();
    assert_eq!(summary.records_written, 3);

    let file = std::fs::File::open(dir.path().join("records.parquet")).unwrap();
    let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap();
    let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
    assert_eq!(rows, 3);
}
