//! Job creation, status tracking and completion through the manager.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use oaiharvest_agent::{AgentConfig, MemorySink, RecordSink};
use oaiharvest_harvester::testing::{
    MockTransport, TestRecord, error_response, list_records, three_records,
};
use oaiharvest_harvester::{HarvestNotification, HarvestParameters, Verb};
use oaiharvest_job::{
    InMemoryRepository, JobCreationError, JobManager, JobNotification, JobNotificationType,
    JobObserver, Repository,
};

const A: &str = "http://a.example/oai";
const B: &str = "http://b.example/oai";
const WAIT: Duration = Duration::from_secs(10);

fn params(base: &str) -> HarvestParameters {
    HarvestParameters::parse(base, Verb::ListRecords).unwrap()
}

fn repository(name: &str, base: &str) -> Repository {
    Repository {
        base_uri: base.to_string(),
        name: name.to_string(),
        institution: format!("{name} University"),
    }
}

fn new_manager(transport: &Arc<MockTransport>, sink: &MemorySink) -> JobManager {
    let sink = sink.clone();
    JobManager::new(
        transport.clone(),
        Arc::new(InMemoryRepository::new(vec![
            repository("A", A),
            repository("B", B),
        ])),
        Box::new(move |_: &str| Ok(Box::new(sink.clone()) as Box<dyn RecordSink>)),
    )
}

#[derive(Default)]
struct Recorder {
    ended: Mutex<Vec<(u64, HarvestNotification)>>,
    job: Mutex<Vec<JobNotification>>,
}

impl JobObserver for Recorder {
    fn on_harvest_notification(&self, harvest_id: u64, notification: &HarvestNotification) {
        if notification.is_ended() {
            self.ended
                .lock()
                .unwrap()
                .push((harvest_id, notification.clone()));
        }
    }

    fn on_job_notification(&self, notification: &JobNotification) {
        self.job.lock().unwrap().push(notification.clone());
    }
}

#[test]
fn invalid_base_uri_aborts_creation() {
    let transport = Arc::new(MockTransport::new());
    let manager = new_manager(&transport, &MemorySink::new());

    let err = manager
        .new_job(vec![
            params(A),
            params("http://unknown.example/oai"),
            params(B),
        ])
        .unwrap_err();
    match err {
        JobCreationError::InvalidBaseUris(uris) => {
            assert_eq!(uris, ["http://unknown.example/oai"])
        }
        other => panic!("unexpected error: {other}"),
    }

    thread::sleep(Duration::from_millis(50));
    assert!(transport.requests().is_empty());
    assert!(manager.running_status().is_empty());
}

#[test]
fn empty_job_is_rejected() {
    let transport = Arc::new(MockTransport::new());
    let manager = new_manager(&transport, &MemorySink::new());
    assert!(matches!(
        manager.new_job(Vec::new()),
        Err(JobCreationError::NoHarvests)
    ));
}

#[test]
fn completed_job_leaves_status_map() {
    let transport = Arc::new(MockTransport::new());
    let more: Vec<TestRecord> = (0..4)
        .map(|i| TestRecord::new(format!("oai:b:{i}"), "2016-01-01"))
        .collect();
    transport
        .reply_after(A, Duration::from_millis(200), list_records(&three_records(), None))
        .reply(B, list_records(&more, None));

    let sink = MemorySink::new();
    let recorder = Arc::new(Recorder::default());
    let manager = new_manager(&transport, &sink).with_observer(recorder.clone());

    let name = manager.new_job(vec![params(A), params(B)]).unwrap();
    let status = manager.status(&name).expect("status while running");
    assert_eq!(status.harvests.len(), 2);
    assert!(manager.job(&name).is_some());

    let outcome = manager.wait(&name, WAIT).expect("job finished");
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.records_written, 7);
    assert!(outcome.error.is_none());
    assert!(outcome.failed_harvests.is_empty());
    assert_eq!(sink.len(), 7);

    assert!(manager.status(&name).is_none());
    assert!(manager.job(&name).is_none());
    assert_eq!(manager.max_queue_size(), 0);

    let job = recorder.job.lock().unwrap();
    assert_eq!(job.first().unwrap().kind, JobNotificationType::Started);
    assert_eq!(job.last().unwrap().kind, JobNotificationType::Stopped);
    assert_eq!(recorder.ended.lock().unwrap().len(), 2);
}

#[test]
fn stop_mid_job_ends_every_harvest() {
    let transport = Arc::new(MockTransport::new());
    for base in [A, B] {
        transport
            .reply_after(
                base,
                Duration::from_millis(300),
                list_records(&three_records(), Some("page2")),
            )
            .reply(base, list_records(&three_records(), None));
    }

    let recorder = Arc::new(Recorder::default());
    let manager = new_manager(&transport, &MemorySink::new()).with_observer(recorder.clone());
    let name = manager.new_job(vec![params(A), params(B)]).unwrap();

    thread::sleep(Duration::from_millis(100));
    assert!(manager.running_status().contains_key(&name));
    assert!(manager.stop_job(&name));

    let outcome = manager.wait(&name, WAIT).expect("job finished");
    assert!(outcome.summary.is_some());

    let ended = recorder.ended.lock().unwrap();
    assert_eq!(ended.len(), 2);
    assert!(ended.iter().all(|(_, n)| n.explicitly_stopped));
    assert!(transport.pending() >= 2);
    assert!(manager.status(&name).is_none());
    assert!(!manager.stop_job(&name));
}

#[test]
fn running_status_is_sorted_by_job_name() {
    let transport = Arc::new(MockTransport::new());
    for _ in 0..2 {
        transport.reply_after(A, Duration::from_millis(300), list_records(&[], None));
    }
    let manager = new_manager(&transport, &MemorySink::new());

    let first = manager.new_job(vec![params(A)]).unwrap();
    let second = manager.new_job(vec![params(A)]).unwrap();
    let names: Vec<String> = manager.running_status().into_keys().collect();
    let mut sorted = vec![first.clone(), second.clone()];
    sorted.sort();
    assert_eq!(names, sorted);

    manager.stop_all();
    assert!(manager.wait(&first, WAIT).is_some());
    assert!(manager.wait(&second, WAIT).is_some());
    assert!(manager.running_status().is_empty());
}

#[test]
fn protocol_failures_are_recorded() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(A, error_response("badArgument", "bad from date"));

    let failures: Arc<Mutex<Vec<HarvestNotification>>> = Arc::default();
    let seen = failures.clone();
    let manager = new_manager(&transport, &MemorySink::new()).with_failure_listener(Box::new(
        move |n: &HarvestNotification| seen.lock().unwrap().push(n.clone()),
    ));

    let name = manager.new_job(vec![params(A)]).unwrap();
    let outcome = manager.wait(&name, WAIT).expect("job finished");

    assert_eq!(outcome.failed_harvests.len(), 1);
    assert_eq!(failures.lock().unwrap().len(), 1);

    assert!(manager.status(&name).is_none());

    let errors = manager.repository().protocol_errors(1).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, "badArgument");
}

#[test]
fn wait_times_out_on_running_job() {
    let transport = Arc::new(MockTransport::new());
    transport.reply_after(A, Duration::from_millis(500), list_records(&[], None));
    let manager = new_manager(&transport, &MemorySink::new());

    let name = manager.new_job(vec![params(A)]).unwrap();
    assert!(manager.wait(&name, Duration::from_millis(50)).is_none());
    assert!(manager.wait(&name, WAIT).is_some());
}

#[test]
fn unclaimed_outcome_expires() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(A, list_records(&three_records(), None));
    let manager = new_manager(&transport, &MemorySink::new())
        .with_outcome_retention(Duration::from_millis(50));

    // completion is learned from the status lookup alone
    let name = manager.new_job(vec![params(A)]).unwrap();
    let started = std::time::Instant::now();
    while manager.status(&name).is_some() {
        assert!(started.elapsed() < WAIT, "job never stopped");
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(200));

    assert_eq!(manager.retained_outcomes(), 0);
    assert!(manager.wait(&name, Duration::ZERO).is_none());
}

#[test]
fn outcome_is_claimed_once() {
    let transport = Arc::new(MockTransport::new());
    transport.reply(A, list_records(&three_records(), None));
    let manager = new_manager(&transport, &MemorySink::new());

    let name = manager.new_job(vec![params(A)]).unwrap();
    assert!(manager.wait(&name, WAIT).is_some());
    assert_eq!(manager.retained_outcomes(), 0);
    assert!(manager.wait(&name, Duration::ZERO).is_none());
}

#[test]
fn status_reports_queue_peak_before_any_full_batch() {
    let transport = Arc::new(MockTransport::new());
    transport
        .reply(A, list_records(&three_records(), None))
        .reply_after(B, Duration::from_millis(600), list_records(&[], None));
    let manager = new_manager(&transport, &MemorySink::new()).with_agent_config(AgentConfig {
        batch_size: 100,
        ..AgentConfig::default()
    });

    let name = manager.new_job(vec![params(A), params(B)]).unwrap();
    thread::sleep(Duration::from_millis(200));

    let status = manager.status(&name).expect("status while running");
    assert!(status.max_queue_size >= 1);
    assert!(manager.max_queue_size() >= 1);
    assert!(manager.wait(&name, WAIT).is_some());
}
