mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use patpat::checker::ExcludedSource;
use patpat::domain::TaskId;
use patpat::error::PatpatError;
use patpat::hub::{AggregatedResult, HubState, MapperHub, SourceReport};
use patpat::mapper::{Mapper, SourceError};
use patpat::store::{Store, TaskRecord};

use common::{Behavior, MockMapper, record, sample_config, temp_store};

fn mappers(list: Vec<MockMapper>) -> Vec<Arc<dyn Mapper>> {
    list.into_iter()
        .map(|mapper| Arc::new(mapper) as Arc<dyn Mapper>)
        .collect()
}

#[test]
fn duplicate_dataset_across_sources_is_dropped() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    let mut hub = MapperHub::open(
        store,
        sample_config(task),
        mappers(vec![
            MockMapper::new("first", Behavior::Records(vec![record("PRIDE", "PXD001")])),
            MockMapper::new(
                "second",
                Behavior::Records(vec![record("PRIDE", "PXD001"), record("IProX", "IPX002")]),
            ),
        ]),
    )
    .unwrap();

    hub.mapping().unwrap();
    assert_eq!(hub.state(), HubState::Aggregated);
    let keys: Vec<(&str, &str)> = hub.results().iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec![("PRIDE", "PXD001"), ("IProX", "IPX002")]);
}

#[test]
fn one_timeout_out_of_three_keeps_the_others() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    let mut hub = MapperHub::open(
        store,
        sample_config(task),
        mappers(vec![
            MockMapper::new("pride", Behavior::Records(vec![record("pride", "PXD001")])),
            MockMapper::new("iprox", Behavior::Slow(Duration::from_secs(10))),
            MockMapper::new("massive", Behavior::Records(vec![record("massive", "MSV000001")])),
        ]),
    )
    .unwrap()
    .with_timeout(Duration::from_millis(200));

    let start = Instant::now();
    hub.mapping().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    assert_eq!(hub.state(), HubState::Aggregated);
    assert_eq!(hub.results().len(), 2);
    let statuses: Vec<(&str, &str)> = hub
        .statuses()
        .iter()
        .map(|s| (s.source.as_str(), s.status.as_str()))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("pride", "succeeded"),
            ("iprox", "failed:timeout"),
            ("massive", "succeeded"),
        ]
    );
}

#[test]
fn mapper_ignoring_its_deadline_is_timed_out_by_the_hub() {
    let (_temp, store) = temp_store();
    let mut hub = MapperHub::open(
        store,
        sample_config(TaskId::generate()),
        mappers(vec![
            MockMapper::new("stuck", Behavior::Hang(Duration::from_secs(30))),
            MockMapper::new("pride", Behavior::Records(vec![record("pride", "PXD001")])),
        ]),
    )
    .unwrap()
    .with_timeout(Duration::from_millis(150));

    let start = Instant::now();
    hub.mapping().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(hub.statuses()[0].status, "failed:timeout");
    assert_eq!(hub.results().len(), 1);
}

#[test]
fn every_source_failing_ends_in_failed_and_exports_marker() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    let mut hub = MapperHub::open(
        store,
        sample_config(task),
        mappers(vec![
            MockMapper::new(
                "pride",
                Behavior::Fail(SourceError::Unavailable("503".to_string())),
            ),
            MockMapper::new("iprox", Behavior::Fail(SourceError::Protocol("bad json".to_string()))),
        ]),
    )
    .unwrap();

    assert_matches!(hub.mapping(), Err(PatpatError::AllSourcesFailed { task: failed }) if failed == task);
    assert_eq!(hub.state(), HubState::Failed);

    let dir = hub.export().unwrap();
    assert_eq!(hub.state(), HubState::Failed);
    let result: AggregatedResult = Store::read_json(&dir.join("result.json")).unwrap();
    assert!(result.all_failed);
    assert!(result.records.is_empty());
    let statuses: Vec<SourceReport> = Store::read_json(&dir.join("status.json")).unwrap();
    assert_eq!(statuses[0].status, "failed:unavailable");
    assert_eq!(statuses[1].status, "failed:protocol");
}

#[test]
fn panicking_mapper_is_recorded_as_protocol_failure() {
    let (_temp, store) = temp_store();
    let mut hub = MapperHub::open(
        store,
        sample_config(TaskId::generate()),
        mappers(vec![
            MockMapper::new("broken", Behavior::Panic),
            MockMapper::new("pride", Behavior::Records(vec![record("pride", "PXD001")])),
        ]),
    )
    .unwrap();

    hub.mapping().unwrap();
    assert_eq!(hub.statuses()[0].status, "failed:protocol");
    assert!(hub.statuses()[0]
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("mock mapper exploded"));
}

#[test]
fn export_is_idempotent() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    let mut hub = MapperHub::open(
        store,
        sample_config(task),
        mappers(vec![MockMapper::new(
            "pride",
            Behavior::Records(vec![record("pride", "PXD001"), record("pride", "PXD002")]),
        )]),
    )
    .unwrap();
    hub.mapping().unwrap();

    let dir = hub.export().unwrap();
    assert_eq!(hub.state(), HubState::Exported);
    let names = ["result.json", "config.json", "status.json", "result.tsv", "task.json"];
    let first: Vec<Vec<u8>> = names
        .iter()
        .map(|name| std::fs::read(dir.join(name).as_std_path()).unwrap())
        .collect();

    let again = hub.export().unwrap();
    assert_eq!(dir, again);
    let second: Vec<Vec<u8>> = names
        .iter()
        .map(|name| std::fs::read(dir.join(name).as_std_path()).unwrap())
        .collect();
    assert_eq!(first, second);

    let tsv = std::fs::read_to_string(dir.join("result.tsv").as_std_path()).unwrap();
    assert_eq!(tsv.lines().next(), Some("title\tsummary\twebsite"));
    assert_eq!(tsv.lines().count(), 3);
    let record: TaskRecord = Store::read_json(&dir.join("task.json")).unwrap();
    assert_eq!(record.state, "exported");
    assert!(record.finished_at.is_some());
}

#[test]
fn repeated_runs_aggregate_identically() {
    let (_temp, store) = temp_store();
    let run = |store: Store| {
        let task: TaskId = "6f1c1bd4-3f0e-4a43-9d51-4b8e0a6cfb10".parse().unwrap();
        let slow_first = MockMapper::new(
            "slow",
            Behavior::Records(vec![record("slow", "PXD010"), record("slow", "PXD003")]),
        );
        let mut hub = MapperHub::open(
            store,
            sample_config(task),
            mappers(vec![
                slow_first,
                MockMapper::new("fast", Behavior::Records(vec![record("fast", "IPX001")])),
            ]),
        )
        .unwrap();
        hub.mapping().unwrap();
        let dir = hub.export().unwrap();
        let bytes = std::fs::read(dir.join("result.json").as_std_path()).unwrap();
        std::fs::remove_file(dir.join("result.json").as_std_path()).unwrap();
        bytes
    };
    let first = run(store.clone());
    let second = run(store);
    assert_eq!(first, second);
}

#[test]
fn mapping_twice_is_rejected() {
    let (_temp, store) = temp_store();
    let mut hub = MapperHub::open(
        store,
        sample_config(TaskId::generate()),
        mappers(vec![MockMapper::new("pride", Behavior::Records(Vec::new()))]),
    )
    .unwrap();
    hub.mapping().unwrap();
    assert_matches!(
        hub.mapping(),
        Err(PatpatError::InvalidState {
            expected: "created",
            actual: "aggregated"
        })
    );
}

#[test]
fn export_before_mapping_is_rejected() {
    let (_temp, store) = temp_store();
    let mut hub = MapperHub::open(
        store,
        sample_config(TaskId::generate()),
        mappers(vec![MockMapper::new("pride", Behavior::Records(Vec::new()))]),
    )
    .unwrap();
    assert_matches!(hub.export(), Err(PatpatError::InvalidState { .. }));
}

#[test]
fn empty_and_duplicate_mapper_lists() {
    let (_temp, store) = temp_store();
    assert_matches!(
        MapperHub::open(store.clone(), sample_config(TaskId::generate()), Vec::new()),
        Err(PatpatError::NoMappers)
    );

    let first = Arc::new(MockMapper::new("pride", Behavior::Records(Vec::new())));
    let second = Arc::new(MockMapper::new("pride", Behavior::Records(Vec::new())));
    let mut hub = MapperHub::open(
        store,
        sample_config(TaskId::generate()),
        vec![first.clone() as Arc<dyn Mapper>, second.clone() as Arc<dyn Mapper>],
    )
    .unwrap();
    hub.mapping().unwrap();
    assert_eq!(hub.statuses().len(), 1);
    assert_eq!(first.calls(), 1);
    assert_eq!(second.calls(), 0);
}

#[test]
fn excluded_sources_show_up_in_status() {
    let (_temp, store) = temp_store();
    let mut hub = MapperHub::open(
        store,
        sample_config(TaskId::generate()),
        mappers(vec![MockMapper::new("pride", Behavior::Records(Vec::new()))]),
    )
    .unwrap()
    .with_excluded(vec![ExcludedSource {
        name: "iprox".to_string(),
        reason: "connection refused".to_string(),
    }]);
    hub.mapping().unwrap();
    let statuses: Vec<&str> = hub.statuses().iter().map(|s| s.status.as_str()).collect();
    assert_eq!(statuses, vec!["succeeded", "excluded"]);
}

#[test]
fn task_in_use_while_hub_is_open() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    let make = || mappers(vec![MockMapper::new("pride", Behavior::Records(Vec::new()))]);
    let hub = MapperHub::open(store.clone(), sample_config(task), make()).unwrap();
    assert_matches!(
        MapperHub::open(store.clone(), sample_config(task), make()),
        Err(PatpatError::TaskInUse(busy)) if busy == task
    );
    drop(hub);
    assert!(MapperHub::open(store, sample_config(task), make()).is_ok());
}

#[test]
fn reused_task_merges_prior_results() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    {
        let mut hub = MapperHub::open(
            store.clone(),
            sample_config(task),
            mappers(vec![MockMapper::new(
                "pride",
                Behavior::Records(vec![record("pride", "PXD001")]),
            )]),
        )
        .unwrap();
        hub.mapping().unwrap();
        hub.export().unwrap();
    }

    let mut hub = MapperHub::open(
        store,
        sample_config(task),
        mappers(vec![MockMapper::new(
            "pride",
            Behavior::Records(vec![record("pride", "PXD002"), record("pride", "PXD001")]),
        )]),
    )
    .unwrap();
    hub.mapping().unwrap();
    let datasets: Vec<&str> = hub.results().iter().map(|r| r.dataset_id.as_str()).collect();
    assert_eq!(datasets, vec!["PXD001", "PXD002"]);
}

#[test]
fn cancellation_stops_mapping_promptly() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    let mut hub = MapperHub::open(
        store,
        sample_config(task),
        mappers(vec![MockMapper::new("slow", Behavior::Slow(Duration::from_secs(30)))]),
    )
    .unwrap();
    let cancel = hub.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
    });

    let start = Instant::now();
    assert_matches!(hub.mapping(), Err(PatpatError::Cancelled { task: cancelled }) if cancelled == task);
    assert!(start.elapsed() < Duration::from_secs(5));
    canceller.join().unwrap();
    assert_matches!(hub.export(), Err(PatpatError::InvalidState { .. }));
}

#[test]
fn failed_resume_keeps_earlier_records() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    {
        let mut hub = MapperHub::open(
            store.clone(),
            sample_config(task),
            mappers(vec![MockMapper::new(
                "pride",
                Behavior::Records(vec![record("pride", "PXD001")]),
            )]),
        )
        .unwrap();
        hub.mapping().unwrap();
        hub.export().unwrap();
    }

    let mut hub = MapperHub::open(
        store.clone(),
        sample_config(task),
        mappers(vec![MockMapper::new(
            "pride",
            Behavior::Fail(SourceError::Unavailable("HTTP 503".to_string())),
        )]),
    )
    .unwrap();
    assert_matches!(hub.mapping(), Err(PatpatError::AllSourcesFailed { .. }));
    let dir = hub.export().unwrap();

    let result: AggregatedResult = Store::read_json(&dir.join("result.json")).unwrap();
    assert!(result.all_failed);
    let datasets: Vec<&str> = result.records.iter().map(|r| r.dataset_id.as_str()).collect();
    assert_eq!(datasets, vec!["PXD001"]);
    let tsv = std::fs::read_to_string(dir.join("result.tsv").as_std_path()).unwrap();
    assert_eq!(tsv.lines().count(), 2);
}

#[test]
fn second_export_leaves_files_alone() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    let mut hub = MapperHub::open(
        store,
        sample_config(task),
        mappers(vec![MockMapper::new(
            "pride",
            Behavior::Records(vec![record("pride", "PXD001")]),
        )]),
    )
    .unwrap();
    hub.mapping().unwrap();
    let dir = hub.export().unwrap();

    let tsv = dir.join("result.tsv");
    std::fs::write(tsv.as_std_path(), "edited by hand\n").unwrap();
    assert_eq!(hub.export().unwrap(), dir);
    assert_eq!(
        std::fs::read_to_string(tsv.as_std_path()).unwrap(),
        "edited by hand\n"
    );
}

#[test]
fn unbounded_timeout_is_capped() {
    let (_temp, store) = temp_store();
    let task = TaskId::generate();
    let mut hub = MapperHub::open(
        store,
        sample_config(task),
        mappers(vec![MockMapper::new(
            "pride",
            Behavior::Records(vec![record("pride", "PXD001")]),
        )]),
    )
    .unwrap()
    .with_timeout(Duration::MAX);
    hub.mapping().unwrap();
    assert_eq!(hub.results().len(), 1);
}
