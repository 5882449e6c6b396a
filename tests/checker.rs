mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use patpat::checker::AvailabilityChecker;
use patpat::mapper::{Mapper, MapperContext, MapperResult, SourceError};
use patpat::resolver::QueryConfig;

use common::{Behavior, MockMapper};

/// Probe that never answers within any reasonable bound.
struct StuckProbe;

impl Mapper for StuckProbe {
    fn name(&self) -> &str {
        "stuck"
    }

    fn probe(&self, _timeout: Duration) -> Result<(), SourceError> {
        thread::sleep(Duration::from_secs(30));
        Ok(())
    }

    fn query(
        &self,
        _config: &QueryConfig,
        _ctx: &MapperContext,
    ) -> Result<Vec<MapperResult>, SourceError> {
        Ok(Vec::new())
    }
}

/// Fails its first probe, then answers.
struct Flaky {
    probes: AtomicUsize,
}

impl Mapper for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn probe(&self, _timeout: Duration) -> Result<(), SourceError> {
        if self.probes.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(SourceError::Timeout("first probe".to_string()))
        } else {
            Ok(())
        }
    }

    fn query(
        &self,
        _config: &QueryConfig,
        _ctx: &MapperContext,
    ) -> Result<Vec<MapperResult>, SourceError> {
        Ok(Vec::new())
    }
}

/// Probe that blows up instead of answering.
struct PanickingProbe;

impl Mapper for PanickingProbe {
    fn name(&self) -> &str {
        "broken"
    }

    fn probe(&self, _timeout: Duration) -> Result<(), SourceError> {
        panic!("probe client exploded");
    }

    fn query(
        &self,
        _config: &QueryConfig,
        _ctx: &MapperContext,
    ) -> Result<Vec<MapperResult>, SourceError> {
        Ok(Vec::new())
    }
}

#[test]
fn unreachable_source_is_excluded_in_order() {
    let mappers: Vec<Arc<dyn Mapper>> = vec![
        Arc::new(MockMapper::new("pride", Behavior::Records(Vec::new()))),
        Arc::new(MockMapper::unreachable("iprox")),
        Arc::new(MockMapper::new("massive", Behavior::Records(Vec::new()))),
    ];
    let availability = AvailabilityChecker::new(Duration::from_millis(100), 3).probe(&mappers);

    assert_eq!(availability.available_names(), vec!["pride", "massive"]);
    assert_eq!(availability.excluded.len(), 1);
    assert_eq!(availability.excluded[0].name, "iprox");
    assert!(availability.excluded[0].reason.contains("connection refused"));
}

#[test]
fn retries_before_excluding() {
    let flaky = Arc::new(Flaky {
        probes: AtomicUsize::new(0),
    });
    let mappers: Vec<Arc<dyn Mapper>> = vec![flaky.clone()];
    let availability = AvailabilityChecker::new(Duration::from_millis(100), 3).probe(&mappers);
    assert_eq!(availability.available_names(), vec!["flaky"]);
    assert_eq!(flaky.probes.load(Ordering::SeqCst), 2);
}

#[test]
fn hung_probe_is_bounded() {
    let mappers: Vec<Arc<dyn Mapper>> = vec![
        Arc::new(StuckProbe),
        Arc::new(MockMapper::new("pride", Behavior::Records(Vec::new()))),
    ];
    let start = Instant::now();
    let availability = AvailabilityChecker::new(Duration::from_millis(100), 1).probe(&mappers);

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(availability.available_names(), vec!["pride"]);
    assert_eq!(availability.excluded[0].name, "stuck");
    assert_eq!(availability.excluded[0].reason, "probe timed out");
}

#[test]
fn panicking_probe_is_reported_as_such() {
    let mappers: Vec<Arc<dyn Mapper>> = vec![
        Arc::new(PanickingProbe),
        Arc::new(MockMapper::new("pride", Behavior::Records(Vec::new()))),
    ];
    let started = Instant::now();
    let availability = AvailabilityChecker::new(Duration::from_secs(5), 3).probe(&mappers);

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(availability.available_names(), vec!["pride"]);
    assert_eq!(availability.excluded[0].name, "broken");
    assert!(availability.excluded[0].reason.contains("panicked"));
    assert!(availability.excluded[0].reason.contains("probe client exploded"));
}

#[test]
fn oversized_probe_budget_does_not_overflow() {
    let mappers: Vec<Arc<dyn Mapper>> =
        vec![Arc::new(MockMapper::new("pride", Behavior::Records(Vec::new())))];
    let availability = AvailabilityChecker::new(Duration::MAX, u32::MAX).probe(&mappers);
    assert_eq!(availability.available_names(), vec!["pride"]);
}
