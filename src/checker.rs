use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::Settings;
use crate::mapper::{MAX_CALL_TIMEOUT, Mapper, SourceError, panic_detail};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedSource {
    pub name: String,
    pub reason: String,
}

/// Outcome of one probe round. Both lists keep registration order.
#[derive(Clone)]
pub struct Availability {
    pub available: Vec<Arc<dyn Mapper>>,
    pub excluded: Vec<ExcludedSource>,
}

impl Availability {
    pub fn available_names(&self) -> Vec<String> {
        self.available.iter().map(|m| m.name().to_string()).collect()
    }
}

/// Advisory reachability check. Nothing is cached between calls, so every
/// run probes again.
#[derive(Debug, Clone, Copy)]
pub struct AvailabilityChecker {
    timeout: Duration,
    attempts: u32,
}

impl AvailabilityChecker {
    pub fn new(timeout: Duration, attempts: u32) -> Self {
        Self {
            timeout,
            attempts: attempts.max(1),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.probe_timeout, settings.probe_attempts)
    }

    pub fn probe(&self, mappers: &[Arc<dyn Mapper>]) -> Availability {
        let (tx, rx) = mpsc::channel();
        for (index, mapper) in mappers.iter().enumerate() {
            let tx = tx.clone();
            let mapper = Arc::clone(mapper);
            let timeout = self.timeout;
            let attempts = self.attempts;
            thread::spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    probe_with_attempts(mapper.as_ref(), timeout, attempts)
                }))
                .unwrap_or_else(|payload| {
                    Err(SourceError::Protocol(format!(
                        "probe panicked: {}",
                        panic_detail(&*payload)
                    )))
                });
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);

        // A probe that ignores its own timeout must not hold up the run.
        let budget = self
            .timeout
            .saturating_mul(self.attempts)
            .saturating_add(Duration::from_secs(1))
            .min(MAX_CALL_TIMEOUT);
        let deadline = Instant::now() + budget;
        let mut outcomes: Vec<Option<Result<(), SourceError>>> = vec![None; mappers.len()];
        while outcomes.iter().any(Option::is_none) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(_) => break,
            }
        }

        let mut available = Vec::new();
        let mut excluded = Vec::new();
        for (mapper, outcome) in mappers.iter().zip(outcomes) {
            match outcome {
                Some(Ok(())) => {
                    tracing::info!(source = mapper.name(), "phase=Check; source reachable");
                    available.push(Arc::clone(mapper));
                }
                Some(Err(err)) => {
                    tracing::warn!(source = mapper.name(), error = %err, "phase=Check; source excluded");
                    excluded.push(ExcludedSource {
                        name: mapper.name().to_string(),
                        reason: err.to_string(),
                    });
                }
                None => {
                    tracing::warn!(source = mapper.name(), "phase=Check; probe did not return in time");
                    excluded.push(ExcludedSource {
                        name: mapper.name().to_string(),
                        reason: "probe timed out".to_string(),
                    });
                }
            }
        }
        Availability {
            available,
            excluded,
        }
    }
}

fn probe_with_attempts(
    mapper: &dyn Mapper,
    timeout: Duration,
    attempts: u32,
) -> Result<(), SourceError> {
    let mut last = SourceError::Unavailable("not probed".to_string());
    for attempt in 1..=attempts {
        match mapper.probe(timeout) {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::debug!(source = mapper.name(), attempt, attempts, error = %err, "probe failed");
                last = err;
            }
        }
    }
    Err(last)
}
