//! Resolving the registry's data endpoint.
use std::time::Duration;

use snafu::prelude::*;

use crate::{
    capability::{CapabilityError, EndpointKind, IotCapability},
    observe::{Event, Observer},
};

/// Default pause between describe attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum ResolveError {
    #[snafu(display("Gave up describing the {kind} endpoint after {attempts} attempt(s): {source}"))]
    Exhausted {
        kind: EndpointKind,
        attempts: u32,
        source: CapabilityError,
    },
}

/// Polls `describe_endpoint` until it answers.
///
/// By default there is no attempt ceiling: the resolver runs after resources
/// have been created and a flaky describe call must not strand them. Set
/// [`EndpointResolver::with_max_attempts`] to bound it.
pub struct EndpointResolver<'a> {
    observer: &'a dyn Observer,
    interval: Duration,
    max_attempts: Option<u32>,
}

impl<'a> EndpointResolver<'a> {
    pub fn new(observer: &'a dyn Observer) -> Self {
        Self {
            observer,
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// `None` retries forever.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub async fn resolve<C: IotCapability>(
        &self,
        iot: &C,
        kind: EndpointKind,
    ) -> Result<String, ResolveError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match iot.describe_endpoint(kind).await {
                Ok(address) => {
                    self.observer.observe(&Event::EndpointResolved {
                        kind,
                        attempts: attempt,
                    });
                    return Ok(address);
                }
                Err(error) => {
                    self.observer.observe(&Event::EndpointAttemptFailed {
                        kind,
                        attempt,
                        error: &error,
                    });
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(error).context(ExhaustedSnafu {
                            kind,
                            attempts: attempt,
                        });
                    }
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
