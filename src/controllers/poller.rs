use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, instrument};

use super::{HealthError, WaitError};
use crate::store::{ObjectStore, StoreError, StoreObject};

/// Fixed polling interval and overall deadline of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl WaitConfig {
    pub const INSTALL: WaitConfig = WaitConfig {
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(60),
    };

    pub const BOOTSTRAP: WaitConfig = WaitConfig {
        interval: Duration::from_secs(5),
        timeout: Duration::from_secs(5 * 60),
    };
}

/// Outcome of a single readiness evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Done, the object is healthy.
    Ready,
    /// Keep polling; the error is reported if the wait times out.
    NotReady(HealthError),
    /// Done, the object reports a failure that polling will not fix.
    Failed(HealthError),
}

pub trait ReadinessCheck<K> {
    fn evaluate(&self, obj: &K) -> Readiness;
}

impl<K, F> ReadinessCheck<K> for F
where
    F: Fn(&K) -> Readiness,
{
    fn evaluate(&self, obj: &K) -> Readiness {
        self(obj)
    }
}

/// Re-fetch `name` every `config.interval`, starting immediately, until `check` is done.
///
/// A missing object is treated as not ready yet. Any other store error aborts the wait. When the
/// deadline passes, the last error observed is returned instead of a bare timeout.
#[instrument(skip_all, fields(object = name, kind = K::kind(&()).to_string()))]
pub async fn wait_for_object<S, K, C>(
    store: &S,
    namespace: &K::Namespace,
    name: &str,
    config: WaitConfig,
    check: C,
) -> Result<K, WaitError>
where
    S: ObjectStore,
    K: StoreObject,
    C: ReadinessCheck<K> + Send + Sync,
{
    let mut last_error = None;

    let poll = async {
        let mut ticker = interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.get::<K>(namespace, name).await {
                Ok(None) => {
                    last_error = Some(WaitError::Store(StoreError::NotFound(name.to_string())));
                }
                Err(e) if e.is_not_found() => last_error = Some(WaitError::Store(e)),
                Err(e) => return Err(WaitError::Store(e)),
                Ok(Some(obj)) => match check.evaluate(&obj) {
                    Readiness::Ready => return Ok(obj),
                    Readiness::Failed(e) => return Err(WaitError::Unhealthy(e)),
                    Readiness::NotReady(e) => {
                        debug!(reason = %e, "Object not ready yet");
                        last_error = Some(WaitError::Unhealthy(e));
                    }
                },
            }
        }
    };

    let outcome = timeout(config.timeout, poll).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(last_error.unwrap_or(WaitError::Timeout(config.timeout))),
    }
}
