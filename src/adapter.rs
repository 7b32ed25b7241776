//! Ownership of the single BLE radio handle.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> Destroyed
//!                       |
//!                       +-> Uninitialized (failure)
//! ```
//!
//! Concurrent [`AdapterLifecycle::initialize`] calls share one in-flight
//! construction. Consecutive failures are capped; once the cap is reached
//! every call is rejected without touching the factory until
//! [`AdapterLifecycle::reset`].

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::common::defaults;
use crate::retry::{BoundedRetry, RetryDecision, RetryPolicy};
use crate::transport::{AdapterFactory, BleAdapter};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Uninitialized,
    Initializing,
    Ready,
    Destroyed,
}

/// Cloneable reference to the live radio.
#[derive(Clone)]
pub struct AdapterHandle {
    generation: u64,
    adapter: Arc<dyn BleAdapter>,
}

impl AdapterHandle {
    /// Increases every time a new radio is constructed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn same_radio(&self, other: &AdapterHandle) -> bool {
        Arc::ptr_eq(&self.adapter, &other.adapter)
    }
}

impl Deref for AdapterHandle {
    type Target = dyn BleAdapter;

    fn deref(&self) -> &Self::Target {
        self.adapter.as_ref()
    }
}

impl fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

type InitFlight = Shared<BoxFuture<'static, Result<AdapterHandle>>>;

struct Inner {
    state: AdapterState,
    handle: Option<AdapterHandle>,
    in_flight: Option<InitFlight>,
    retry: BoundedRetry,
    generation: u64,
}

pub struct AdapterLifecycle {
    factory: Arc<dyn AdapterFactory>,
    settle: Duration,
    inner: Arc<Mutex<Inner>>,
    /// Serializes construction and teardown.
    sequence: Arc<tokio::sync::Mutex<()>>,
}

impl AdapterLifecycle {
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            factory,
            settle: defaults::ADAPTER_SETTLE,
            inner: Arc::new(Mutex::new(Inner {
                state: AdapterState::Uninitialized,
                handle: None,
                in_flight: None,
                retry: BoundedRetry::new(RetryPolicy::new(
                    defaults::MAX_ADAPTER_ATTEMPTS,
                    defaults::RETRY_BACKOFF,
                )),
                generation: 0,
            })),
            sequence: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Time given to a freshly constructed radio before it is reported ready.
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        self.inner.lock().unwrap().retry = BoundedRetry::new(policy);
        self
    }

    pub fn state(&self) -> AdapterState {
        self.inner.lock().unwrap().state
    }

    /// The live handle, if the radio is ready.
    pub fn handle(&self) -> Option<AdapterHandle> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            AdapterState::Ready => inner.handle.clone(),
            _ => None,
        }
    }

    /// Consecutive failed initializations.
    pub fn failures(&self) -> u32 {
        self.inner.lock().unwrap().retry.failures()
    }

    pub fn is_exhausted(&self) -> bool {
        self.inner.lock().unwrap().retry.is_exhausted()
    }

    /// Constructs a new radio, destroying the previous one first.
    ///
    /// Joins the in-flight initialization when there is one.
    pub async fn initialize(&self) -> Result<AdapterHandle> {
        let flight = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(flight) = inner.in_flight.clone() {
                log::debug!("Adapter initialization already in progress, waiting for it");
                flight
            } else if inner.retry.is_exhausted() {
                log::error!(
                    "Too many failed adapter initializations ({}), not retrying",
                    inner.retry.failures()
                );
                return Err(Error::AdapterUnavailable {
                    attempts: inner.retry.failures(),
                });
            } else {
                inner.state = AdapterState::Initializing;
                inner.generation += 1;

                let flight = construct(
                    self.factory.clone(),
                    self.inner.clone(),
                    self.sequence.clone(),
                    self.settle,
                    inner.generation,
                )
                .boxed()
                .shared();

                inner.in_flight = Some(flight.clone());
                flight
            }
        };

        flight.await
    }

    /// Destroys the radio. Safe to call any number of times, and before
    /// initialization ever completed.
    pub async fn teardown(&self) {
        let flight = self.inner.lock().unwrap().in_flight.clone();
        if let Some(flight) = flight {
            log::debug!("Waiting for adapter initialization before teardown");
            flight.await.ok();
        }

        let _sequence = self.sequence.lock().await;

        let handle = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = AdapterState::Destroyed;
            inner.handle.take()
        };

        if let Some(handle) = handle {
            log::info!("Destroying BLE adapter (generation {})", handle.generation);
            handle.stop_scan().await.ok();
            handle.destroy().await;
        }
    }

    /// Forgets past failures so initialization may be attempted again.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.retry.reset();
        if inner.state == AdapterState::Destroyed {
            inner.state = AdapterState::Uninitialized;
        }
    }
}

async fn construct(
    factory: Arc<dyn AdapterFactory>,
    inner: Arc<Mutex<Inner>>,
    sequence: Arc<tokio::sync::Mutex<()>>,
    settle: Duration,
    generation: u64,
) -> Result<AdapterHandle> {
    let _sequence = sequence.lock().await;

    let (previous, attempt) = {
        let mut inner = inner.lock().unwrap();
        (inner.handle.take(), inner.retry.failures() + 1)
    };

    if let Some(previous) = previous {
        log::info!("Destroying previous BLE adapter (generation {})", previous.generation);
        previous.destroy().await;
    }

    log::info!("Initializing BLE adapter, attempt {}", attempt);

    let created = factory.create().await;

    if created.is_ok() && !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }

    let mut inner = inner.lock().unwrap();
    inner.in_flight = None;

    match created {
        Ok(adapter) => {
            let handle = AdapterHandle {
                generation,
                adapter,
            };
            inner.handle = Some(handle.clone());
            inner.state = AdapterState::Ready;
            inner.retry.record_success();

            log::info!("BLE adapter ready (generation {})", generation);
            Ok(handle)
        }
        Err(e) => {
            inner.state = AdapterState::Uninitialized;

            match inner.retry.record_failure() {
                RetryDecision::RetryAfter(_) => {
                    log::warn!("BLE adapter initialization failed: {}", e)
                }
                RetryDecision::Exhausted => log::error!(
                    "BLE adapter initialization failed {} times, giving up: {}",
                    inner.retry.failures(),
                    e
                ),
            }

            Err(Error::AdapterInitFailure(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn lifecycle(transport: &MockTransport) -> AdapterLifecycle {
        AdapterLifecycle::new(Arc::new(transport.clone())).with_settle_delay(Duration::ZERO)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_initialize_constructs_once() {
        let transport = MockTransport::new();
        transport.set_create_delay(Duration::from_millis(500));
        let lifecycle = lifecycle(&transport);

        let results = futures::future::join_all((0..8).map(|_| lifecycle.initialize())).await;

        assert_eq!(transport.creations(), 1);
        let handles: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(handles.iter().all(|h| h.same_radio(&handles[0])));
        assert!(handles.iter().all(|h| h.generation() == 1));
        assert_eq!(lifecycle.state(), AdapterState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_attempt_rejected_without_construction() {
        let transport = MockTransport::new();
        transport.fail_next_creations(10);
        let lifecycle = lifecycle(&transport);

        for _ in 0..3 {
            let err = lifecycle.initialize().await.unwrap_err();
            assert!(matches!(err, Error::AdapterInitFailure(_)));
        }
        assert_eq!(transport.creations(), 3);
        assert!(lifecycle.is_exhausted());

        let err = lifecycle.initialize().await.unwrap_err();
        assert!(matches!(err, Error::AdapterUnavailable { attempts: 3 }));
        assert!(err.is_adapter_init_failure());
        assert_eq!(transport.creations(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let transport = MockTransport::new();
        transport.fail_next_creations(2);
        let lifecycle = lifecycle(&transport);

        assert!(lifecycle.initialize().await.is_err());
        assert!(lifecycle.initialize().await.is_err());
        assert_eq!(lifecycle.failures(), 2);

        assert!(lifecycle.initialize().await.is_ok());
        assert_eq!(lifecycle.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinitialize_destroys_previous_handle() {
        let transport = MockTransport::new();
        let lifecycle = lifecycle(&transport);

        let first = lifecycle.initialize().await.unwrap();
        let second = lifecycle.initialize().await.unwrap();

        assert!(!first.same_radio(&second));
        assert_eq!(second.generation(), 2);
        assert_eq!(transport.creations(), 2);
        assert_eq!(transport.destroyed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_idempotent() {
        let transport = MockTransport::new();
        let lifecycle = lifecycle(&transport);

        // Never initialized.
        lifecycle.teardown().await;
        assert_eq!(lifecycle.state(), AdapterState::Destroyed);

        lifecycle.initialize().await.unwrap();
        lifecycle.teardown().await;
        lifecycle.teardown().await;

        assert_eq!(transport.destroyed(), 1);
        assert!(lifecycle.handle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_waits_for_in_flight_initialize() {
        let transport = MockTransport::new();
        transport.set_create_delay(Duration::from_secs(1));
        let lifecycle = Arc::new(lifecycle(&transport));

        let init = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.initialize().await }
        });
        tokio::task::yield_now().await;

        lifecycle.teardown().await;

        assert!(init.await.unwrap().is_ok());
        assert_eq!(transport.creations(), 1);
        assert_eq!(transport.destroyed(), 1);
        assert_eq!(lifecycle.state(), AdapterState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_allows_new_attempts() {
        let transport = MockTransport::new();
        transport.fail_next_creations(3);
        let lifecycle = lifecycle(&transport);

        for _ in 0..3 {
            lifecycle.initialize().await.ok();
        }
        assert!(lifecycle.initialize().await.is_err());

        lifecycle.reset();
        assert!(lifecycle.initialize().await.is_ok());
        assert_eq!(transport.creations(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_applies() {
        let transport = MockTransport::new();
        let lifecycle = AdapterLifecycle::new(Arc::new(transport.clone()))
            .with_settle_delay(Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        lifecycle.initialize().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
