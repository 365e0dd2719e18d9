//! Monitor coordinator: one poll loop per monitored device.

mod retention;

pub use retention::*;

use crate::db::{DbError, DeviceStore, EnrichedSnapshot, MonitorFlag, MonitorFlagStore, Status};
use crate::devices::DeviceChange;
use crate::driver::{DriverError, DriverRegistry};
use crate::hub::{Subscription, SubscriptionHub};
use crate::runtime::{RuntimeTimeline, TimelineError};

use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const MIN_DRIVER_TIMEOUT: Duration = Duration::from_secs(1);

/// Monitor error types.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("timeline error: {0}")]
    Timeline(#[from] TimelineError),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("device {0} not found")]
    UnknownDevice(i64),
    #[error("unknown driver: {0}")]
    UnknownDriver(String),
}

/// Why a device stops being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Paused; the persisted flag is kept as `false`.
    Temporary,
    /// The device is going away; the flag is deleted.
    Removed,
}

/// Everything a poll loop needs, shared between all loops.
struct PollContext {
    devices: Arc<dyn DeviceStore>,
    registry: Arc<DriverRegistry>,
    timeline: Arc<RuntimeTimeline>,
    snapshots: SubscriptionHub<EnrichedSnapshot>,
    poll_interval: Duration,
}

impl PollContext {
    fn driver_timeout(&self) -> Duration {
        (self.poll_interval * 5).max(MIN_DRIVER_TIMEOUT)
    }

    /// Poll the device once, feed the timeline and publish the result.
    async fn tick(&self, device_id: i64) -> Result<(), MonitorError> {
        let device = self
            .devices
            .get_device(device_id)?
            .ok_or(MonitorError::UnknownDevice(device_id))?;
        let driver = self
            .registry
            .get(&device.driver)
            .ok_or_else(|| MonitorError::UnknownDriver(device.driver.clone()))?;

        let timeout = self.driver_timeout();
        let snapshot = match tokio::time::timeout(timeout, driver.snapshot(&device)).await {
            Ok(result) => result?,
            Err(_) => return Err(DriverError::Timeout(timeout).into()),
        };

        self.timeline
            .on_status_observed(device_id, snapshot.status, snapshot.timestamp)?;
        let utilization = self
            .timeline
            .get_utilization(device_id, None, Some(snapshot.timestamp))?;

        self.snapshots
            .publish(device_id, &EnrichedSnapshot::new(snapshot, utilization));
        Ok(())
    }
}

#[derive(Default)]
struct Slot {
    task: Option<JoinHandle<()>>,
}

impl Slot {
    fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Abort the loop and wait until it is gone.
    async fn cancel(&mut self, device_id: i64) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.abort();
        match task.await {
            Err(e) if e.is_panic() => {
                tracing::error!(device_id, "Poll loop panicked: {}", e);
            }
            _ => {}
        }
        true
    }
}

/// Owns the poll loops and the snapshot hub.
pub struct MonitorCoordinator {
    ctx: Arc<PollContext>,
    flags: Arc<dyn MonitorFlagStore>,
    slots: std::sync::Mutex<HashMap<i64, Arc<Mutex<Slot>>>>,
}

impl MonitorCoordinator {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        flags: Arc<dyn MonitorFlagStore>,
        registry: Arc<DriverRegistry>,
        timeline: Arc<RuntimeTimeline>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(PollContext {
                devices,
                registry,
                timeline,
                snapshots: SubscriptionHub::new(),
                poll_interval,
            }),
            flags,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, device_id: i64) -> Arc<Mutex<Slot>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.entry(device_id).or_default().clone()
    }

    /// Persist the monitor flag and start polling if not already running.
    pub async fn start_monitor(&self, device_id: i64) -> Result<(), MonitorError> {
        let slot = self.slot(device_id);
        let mut slot = slot.lock().await;

        self.flags.upsert_flag(&MonitorFlag {
            device_id,
            is_monitoring: true,
        })?;

        if slot.is_running() {
            return Ok(());
        }

        // Whatever happened while nobody was polling counts as Offline.
        self.ctx
            .timeline
            .on_status_observed(device_id, Status::Offline, Utc::now())?;

        tracing::info!(device_id, "Starting monitor (every {:?})", self.ctx.poll_interval);
        slot.task = Some(tokio::spawn(poll_loop(self.ctx.clone(), device_id)));
        Ok(())
    }

    /// Stop polling. When this returns no further tick will run.
    ///
    /// An `Offline` observation is recorded and published with utilization 0
    /// so subscribers see the stop immediately.
    pub async fn stop_monitor(&self, device_id: i64, reason: StopReason) -> Result<(), MonitorError> {
        let slot = self.slot(device_id);
        let mut slot = slot.lock().await;

        match reason {
            StopReason::Temporary => self.flags.upsert_flag(&MonitorFlag {
                device_id,
                is_monitoring: false,
            })?,
            StopReason::Removed => self.flags.delete_flag(device_id)?,
        }

        slot.cancel(device_id).await;
        tracing::info!(device_id, ?reason, "Stopped monitor");

        let now = Utc::now();
        self.ctx.timeline.on_status_observed(device_id, Status::Offline, now)?;
        self.ctx.snapshots.publish(
            device_id,
            &EnrichedSnapshot {
                device_id,
                status: Status::Offline,
                timestamp: now,
                utilization: 0.0,
            },
        );
        Ok(())
    }

    /// Whether the persisted flag says the device should be polled.
    pub fn is_monitoring(&self, device_id: i64) -> Result<bool, MonitorError> {
        Ok(self
            .flags
            .get_flag(device_id)?
            .map(|f| f.is_monitoring)
            .unwrap_or(false))
    }

    pub fn subscribe<F>(&self, device_id: i64, handler: F) -> Subscription
    where
        F: Fn(&EnrichedSnapshot) + Send + Sync + 'static,
    {
        self.ctx.snapshots.subscribe(device_id, handler)
    }

    /// Start every device whose persisted flag is set. Returns how many were started.
    pub async fn resume(&self) -> Result<usize, MonitorError> {
        let flags = self.flags.get_flags()?;
        let mut started = 0;
        for flag in flags.into_iter().filter(|f| f.is_monitoring) {
            match self.start_monitor(flag.device_id).await {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(device_id = flag.device_id, "Failed to resume monitor: {}", e),
            }
        }
        tracing::info!("Resumed {} monitors", started);
        Ok(started)
    }

    /// Tear down the loop of a device whose history is already gone.
    async fn forget(&self, device_id: i64) {
        let slot = self.slot(device_id);
        let mut slot = slot.lock().await;
        if slot.cancel(device_id).await {
            tracing::info!(device_id, "Stopped monitor for deleted device");
        }
        if let Err(e) = self.flags.delete_flag(device_id) {
            tracing::warn!(device_id, "Failed to delete monitor flag: {}", e);
        }
    }

    /// Follow the device change bus and drop loops of deleted devices.
    pub fn spawn_device_listener(self: &Arc<Self>, mut changes: broadcast::Receiver<DeviceChange>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(DeviceChange::Deleted(device_id)) => coordinator.forget(device_id).await,
                    Ok(change) => {
                        // Loops reload the device every tick.
                        tracing::debug!(device_id = change.device_id(), "Device changed");
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("Device listener lagged, missed {} changes", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn poll_loop(ctx: Arc<PollContext>, device_id: i64) {
    let mut interval = tokio::time::interval(ctx.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let started = Instant::now();
        match AssertUnwindSafe(ctx.tick(device_id)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(device_id, "Poll failed: {}", e),
            Err(_) => tracing::error!(device_id, "Poll panicked, skipping tick"),
        }

        let elapsed = started.elapsed();
        if elapsed > ctx.poll_interval {
            tracing::warn!(device_id, ?elapsed, "Poll overran its period, skipping missed ticks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Device, RuntimeInterval, RuntimeStore, Snapshot, Store};
    use crate::devices::DeviceService;
    use crate::driver::{DeviceDriver, DriverMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    const PERIOD: Duration = Duration::from_millis(20);

    #[derive(Default)]
    struct ScriptedDriver {
        calls: std::sync::Mutex<HashMap<i64, usize>>,
        failures: AtomicUsize,
        panics: AtomicUsize,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedDriver {
        fn calls(&self, device_id: i64) -> usize {
            self.calls.lock().unwrap().get(&device_id).copied().unwrap_or(0)
        }
    }

    // Aborted polls drop this too.
    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DeviceDriver for ScriptedDriver {
        fn metadata(&self) -> DriverMetadata {
            DriverMetadata {
                name: "demo",
                display_name: "Scripted",
                categories: vec![crate::db::Category::Machine],
                connection_settings: Vec::new(),
                variable_settings: Vec::new(),
            }
        }

        async fn snapshot(&self, device: &Device) -> Result<Snapshot, DriverError> {
            *self.calls.lock().unwrap().entry(device.id).or_default() += 1;

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _in_flight = InFlight(&self.in_flight);
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(DriverError::Network("connection refused".to_string()));
            }
            let panicked = self
                .panics
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if panicked {
                panic!("driver crashed");
            }
            Ok(Snapshot::now(device.id, Status::Running))
        }
    }

    struct Fixture {
        store: Arc<Store>,
        driver: Arc<ScriptedDriver>,
        devices: DeviceService,
        coordinator: Arc<MonitorCoordinator>,
    }

    fn fixture(driver: ScriptedDriver) -> Fixture {
        let store = Arc::new(Store::new(":memory:").unwrap());
        let driver = Arc::new(driver);
        let mut registry = DriverRegistry::new();
        registry.register(driver.clone());
        let registry = Arc::new(registry);

        let timeline = Arc::new(RuntimeTimeline::new(store.clone()));
        let coordinator = Arc::new(MonitorCoordinator::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            timeline,
            PERIOD,
        ));
        let devices = DeviceService::new(store.clone(), registry);

        Fixture {
            store,
            driver,
            devices,
            coordinator,
        }
    }

    fn add_device(fx: &Fixture, name: &str) -> i64 {
        fx.devices
            .add(Device {
                name: name.to_string(),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_start_polls_and_stop_halts() {
        let fx = fixture(ScriptedDriver::default());
        let id = add_device(&fx, "Lathe");

        assert!(!fx.coordinator.is_monitoring(id).unwrap());
        assert_ok!(fx.coordinator.start_monitor(id).await);
        assert!(fx.coordinator.is_monitoring(id).unwrap());
        wait_until("three polls", || fx.driver.calls(id) >= 3).await;

        assert_ok!(fx.coordinator.stop_monitor(id, StopReason::Temporary).await);
        let after_stop = fx.driver.calls(id);
        assert!(!fx.coordinator.is_monitoring(id).unwrap());
        assert_eq!(
            fx.store.get_flag(id).unwrap(),
            Some(MonitorFlag {
                device_id: id,
                is_monitoring: false
            })
        );

        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(fx.driver.calls(id), after_stop);

        let latest = fx.store.get_latest(id).unwrap().unwrap();
        assert_eq!(latest.status, Status::Offline);
    }

    #[tokio::test]
    async fn test_removed_deletes_flag_and_restart_is_fresh() {
        let fx = fixture(ScriptedDriver::default());
        let id = add_device(&fx, "Robot cell");

        fx.coordinator.start_monitor(id).await.unwrap();
        fx.coordinator.stop_monitor(id, StopReason::Removed).await.unwrap();
        assert_eq!(fx.store.get_flag(id).unwrap(), None);
        assert!(!fx.coordinator.is_monitoring(id).unwrap());

        fx.coordinator.start_monitor(id).await.unwrap();
        assert!(fx.coordinator.is_monitoring(id).unwrap());
        fx.coordinator.stop_monitor(id, StopReason::Temporary).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_leaves_single_loop() {
        let fx = fixture(ScriptedDriver {
            delay: PERIOD * 2,
            ..Default::default()
        });
        let id = add_device(&fx, "Mill");

        fx.coordinator.start_monitor(id).await.unwrap();
        fx.coordinator.start_monitor(id).await.unwrap();
        fx.coordinator.stop_monitor(id, StopReason::Temporary).await.unwrap();
        fx.coordinator.start_monitor(id).await.unwrap();
        fx.coordinator.start_monitor(id).await.unwrap();

        let before = fx.driver.calls(id);
        wait_until("more polls", || fx.driver.calls(id) >= before + 4).await;
        fx.coordinator.stop_monitor(id, StopReason::Temporary).await.unwrap();

        // Slow polls overrun the period but never overlap.
        assert_eq!(fx.driver.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_driver_failures_do_not_stop_the_loop() {
        let fx = fixture(ScriptedDriver {
            failures: AtomicUsize::new(3),
            ..Default::default()
        });
        let failing = add_device(&fx, "Flaky");
        let healthy = add_device(&fx, "Steady");

        fx.coordinator.start_monitor(failing).await.unwrap();
        fx.coordinator.start_monitor(healthy).await.unwrap();

        let store = fx.store.clone();
        wait_until("both devices running", || {
            [failing, healthy].iter().all(|id| {
                store
                    .get_latest(*id)
                    .unwrap()
                    .is_some_and(|i| i.status == Status::Running)
            })
        })
        .await;

        assert_eq!(fx.driver.failures.load(Ordering::SeqCst), 0);
        fx.coordinator.stop_monitor(failing, StopReason::Temporary).await.unwrap();
        fx.coordinator.stop_monitor(healthy, StopReason::Temporary).await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_panic_skips_tick_only() {
        let fx = fixture(ScriptedDriver {
            panics: AtomicUsize::new(1),
            ..Default::default()
        });
        let id = add_device(&fx, "Crashy");

        fx.coordinator.start_monitor(id).await.unwrap();
        wait_until("polls after the panic", || fx.driver.calls(id) >= 3).await;
        assert_eq!(fx.driver.panics.load(Ordering::SeqCst), 0);

        let store = fx.store.clone();
        wait_until("running recorded", || {
            store
                .get_latest(id)
                .unwrap()
                .is_some_and(|i| i.status == Status::Running)
        })
        .await;
        assert_ok!(fx.coordinator.stop_monitor(id, StopReason::Temporary).await);
    }

    #[tokio::test]
    async fn test_start_records_offline_before_first_poll() {
        let fx = fixture(ScriptedDriver {
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let id = add_device(&fx, "Press");

        // Left over from a session that ended without a stop.
        let hour_ago = Utc::now() - chrono::Duration::minutes(60);
        fx.store
            .append(&RuntimeInterval::closed(
                id,
                Status::Running,
                hour_ago - chrono::Duration::minutes(1),
                hour_ago,
            ))
            .unwrap();

        fx.coordinator.start_monitor(id).await.unwrap();
        wait_until("two polls", || fx.driver.calls(id) >= 2).await;
        fx.coordinator.stop_monitor(id, StopReason::Temporary).await.unwrap();

        let all = fx
            .store
            .query_range(id, hour_ago - chrono::Duration::hours(1), Utc::now() + chrono::Duration::minutes(1))
            .unwrap();
        let statuses: Vec<_> = all.iter().map(|i| i.status).collect();
        assert_eq!(
            statuses,
            vec![Status::Running, Status::Offline, Status::Running, Status::Offline]
        );
        assert_eq!(all[0].start_time, hour_ago - chrono::Duration::minutes(1));
        assert_eq!(all[0].end_time, Some(all[1].start_time));
        assert_eq!(all[1].end_time, Some(all[2].start_time));
    }

    #[tokio::test]
    async fn test_subscribers_see_snapshots_and_offline_on_stop() {
        let fx = fixture(ScriptedDriver::default());
        let id = add_device(&fx, "Magazine");

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = fx.coordinator.subscribe(id, move |s| sink.lock().unwrap().push(*s));

        fx.coordinator.start_monitor(id).await.unwrap();
        wait_until("a running snapshot", || !seen.lock().unwrap().is_empty()).await;
        fx.coordinator.stop_monitor(id, StopReason::Temporary).await.unwrap();

        let seen = seen.lock().unwrap();
        let first = seen.first().unwrap();
        assert_eq!(first.status, Status::Running);
        assert!((0.0..=1.0).contains(&first.utilization));

        let last = seen.last().unwrap();
        assert_eq!(last.status, Status::Offline);
        assert_eq!(last.utilization, 0.0);
        assert!(seen.iter().all(|s| s.device_id == id));
    }

    #[tokio::test]
    async fn test_resume_starts_flagged_devices() {
        let fx = fixture(ScriptedDriver::default());
        let on = add_device(&fx, "On");
        let off = add_device(&fx, "Off");
        fx.store
            .upsert_flag(&MonitorFlag {
                device_id: on,
                is_monitoring: true,
            })
            .unwrap();
        fx.store
            .upsert_flag(&MonitorFlag {
                device_id: off,
                is_monitoring: false,
            })
            .unwrap();

        assert_eq!(fx.coordinator.resume().await.unwrap(), 1);
        wait_until("resumed device polled", || fx.driver.calls(on) >= 2).await;
        assert_eq!(fx.driver.calls(off), 0);
        fx.coordinator.stop_monitor(on, StopReason::Temporary).await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_device_loop_is_torn_down() {
        let fx = fixture(ScriptedDriver::default());
        let id = add_device(&fx, "Scrapped");
        let listener = fx.coordinator.spawn_device_listener(fx.devices.subscribe());

        fx.coordinator.start_monitor(id).await.unwrap();
        wait_until("first poll", || fx.driver.calls(id) >= 1).await;
        assert!(fx.devices.delete(id).unwrap());

        let coordinator = fx.coordinator.clone();
        wait_until("loop cancelled", || {
            let slot = coordinator.slot(id);
            let stopped = slot.try_lock().map(|s| !s.is_running()).unwrap_or(false);
            stopped
        })
        .await;

        assert!(!fx.coordinator.is_monitoring(id).unwrap());
        let polls = fx.driver.calls(id);
        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(fx.driver.calls(id), polls);
        listener.abort();
    }
}
