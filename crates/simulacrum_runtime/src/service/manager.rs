//! Service Manager
//!
//! Spawns services onto their own tasks and stops them again.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::{
    Mailbox, Service, ServiceContext, ServiceControl, ServiceError, ServiceHandle, ServiceResult, ServiceState,
    TimerSpec,
};

/// Capacity of each service's message queue
const MAILBOX_CAPACITY: usize = 1024;

struct RunningService {
    control: ServiceControl,
    join_handle: JoinHandle<ServiceResult<()>>,
    shutdown_timeout: Duration,
}

/// Owner of every service in a process
#[derive(Default)]
pub struct ServiceManager {
    services: DashMap<String, RunningService>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a service onto its own task
    ///
    /// Returns as soon as the task exists; the service is `Starting` until
    /// its `on_start` completes.
    pub async fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle<S::Message>> {
        let spec = service.spec();
        let service_id = spec.id.clone();

        if spec.singleton
            && self
                .services
                .get(&service_id)
                .is_some_and(|running| !running.control.state().is_terminal())
        {
            return Err(ServiceError::AlreadyRunning(service_id));
        }

        let (message_tx, message_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let control = ServiceControl::new(service_id.clone());
        let mailbox = Mailbox::new(message_tx);
        let handle = ServiceHandle::new(control.clone(), mailbox.clone());
        let ctx = ServiceContext::new(service_id.clone(), mailbox);

        tracing::debug!(service_id = %service_id, name = %spec.name, timers = spec.timers.len(), "Spawning service");
        let join_handle = tokio::spawn(run_service_loop(
            service,
            ctx,
            message_rx,
            control.clone(),
            spec.timers,
            spec.shutdown_timeout,
        ));

        self.services.insert(
            service_id,
            RunningService {
                control,
                join_handle,
                // Room for on_stop plus the loop to notice the request
                shutdown_timeout: spec.shutdown_timeout + Duration::from_secs(1),
            },
        );

        Ok(handle)
    }

    /// Stop one service and wait for its task to finish
    pub async fn stop(&self, service_id: &str) -> ServiceResult<()> {
        let (_, running) = self
            .services
            .remove(service_id)
            .ok_or_else(|| ServiceError::NotRunning(service_id.to_string()))?;
        stop_service(running).await
    }

    /// Stop every service; the first failure is returned after all have been tried
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        tracing::info!(services = self.services.len(), "Initiating shutdown of all services");

        let ids: Vec<String> = self.services.iter().map(|entry| entry.key().clone()).collect();
        let running: Vec<RunningService> = ids
            .iter()
            .filter_map(|id| self.services.remove(id).map(|(_, running)| running))
            .collect();
        for service in &running {
            service.control.request_stop();
        }

        let mut result = Ok(());
        for service in running {
            if let Err(e) = stop_service(service).await {
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Services and their current state
    pub fn list(&self) -> Vec<(String, ServiceState)> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().control.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

async fn stop_service(running: RunningService) -> ServiceResult<()> {
    let service_id = running.control.service_id.clone();
    running.control.request_stop();

    match tokio::time::timeout(running.shutdown_timeout, running.join_handle).await {
        // Failures inside the loop were already logged there
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(service_id = %service_id, error = ?e, "Service task panicked");
            Err(ServiceError::Internal(format!("{} panicked: {:?}", service_id, e)))
        }
        Err(_) => {
            tracing::warn!(service_id = %service_id, "Service shutdown timed out");
            Err(ServiceError::ShutdownTimeout)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Task Loop
// ─────────────────────────────────────────────────────────────────────────────

fn build_timers(timers: Vec<TimerSpec>) -> Vec<(String, Interval)> {
    timers
        .into_iter()
        .map(|timer| {
            let mut interval = tokio::time::interval(timer.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            (timer.name, interval)
        })
        .collect()
}

/// Wait for the next timer to fire and return its name
async fn next_tick(timers: &mut [(String, Interval)]) -> String {
    if timers.is_empty() {
        return std::future::pending().await;
    }
    let ticks = timers.iter_mut().map(|(_, interval)| Box::pin(interval.tick()));
    let (_, index, _) = futures::future::select_all(ticks).await;
    timers[index].0.clone()
}

async fn run_service_loop<S: Service>(
    mut service: S,
    ctx: ServiceContext<S::Message>,
    mut message_rx: mpsc::Receiver<S::Message>,
    control: ServiceControl,
    timers: Vec<TimerSpec>,
    shutdown_timeout: Duration,
) -> ServiceResult<()> {
    if let Err(e) = service.on_start(&ctx).await {
        tracing::error!(service_id = %ctx.service_id, error = %e, "Service failed to start");
        control.set_state(ServiceState::Failed);
        return Err(e);
    }

    control.set_state(ServiceState::Running);
    tracing::info!(service_id = %ctx.service_id, "Service started");

    let mut timers = build_timers(timers);

    loop {
        tokio::select! {
            _ = control.stop_requested() => {
                tracing::debug!(service_id = %ctx.service_id, "Stop requested");
                break;
            }

            Some(message) = message_rx.recv() => {
                if let Err(e) = service.on_message(&ctx, message).await {
                    tracing::warn!(service_id = %ctx.service_id, error = %e, "Error handling message");
                }
            }

            timer = next_tick(&mut timers) => {
                if let Err(e) = service.on_tick(&ctx, &timer).await {
                    tracing::warn!(service_id = %ctx.service_id, timer = %timer, error = %e, "Error during tick");
                }
            }
        }
    }

    control.set_state(ServiceState::Stopping);
    tracing::debug!(service_id = %ctx.service_id, "Service stopping");

    let (state, result) = match tokio::time::timeout(shutdown_timeout, service.on_stop(&ctx)).await {
        Ok(Ok(())) => (ServiceState::Stopped, Ok(())),
        Ok(Err(e)) => {
            tracing::error!(service_id = %ctx.service_id, error = %e, "Service stop failed");
            (ServiceState::Failed, Err(e))
        }
        Err(_) => {
            tracing::error!(service_id = %ctx.service_id, "Service stop timed out");
            (ServiceState::Failed, Err(ServiceError::ShutdownTimeout))
        }
    };
    control.set_state(state);
    if state == ServiceState::Stopped {
        tracing::info!(service_id = %ctx.service_id, "Service stopped");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
