//! The control loop.
//!
//! One thread owns the registry, the reaper and the throttle state. It blocks
//! in the multiplexer and reacts to exactly three things: readable sockets,
//! control events (reload, shutdown, status, reaped children) and elapsed
//! deadlines. Nothing else touches the registry, so none of it is locked.

use log::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::control::{ControlChannel, ControlEvent, ControlHandle};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::multiplexer;
use crate::registry::{EntryId, EntryStatus, Readmission, ServiceRegistry};
use crate::reload::{ConfigSource, ReloadCoordinator};
use crate::services::{Reaper, Spawner};
use crate::signal_handler::ChildTermination;
use crate::sockets::SocketBinder;
use crate::throttle::{FailureThrottle, ThrottleVerdict};

use nix::unistd::Pid;

use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum ServerError {
    /// The service file could not be read at startup
    Config(String, std::io::Error),
    Multiplexer(nix::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Config(source, e) => write!(f, "could not read {source}: {e}"),
            Self::Multiplexer(e) => write!(f, "waiting for events failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum Flow {
    Continue,
    Shutdown,
}

pub struct Server<S: Spawner> {
    registry: ServiceRegistry,
    reaper: Reaper,
    throttle: FailureThrottle,
    dispatcher: Dispatcher,
    reload: ReloadCoordinator,
    control: ControlChannel,
    spawner: S,
    shutdown_grace: Duration,
    source_name: String,
}

impl<S: Spawner> Server<S> {
    pub fn new(
        config: &Config,
        source: Box<dyn ConfigSource + Send>,
        control: ControlChannel,
        spawner: S,
    ) -> Self {
        let source_name = source.describe();
        Self {
            registry: ServiceRegistry::new(),
            reaper: Reaper::new(),
            throttle: FailureThrottle::new(config.throttle),
            dispatcher: Dispatcher::new(config.datagram_settle),
            reload: ReloadCoordinator::new(source, SocketBinder::new(config.backlog)),
            control,
            spawner,
            shutdown_grace: config.shutdown_grace,
            source_name,
        }
    }

    #[must_use]
    pub fn handle(&self) -> ControlHandle {
        self.control.handle()
    }

    #[must_use]
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Load the configuration for the first time. Failing to read it is fatal,
    /// individual bad lines or unbindable services are not.
    pub fn start(&mut self) -> Result<(), ServerError> {
        let report = self
            .reload
            .reload(&mut self.registry)
            .map_err(|e| ServerError::Config(self.source_name.clone(), e))?;
        info!(
            "Serving {} services from {} ({} could not be started)",
            self.registry.len(),
            self.source_name,
            report.failed.len()
        );
        if self.registry.is_empty() {
            warn!("No services configured, waiting for a reload");
        }
        Ok(())
    }

    /// Run until a shutdown is requested
    pub fn run(mut self) -> Result<(), ServerError> {
        self.start()?;
        loop {
            self.readmit(Instant::now());
            let deadline = self.registry.next_deadline();
            let ready = multiplexer::wait_for_events(&self.registry, &self.control, deadline)
                .map_err(ServerError::Multiplexer)?;

            if ready.control {
                let mut shutdown = false;
                for event in self.control.drain() {
                    // exits queued behind a shutdown still have to be seen
                    shutdown |= self.handle_event(event) == Flow::Shutdown;
                }
                if shutdown {
                    self.shutdown();
                    return Ok(());
                }
            }
            for id in ready.sockets {
                self.dispatch(id);
            }
        }
    }

    fn readmit(&mut self, now: Instant) {
        for readmission in self.registry.readmit_elapsed(now) {
            match readmission {
                Readmission::Enabled(id) => {
                    if let Some(entry) = self.registry.get(id) {
                        info!("Service re-enabled after backoff: {}", entry.spec);
                    }
                }
                Readmission::Settled(id) => trace!("Datagram entry {id} is watched again"),
            }
        }
    }

    fn handle_event(&mut self, event: ControlEvent) -> Flow {
        match event {
            ControlEvent::Reload => self.reload(),
            ControlEvent::Shutdown => return Flow::Shutdown,
            ControlEvent::StatusDump => self.dump_status(),
            ControlEvent::Status(reply) => {
                // the requester may have given up already
                let _ = reply.send(self.status());
            }
            ControlEvent::ChildExited { pid, termination } => {
                self.child_exited(pid, termination, Instant::now());
            }
        }
        Flow::Continue
    }

    fn reload(&mut self) {
        match self.reload.reload(&mut self.registry) {
            Ok(report) => info!("Reloaded {}: {}", self.source_name, report),
            Err(e) => error!(
                "Could not read {}, keeping the current services: {}",
                self.source_name, e
            ),
        }
    }

    #[must_use]
    pub fn status(&self) -> Vec<EntryStatus> {
        self.registry.status()
    }

    fn dump_status(&self) {
        info!(
            "{} services, {} handlers running",
            self.registry.len(),
            self.reaper.in_flight()
        );
        for status in self.status() {
            info!("{status}");
        }
    }

    fn dispatch(&mut self, id: EntryId) {
        let now = Instant::now();
        // stale if a reload removed the entry since the select
        let Some(entry) = self.registry.get_mut(id) else {
            return;
        };
        match self.dispatcher.dispatch(id, entry, &mut self.spawner, now) {
            Ok(Some(record)) => self.reaper.track(record),
            Ok(None) => {}
            Err(DispatchError::Accept(e)) => {
                warn!("Could not accept connection for {}: {}", entry.spec.name, e);
            }
            Err(DispatchError::Spawn(e)) => {
                error!("Could not start handler for {}: {}", entry.spec, e);
                let verdict = self.throttle.record(&mut entry.health, true, now);
                log_verdict(&entry.spec.to_string(), verdict);
            }
        }
    }

    fn child_exited(&mut self, pid: Pid, termination: ChildTermination, now: Instant) {
        let Some(reaped) = self.reaper.collect(pid, termination, now) else {
            trace!("Ignoring exit of unknown pid {pid}");
            return;
        };
        let Some(entry) = self.registry.get_mut(reaped.record.entry) else {
            debug!("Handler {pid} of a removed service exited with {termination}");
            return;
        };
        if entry.release(pid) {
            trace!("{} is watched again", entry.spec.name);
        }

        let failed = self.throttle.is_failure(&termination, reaped.runtime);
        let verdict = self.throttle.record(&mut entry.health, failed, now);
        if failed {
            warn!(
                "Handler {pid} for {} failed with {termination} after {:?}",
                entry.spec.name, reaped.runtime
            );
            log_verdict(&entry.spec.to_string(), verdict);
        } else {
            debug!(
                "Handler {pid} for {} exited with {termination} after {:?}",
                entry.spec.name, reaped.runtime
            );
        }
    }

    /// Close every socket, then give running wait handlers `shutdown_grace`
    /// to finish. Nowait handlers are left alone.
    fn shutdown(&mut self) {
        let mut waiting = self
            .registry
            .iter()
            .filter(|(_, entry)| entry.spec.is_wait())
            .filter_map(|(_, entry)| entry.busy.map(|busy| busy.pid))
            .collect::<HashSet<_>>();
        for entry in self.registry.drain() {
            debug!("Closing socket of {}", entry.spec);
        }
        info!("All sockets closed");
        if waiting.is_empty() {
            return;
        }

        info!(
            "Waiting up to {:?} for {} handlers to finish",
            self.shutdown_grace,
            waiting.len()
        );
        let deadline = Instant::now() + self.shutdown_grace;
        while !waiting.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    "Grace period over, leaving {} handlers running",
                    waiting.len()
                );
                return;
            }
            match self.control.recv_timeout(remaining) {
                Some(ControlEvent::ChildExited { pid, termination }) => {
                    if waiting.remove(&pid) {
                        debug!("Handler {pid} exited with {termination}");
                    }
                    self.reaper.collect(pid, termination, Instant::now());
                }
                Some(ControlEvent::Shutdown) => {
                    info!("Second shutdown request, not waiting for handlers");
                    return;
                }
                Some(ControlEvent::Status(reply)) => {
                    let _ = reply.send(Vec::new());
                }
                Some(ControlEvent::Reload | ControlEvent::StatusDump) | None => {}
            }
        }
    }
}

fn log_verdict(rendering: &str, verdict: ThrottleVerdict) {
    match verdict {
        ThrottleVerdict::Healthy => {}
        ThrottleVerdict::Failed { recent } => {
            debug!("{recent} recent failures of {rendering}");
        }
        ThrottleVerdict::Disabled { until, failures } => {
            warn!(
                "Service disabled for {}s after {failures} recent failures: {rendering}",
                until.saturating_duration_since(Instant::now()).as_secs()
            );
        }
    }
}
