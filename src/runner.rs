// Macvirt Virtualization CLI
// Copyright (c) 2024-2025 The Mapleseed Inc.
// Licensed under GPL-3.0 License

//! # VM runner
//!
//! Drives a configured VM through its lifecycle:
//!
//! ```text
//! NotStarted ─▶ Starting ─┬─▶ Running ─┬─▶ Stopped
//!                         │            └─▶ Crashed
//!                         └─▶ FailedToStart
//! ```
//!
//! The platform reports the outcome of the start request asynchronously; the
//! runner receives it on an explicit channel while pumping the host event
//! loop and turns the terminal state into a [`VmOutcome`].

use std::{
    io::{Read, Write},
    sync::mpsc::{self, Receiver, TryRecvError},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    console::{ConsoleForwarder, ConsolePipes},
    diagnostics::{DiagnosticSink, NullSink},
    hypervisor::{Hypervisor, VmEvent},
    vmcore::{VmConfig, VmResult},
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of the VM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmState {
    NotStarted,
    Starting,
    Running,
    FailedToStart,
    Stopped,
    Crashed,
}

/// Terminal result of a launch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmOutcome {
    /// The platform rejected the start request
    FailedToStart(String),
    /// The guest halted
    Stopped,
    /// The VM entered an error state after running
    Crashed(String),
}

impl VmOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            VmOutcome::Stopped => 0,
            VmOutcome::FailedToStart(_) | VmOutcome::Crashed(_) => 1,
        }
    }

    /// Human-readable failure description, if any
    pub fn error_message(&self) -> Option<&str> {
        match self {
            VmOutcome::Stopped => None,
            VmOutcome::FailedToStart(msg) | VmOutcome::Crashed(msg) => Some(msg),
        }
    }
}

/// Launches one VM and waits for it to finish
pub struct VmRunner {
    state: VmState,
    poll_interval: Duration,
    drain_timeout: Duration,
    diagnostics: Box<dyn DiagnosticSink>,
}

impl Default for VmRunner {
    fn default() -> Self {
        Self::new(Box::new(NullSink))
    }
}

impl VmRunner {
    pub fn new(diagnostics: Box<dyn DiagnosticSink>) -> Self {
        Self {
            state: VmState::NotStarted,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            diagnostics,
        }
    }

    /// How long each slice of the host event loop runs between event checks
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long to wait for guest console output to drain after the VM ends
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Configure, start and run the VM until it reaches a terminal state.
    ///
    /// Setup failures (validation, disk attachment, pipe creation) are
    /// returned as errors before anything is started. Failures after the
    /// start request are reported through the returned [`VmOutcome`].
    pub fn launch<R, W>(
        &mut self,
        hypervisor: &mut dyn Hypervisor,
        config: &VmConfig,
        host_in: R,
        host_out: W,
    ) -> VmResult<VmOutcome>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        config.validate(&hypervisor.limits())?;

        let pipes = ConsolePipes::new()?;
        hypervisor.configure(config, pipes.guest)?;
        info!("Configuration validated by {} backend", hypervisor.name());

        let mut forwarder = ConsoleForwarder::spawn(host_in, pipes.host, host_out)?;

        let (tx, rx) = mpsc::channel();
        self.transition(VmState::Starting);

        let outcome = match hypervisor.start(tx) {
            Ok(()) => self.wait(hypervisor, &rx),
            Err(e) => {
                self.transition(VmState::FailedToStart);
                VmOutcome::FailedToStart(e.to_string())
            }
        };

        if let Some(msg) = outcome.error_message() {
            debug!("Launch ended: {}", msg);
            self.diagnostics.write_line(msg);
        }

        if !forwarder.wait_output(self.drain_timeout) {
            debug!("Leaving console output forwarder detached");
        }

        Ok(outcome)
    }

    fn wait(&mut self, hypervisor: &mut dyn Hypervisor, events: &Receiver<VmEvent>) -> VmOutcome {
        loop {
            hypervisor.pump(self.poll_interval);

            loop {
                let event = match events.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return self.disconnected(),
                };

                if let Some(outcome) = self.handle(event) {
                    return outcome;
                }
            }
        }
    }

    fn handle(&mut self, event: VmEvent) -> Option<VmOutcome> {
        debug!("VM event {:?} in state {:?}", event, self.state);

        match event {
            VmEvent::Started => {
                self.transition(VmState::Running);
                None
            }
            VmEvent::StartFailed(msg) => {
                self.transition(VmState::FailedToStart);
                Some(VmOutcome::FailedToStart(msg))
            }
            VmEvent::Stopped => {
                self.transition(VmState::Stopped);
                Some(VmOutcome::Stopped)
            }
            VmEvent::Crashed(msg) => {
                self.transition(VmState::Crashed);
                Some(VmOutcome::Crashed(msg))
            }
        }
    }

    fn disconnected(&mut self) -> VmOutcome {
        if self.state == VmState::Running {
            warn!("Hypervisor event channel closed while running");
            self.transition(VmState::Stopped);
            VmOutcome::Stopped
        } else {
            self.transition(VmState::FailedToStart);
            VmOutcome::FailedToStart(
                "hypervisor exited before reporting a start result".to_string(),
            )
        }
    }

    fn transition(&mut self, next: VmState) {
        info!("VM state {:?} -> {:?}", self.state, next);
        self.diagnostics
            .write_line(&format!("vm state {:?} -> {:?}", self.state, next));
        self.state = next;
    }
}
