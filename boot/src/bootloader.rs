//! The main loop.
//!
//! A board builds an [`Engine`] over its flash, ledger store and watchdog,
//! makes the entry decision with [`Bootloader::start`], and then hands over to
//! [`Bootloader::run`], which never returns.  Each pass of the loop services
//! the watchdog, moves any flash operation along, takes at most one packet
//! from the transport, and checks the backdoor window.
//!
//! Host tests drive [`Bootloader::step`] directly with a simulated clock.

use storage::NvmBackend;

use crate::backdoor::{self, BackdoorWindow, BootDecision, EntryInputs, EntryReason, WindowState};
use crate::clock::Clock;
use crate::critical::{InterruptControl, NoInterrupts};
use crate::engine::Engine;
use crate::ledger::LedgerStore;
use crate::protocol::{self, Command};
use crate::transport::Transport;
use crate::watchdog::Watchdog;

/// What the board has to do after a pass of the loop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Step {
    Continue,
    StartApplication { base: u32 },
    Reset,
    /// Something the updater relies on is broken.  Spin with the watchdog
    /// serviced.
    Halt,
}

/// The parts of leaving the updater that only the board can do.
pub trait Platform {
    /// Tear down whatever the updater set up and jump to the image at `base`.
    fn start_application(&mut self, base: u32) -> !;
    fn reset(&mut self) -> !;
}

pub struct Bootloader<B, S, W, I = NoInterrupts> {
    engine: Engine<B, S, W, I>,
    reason: Option<EntryReason>,
    window: Option<BackdoorWindow>,
    was_connected: bool,
    started: bool,
}

impl<B, S, W, I> Bootloader<B, S, W, I>
where
    B: NvmBackend,
    S: LedgerStore,
    W: Watchdog,
    I: InterruptControl,
{
    /// Make the entry decision.  If the updater's own code fails its check,
    /// the result halts on the first step.
    pub fn start(mut engine: Engine<B, S, W, I>, inputs: &EntryInputs, now: u32) -> Self {
        engine.service_watchdog();
        if !engine.validate_bootloader() {
            error!("updater checksum mismatch");
            engine.force_halt();
        }

        let entry = engine.ledger();
        let reason = backdoor::evaluate(&entry, inputs, |_| engine.validate_application());
        let window = match reason {
            Some(reason) => {
                info!("staying in updater: {:?}", reason);
                None
            }
            None => {
                let config = engine.config();
                Some(BackdoorWindow::open(
                    now,
                    config.backdoor_timeout_ms,
                    config.backdoor_max_extension_ms,
                ))
            }
        };
        if inputs.connect_request && !engine.is_halted() {
            // The host is already waiting; it will not send its own Connect.
            let _ = engine.execute(Command::Connect, now);
        }

        Bootloader {
            was_connected: engine.is_connected(),
            engine,
            reason,
            window,
            started: false,
        }
    }

    pub fn engine(&self) -> &Engine<B, S, W, I> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<B, S, W, I> {
        &mut self.engine
    }

    pub fn into_engine(self) -> Engine<B, S, W, I> {
        self.engine
    }

    pub fn window(&self) -> Option<&BackdoorWindow> {
        self.window.as_ref()
    }

    /// Where things stand.  While the backdoor is open with no host this is
    /// still undecided, and reported as the application it would start.
    pub fn decision(&self) -> BootDecision {
        match self.reason {
            Some(reason) => BootDecision::RemainInEngine(reason),
            None => BootDecision::TransferToApplication {
                base: self.engine.ledger().base,
            },
        }
    }

    /// Board hook for pushing the backdoor deadline out, for instance while
    /// a network link comes up.
    pub fn extend_backdoor(&mut self, ms: u32) {
        if let Some(window) = self.window.as_mut() {
            window.extend(ms);
        }
    }

    /// One pass of the main loop.
    pub fn step<T: Transport + ?Sized>(&mut self, transport: &mut T, now: u32) -> Step {
        self.engine.service_watchdog();
        if self.engine.is_halted() {
            return Step::Halt;
        }
        if self.engine.limit_packet_size(transport.max_packet_size()).is_err() {
            self.engine.force_halt();
            return Step::Halt;
        }

        if let Some(result) = self.engine.poll(now) {
            transport.send(&protocol::reply(&result, self.engine.max_packet()));
        }
        if let Some(packet) = transport.poll() {
            if let Some(reply) = self.engine.handle_packet(&packet, now) {
                transport.send(&reply);
            }
        }
        if self.engine.is_halted() {
            return Step::Halt;
        }

        if let Some(ms) = self.engine.take_extension() {
            self.extend_backdoor(ms);
        }
        if self.engine.take_reset() {
            return Step::Reset;
        }
        if self.engine.take_handoff() {
            return self.transfer();
        }

        self.engine.check_timeout(now);
        let connected = self.engine.is_connected();
        if connected && self.window.is_some() {
            self.reason = Some(EntryReason::HostConnected);
        }
        if self.was_connected && !connected {
            if let Some(window) = self.window.as_mut() {
                window.restart(now);
            }
        }
        self.was_connected = connected;

        if let Some(window) = self.window.as_mut() {
            if window.check(now, connected) == WindowState::Expired {
                return self.transfer();
            }
        }
        Step::Continue
    }

    /// Check again before leaving, since a session may have changed things
    /// since reset.
    fn transfer(&mut self) -> Step {
        self.window = None;
        if self.started {
            return Step::Continue;
        }
        let entry = self.engine.ledger();
        let engine = &mut self.engine;
        match backdoor::evaluate(&entry, &EntryInputs::default(), |_| {
            engine.validate_application()
        }) {
            None => {
                info!("starting application at {:#x}", entry.base);
                self.reason = None;
                self.started = true;
                Step::StartApplication { base: entry.base }
            }
            Some(reason) => {
                warn!("application not started: {:?}", reason);
                self.reason = Some(reason);
                Step::Continue
            }
        }
    }

    /// Run until the application is started or the device resets.
    pub fn run<T, P, C>(mut self, transport: &mut T, platform: &mut P, clock: &C) -> !
    where
        T: Transport + ?Sized,
        P: Platform + ?Sized,
        C: Clock + ?Sized,
    {
        loop {
            match self.step(transport, clock.now_ms()) {
                Step::Continue => (),
                Step::StartApplication { base } => platform.start_application(base),
                Step::Reset => platform.reset(),
                Step::Halt => self.engine.halt(),
            }
        }
    }
}
