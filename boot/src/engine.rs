//! Protocol engine.
//!
//! The engine owns a session with one host at a time:
//!
//! ```text
//!          Connect                EraseRegion
//!   Idle ----------> Connected -------------> Erasing
//!    ^                |  ^  ^ \                  |
//!    |   Disconnect   |  |  |  \ ProgramChunk    | last sector blank
//!    +----------------+  |  |   +-------------> Programming
//!    |   inactivity      |  |                    | every piece verified
//!    +-------------------+  |  FinalizeAndVerify |
//!                           +---- Verifying <----+
//! ```
//!
//! Anything other than Connect while Idle is dropped without a reply, so an
//! unconnected updater stays quiet on a shared bus.
//!
//! With [`Config::security`] set, a new session starts locked: erase, program,
//! finalize and abort are refused with `AccessLocked` until the host answers a
//! seed with the right key.
//!
//! Erases and writes are started by [`Engine::submit`], which returns
//! [`Outcome::Pending`], and carried forward one device poll at a time by
//! [`Engine::poll`].  While one is in flight, Connect, Disconnect and new
//! flash commands are refused.  Abort and Reset are accepted but only take
//! effect once the current sector or write has finished.
//!
//! Progress is recorded in the [`Ledger`] as it is made: an erase is only
//! marked complete once every sector reads back blank, and a chunk is only
//! committed once it reads back as written.  A device failure marks the
//! ledger corrupt and drops the session.

use storage::{NvmBackend, Region, SectorSpan};

use crate::checksum::{crc32, Checksum, ChecksumKind};
use crate::clock;
use crate::config::Config;
use crate::critical::{InterruptControl, NoInterrupts};
use crate::flash::FlashManager;
use crate::ledger::{Ledger, LedgerEntry, LedgerStatus, LedgerStore, TargetId};
use crate::protocol::{
    self, Capabilities, Command, Packet, Response, Seed, Status, UploadData, MAX_CHUNK,
    MAX_PACKET, MAX_SEED, MIN_PACKET, PROTOCOL_VERSION,
};
use crate::watchdog::{self, Watchdog};
use crate::{Error, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connected = 1,
    Erasing = 2,
    Programming = 3,
    Verifying = 4,
}

impl SessionState {
    pub fn from_u8(value: u8) -> Option<SessionState> {
        match value {
            0 => Some(SessionState::Idle),
            1 => Some(SessionState::Connected),
            2 => Some(SessionState::Erasing),
            3 => Some(SessionState::Programming),
            4 => Some(SessionState::Verifying),
            _ => None,
        }
    }

    /// A flash operation is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Erasing | SessionState::Programming | SessionState::Verifying
        )
    }
}

/// What became of a submitted command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    Done(Result<Response>),
    /// Started.  The result comes from a later [`Engine::poll`].
    Pending,
    /// Dropped without a reply.
    Ignored,
}

enum Pending {
    Erase {
        span: SectorSpan,
        region: Region,
        current: usize,
    },
    Program {
        address: u32,
        data: heapless::Vec<u8, MAX_CHUNK>,
        /// Bytes written and verified.
        done: usize,
        /// Bytes in the write now in flight.
        issued: usize,
    },
}

enum Progress {
    Waiting(Pending),
    Finished(Response),
}

/// Where uploads and block checksums read from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Mta {
    Nvm(u32),
    /// Offset into the station id.
    Id(usize),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Stop {
    Abort,
    Reset,
}

pub struct Engine<B, S, W, I = NoInterrupts> {
    config: Config,
    flash: FlashManager<B, I>,
    ledger: Ledger<S>,
    watchdog: W,
    state: SessionState,
    pending: Option<Pending>,
    /// Device polls spent on the operation in flight.
    polls: u32,
    /// Erased and checked in this session.
    erased: Option<Region>,
    /// Where the next chunk has to start.
    cursor: u32,
    /// The ledger entry was started by this session.
    began_here: bool,
    last_activity: u32,
    max_packet: usize,
    mta: Mta,
    locked: bool,
    /// The seed handed out, until a key answers it.
    seed: Option<Seed>,
    stop: Option<Stop>,
    reset: bool,
    extension: Option<u32>,
    finalized: bool,
    handoff: bool,
    halted: bool,
}

impl<B: NvmBackend, S: LedgerStore, W: Watchdog> Engine<B, S, W> {
    pub fn new(config: Config, nvm: B, store: S, watchdog: W) -> Result<Engine<B, S, W>> {
        let mut flash = FlashManager::new(nvm, &config)?;
        flash.init()?;
        let ledger = Ledger::open(store)?;
        Ok(Engine {
            config,
            flash,
            ledger,
            watchdog,
            state: SessionState::Idle,
            pending: None,
            polls: 0,
            erased: None,
            cursor: 0,
            began_here: false,
            last_activity: 0,
            max_packet: MAX_PACKET,
            mta: Mta::Nvm(0),
            locked: config.security.is_some(),
            seed: None,
            stop: None,
            reset: false,
            extension: None,
            finalized: false,
            handoff: false,
            halted: false,
        })
    }
}

impl<B: NvmBackend, S: LedgerStore, W: Watchdog, I: InterruptControl> Engine<B, S, W, I> {
    /// Mask interrupts through the board while erases and writes are issued.
    pub fn with_interrupts<J: InterruptControl>(self, irq: J) -> Engine<B, S, W, J> {
        Engine {
            config: self.config,
            flash: self.flash.with_interrupts(irq),
            ledger: self.ledger,
            watchdog: self.watchdog,
            state: self.state,
            pending: self.pending,
            polls: self.polls,
            erased: self.erased,
            cursor: self.cursor,
            began_here: self.began_here,
            last_activity: self.last_activity,
            max_packet: self.max_packet,
            mta: self.mta,
            locked: self.locked,
            seed: self.seed,
            stop: self.stop,
            reset: self.reset,
            extension: self.extension,
            finalized: self.finalized,
            handoff: self.handoff,
            halted: self.halted,
        }
    }

    /// Limit replies, and the chunk size offered to the host, to what the
    /// transport can carry.  Links shorter than [`MIN_PACKET`] cannot carry
    /// every reply and are refused.
    pub fn limit_packet_size(&mut self, max: usize) -> Result<()> {
        if max < MIN_PACKET {
            error!("link of {} bytes is too short", max as u32);
            return Err(Error::Defect);
        }
        self.max_packet = max.min(MAX_PACKET);
        Ok(())
    }

    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn ledger(&self) -> LedgerEntry {
        self.ledger.read()
    }

    pub fn flash(&self) -> &FlashManager<B, I> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut FlashManager<B, I> {
        &mut self.flash
    }

    pub fn ledger_store(&self) -> &S {
        self.ledger.store()
    }

    pub fn is_connected(&self) -> bool {
        self.state != SessionState::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn into_parts(self) -> (B, S, W) {
        (
            self.flash.into_inner(),
            self.ledger.into_store(),
            self.watchdog,
        )
    }

    pub fn service_watchdog(&mut self) {
        self.watchdog.service();
    }

    /// Refuse everything from now on.
    pub(crate) fn force_halt(&mut self) {
        self.pending = None;
        self.halted = true;
    }

    /// Stop for good, keeping the watchdog quiet.
    pub fn halt(&mut self) -> ! {
        error!("updater halted");
        watchdog::spin(&mut self.watchdog)
    }

    /// Does the application recorded in the ledger still match its checksum?
    pub fn validate_application(&mut self) -> bool {
        let entry = self.ledger.read();
        if entry.target != TargetId::FirmwareNvm || entry.status != LedgerStatus::Complete {
            return false;
        }
        match (entry.checksum, entry.region()) {
            (Some(expected), Some(region)) => {
                match self.flash.checksum(expected.kind(), &region, &mut self.watchdog) {
                    Ok(actual) => actual == expected,
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    /// Check the updater's own code against the configured checksum.  True
    /// when there is nothing to check against.
    pub fn validate_bootloader(&mut self) -> bool {
        let Some(expected) = self.config.bootloader_checksum else {
            return true;
        };
        let protected = self.config.protected;
        match self.flash.checksum(expected.kind(), &protected, &mut self.watchdog) {
            Ok(actual) => actual == expected,
            Err(_) => false,
        }
    }

    /// A backdoor extension asked for by the host, if any.
    pub fn take_extension(&mut self) -> Option<u32> {
        self.extension.take()
    }

    /// The host asked for a reset, and it is now safe to do.
    pub fn take_reset(&mut self) -> bool {
        core::mem::replace(&mut self.reset, false)
    }

    /// The host finalized an image and then let go.
    pub fn take_handoff(&mut self) -> bool {
        core::mem::replace(&mut self.handoff, false)
    }

    pub fn status(&self) -> Status {
        let entry = self.ledger.read();
        Status {
            session: self.state,
            locked: self.locked,
            target: entry.target,
            ledger: entry.status,
            committed: entry.committed,
            region: entry.region(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        let write_size = self.flash.write_size().max(1);
        let room = self.max_packet.saturating_sub(1).min(MAX_CHUNK);
        Capabilities {
            version: PROTOCOL_VERSION,
            max_chunk: (room / write_size * write_size) as u16,
            max_packet: self.max_packet as u16,
            write_size: write_size as u16,
            checksum: self.config.checksum,
        }
    }

    /// Decode a packet and act on it.  Returns the reply to send, if there is
    /// one now.
    pub fn handle_packet(&mut self, packet: &[u8], now: u32) -> Option<Packet> {
        match Command::decode(packet) {
            Ok(cmd) => match self.submit(cmd, now) {
                Outcome::Done(result) => Some(protocol::reply(&result, self.max_packet)),
                Outcome::Pending | Outcome::Ignored => None,
            },
            Err(_) if self.state == SessionState::Idle => None,
            Err(e) => {
                warn!("bad packet: {:?}", e);
                Some(protocol::reply(&Err(e), self.max_packet))
            }
        }
    }

    pub fn submit(&mut self, cmd: Command<'_>, now: u32) -> Outcome {
        if self.halted {
            return Outcome::Done(Err(Error::Defect));
        }
        let unsolicited = matches!(cmd, Command::Connect | Command::ExtendBackdoor { .. });
        if self.state == SessionState::Idle && !unsolicited {
            debug!("not connected, dropping {:?}", cmd.opcode());
            return Outcome::Ignored;
        }
        self.last_activity = now;

        if self.pending.is_some() {
            return Outcome::Done(self.while_busy(cmd));
        }
        if self.locked && cmd.needs_unlock() {
            warn!("{:?} refused while locked", cmd.opcode());
            return Outcome::Done(Err(Error::AccessLocked));
        }

        let result = match cmd {
            Command::Connect => Ok(self.connect()),
            Command::Disconnect => Ok(self.disconnect()),
            Command::GetStatus => Ok(Response::Status(self.status())),
            Command::ExtendBackdoor { ms } => {
                self.extension = Some(ms);
                Ok(Response::Ack)
            }
            Command::Abort => self.abort(),
            Command::GetId => Ok(self.get_id()),
            Command::GetSeed => Ok(self.get_seed()),
            Command::Unlock { key } => self.unlock(key),
            Command::SetMta { address } => {
                self.mta = Mta::Nvm(address);
                Ok(Response::Ack)
            }
            Command::Upload { length } => self.upload(length),
            Command::ShortUpload { length, address } => {
                self.mta = Mta::Nvm(address);
                self.upload(length)
            }
            Command::BuildChecksum { length } => self.build_checksum(length),
            Command::EraseRegion { start, length } => return self.erase_region(start, length),
            Command::EraseFromMta { length } => match self.mta {
                Mta::Nvm(start) => return self.erase_region(start, length),
                Mta::Id(_) => Err(Error::OutOfRange),
            },
            Command::ProgramChunk { address, data } => return self.program_chunk(address, data),
            Command::ProgramNext { data } => return self.program_chunk(self.cursor, data),
            Command::FinalizeAndVerify { expected } => self.finalize(expected),
            Command::Reset => {
                info!("reset requested");
                self.reset = true;
                Ok(Response::Ack)
            }
        };
        Outcome::Done(self.settle(result))
    }

    /// Run a command to completion, servicing the watchdog while the device
    /// works.  Commands dropped for want of a session report `NotConnected`.
    /// A chunk is written straight from the caller's buffer, so it is not
    /// limited to what fits in a packet.
    pub fn execute(&mut self, cmd: Command<'_>, now: u32) -> Result<Response> {
        let chunk = match cmd {
            Command::ProgramChunk { address, data } => Some((address, data)),
            Command::ProgramNext { data } => Some((self.cursor, data)),
            _ => None,
        };
        match chunk {
            Some((address, data))
                if self.state == SessionState::Connected && self.pending.is_none() && !self.halted =>
            {
                self.last_activity = now;
                let result = self.program_in_place(address, data);
                self.settle(result)
            }
            _ => match self.submit(cmd, now) {
                Outcome::Done(result) => result,
                Outcome::Ignored => Err(Error::NotConnected),
                Outcome::Pending => loop {
                    if let Some(result) = self.poll(now) {
                        return result;
                    }
                },
            },
        }
    }

    /// Move the operation in flight along.  Returns its result once it has
    /// finished, and restarts the inactivity timer from `now` when it does.
    pub fn poll(&mut self, now: u32) -> Option<Result<Response>> {
        let pending = self.pending.take()?;
        let result = match self.advance(pending) {
            Ok(Progress::Waiting(pending)) => {
                self.pending = Some(pending);
                return None;
            }
            Ok(Progress::Finished(response)) => Ok(response),
            Err(e) => Err(e),
        };
        self.last_activity = now;
        Some(self.settle(result))
    }

    /// Drop a connected host that has gone quiet.  Returns true if the
    /// session was dropped.
    pub fn check_timeout(&mut self, now: u32) -> bool {
        if self.state != SessionState::Connected || self.pending.is_some() {
            return false;
        }
        if !clock::expired(now, self.last_activity, self.config.inactivity_timeout_ms) {
            return false;
        }
        warn!("host inactive, dropping session");
        self.end_session();
        true
    }

    fn while_busy(&mut self, cmd: Command<'_>) -> Result<Response> {
        match cmd {
            Command::Connect => Err(Error::AlreadyBusy),
            Command::Disconnect => Err(Error::UnsafeToDisconnect),
            Command::GetStatus => Ok(Response::Status(self.status())),
            Command::ExtendBackdoor { ms } => {
                self.extension = Some(ms);
                Ok(Response::Ack)
            }
            Command::Abort => {
                self.stop = Some(Stop::Abort);
                Ok(Response::Ack)
            }
            Command::Reset => {
                self.stop = Some(Stop::Reset);
                Ok(Response::Ack)
            }
            _ => Err(Error::Busy),
        }
    }

    fn end_session(&mut self) {
        self.state = SessionState::Idle;
        self.erased = None;
        self.cursor = 0;
        self.began_here = false;
        self.locked = self.config.security.is_some();
        self.seed = None;
        self.mta = Mta::Nvm(0);
    }

    fn connect(&mut self) -> Response {
        if self.state == SessionState::Idle {
            info!("host connected");
        } else {
            debug!("host reconnected, session reset");
        }
        self.end_session();
        self.state = SessionState::Connected;
        self.finalized = false;
        self.handoff = false;
        Response::Connected(self.capabilities())
    }

    fn disconnect(&mut self) -> Response {
        info!("host disconnected");
        self.end_session();
        if self.finalized {
            self.finalized = false;
            self.handoff = true;
        }
        Response::Ack
    }

    fn get_id(&mut self) -> Response {
        self.mta = Mta::Id(0);
        Response::Id {
            length: self.config.station_id.len() as u32,
        }
    }

    fn get_seed(&mut self) -> Response {
        let mut seed = Seed::new();
        match self.config.security {
            Some(check) if self.locked => {
                let mut buf = [0u8; MAX_SEED];
                let n = check.seed(&mut buf).min(MAX_SEED);
                // Never longer than its capacity.
                let _ = seed.extend_from_slice(&buf[..n]);
                self.seed = Some(seed.clone());
            }
            _ => (),
        }
        Response::Seed(seed)
    }

    fn unlock(&mut self, key: &[u8]) -> Result<Response> {
        let Some(check) = self.config.security.filter(|_| self.locked) else {
            return Ok(Response::Ack);
        };
        let seed = self.seed.take().ok_or(Error::Sequence)?;
        if check.check(&seed, key) {
            info!("programming unlocked");
            self.locked = false;
            Ok(Response::Ack)
        } else {
            warn!("wrong key, dropping session");
            self.end_session();
            Err(Error::AccessLocked)
        }
    }

    fn upload(&mut self, length: u8) -> Result<Response> {
        let len = usize::from(length);
        if len == 0 || len > self.max_packet - 1 {
            return Err(Error::OutOfRange);
        }
        let mut data = UploadData::new();
        data.resize(len, 0).map_err(|_| Error::OutOfRange)?;
        match self.mta {
            Mta::Nvm(address) => {
                self.flash
                    .read(address, &mut data)
                    .map_err(|_| Error::OutOfRange)?;
                self.mta = Mta::Nvm(address.wrapping_add(len as u32));
            }
            Mta::Id(offset) => {
                let id = self
                    .config
                    .station_id
                    .get(offset..offset + len)
                    .ok_or(Error::OutOfRange)?;
                data.copy_from_slice(id);
                self.mta = Mta::Id(offset + len);
            }
        }
        Ok(Response::Data(data))
    }

    fn build_checksum(&mut self, length: u32) -> Result<Response> {
        let crc = match self.mta {
            Mta::Nvm(address) => {
                let region = Region::checked(address, length).ok_or(Error::OutOfRange)?;
                match self
                    .flash
                    .checksum(ChecksumKind::Crc32, &region, &mut self.watchdog)
                {
                    Ok(Checksum::Crc32(crc)) => crc,
                    Ok(_) => return Err(Error::Defect),
                    Err(_) => return Err(Error::OutOfRange),
                }
            }
            Mta::Id(offset) => {
                let end = offset
                    .checked_add(length as usize)
                    .ok_or(Error::OutOfRange)?;
                let id = self
                    .config
                    .station_id
                    .get(offset..end)
                    .ok_or(Error::OutOfRange)?;
                crc32(id)
            }
        };
        Ok(Response::BlockChecksum(crc))
    }

    fn abort(&mut self) -> Result<Response> {
        let entry = self.ledger.read();
        if self.began_here && entry.status != LedgerStatus::Complete {
            info!("update aborted");
            self.ledger.clear(&mut self.watchdog)?;
        }
        self.erased = None;
        self.cursor = 0;
        self.began_here = false;
        Ok(Response::Ack)
    }

    fn erase_region(&mut self, start: u32, length: u32) -> Outcome {
        if self.flash.is_protected(start, length) {
            warn!("erase of protected region at {:#x}", start);
            return Outcome::Done(Err(Error::ProtectedRegion));
        }
        let Some(region) = Region::checked(start, length) else {
            return Outcome::Done(Err(Error::UnalignedRegion));
        };
        let span = match self.flash.resolve(&region) {
            Ok(span) => span,
            Err(e) => {
                warn!("erase {:#x}+{:#x} rejected: {:?}", start, length, e);
                return Outcome::Done(Err(e));
            }
        };

        // An erase that carries on from the last one grows the same update.
        let entry = self.ledger.read();
        let extends = match self.erased {
            Some(done) => {
                self.began_here
                    && entry.status.is_active()
                    && entry.base == done.start()
                    && done.end() == region.start()
            }
            None => false,
        };
        let recorded = if extends {
            self.ledger.extend(length, &mut self.watchdog)
        } else {
            self.erased = None;
            self.cursor = start;
            self.ledger
                .begin(TargetId::FirmwareNvm, start, length, &mut self.watchdog)
        };
        if let Err(e) = recorded {
            return Outcome::Done(self.settle(Err(e)));
        }
        self.began_here = true;
        self.finalized = false;

        info!("erasing {} sectors from {:#x}", span.count() as u32, start);
        self.state = SessionState::Erasing;
        self.polls = 0;
        match self.flash.start_erase_sector(span.first) {
            Ok(()) => {
                self.pending = Some(Pending::Erase {
                    span,
                    region,
                    current: span.first,
                });
                Outcome::Pending
            }
            Err(e) => Outcome::Done(self.settle(Err(e))),
        }
    }

    fn program_chunk(&mut self, address: u32, data: &[u8]) -> Outcome {
        if let Err(e) = self.check_chunk(address, data) {
            return Outcome::Done(Err(e));
        }
        let mut buffer = heapless::Vec::new();
        if buffer.extend_from_slice(data).is_err() {
            return Outcome::Done(Err(Error::Malformed));
        }
        debug!("program {:#x}+{}", address, data.len() as u32);
        self.state = SessionState::Programming;
        self.polls = 0;
        match self.issue_piece(address, &buffer) {
            Ok(issued) => {
                self.pending = Some(Pending::Program {
                    address,
                    data: buffer,
                    done: 0,
                    issued,
                });
                Outcome::Pending
            }
            Err(e) => Outcome::Done(self.settle(Err(e))),
        }
    }

    fn program_in_place(&mut self, address: u32, data: &[u8]) -> Result<Response> {
        self.check_chunk(address, data)?;
        debug!("program {:#x}+{}", address, data.len() as u32);
        self.state = SessionState::Programming;
        let mut done = 0;
        while done < data.len() {
            let at = address + done as u32;
            let n = self.issue_piece(at, &data[done..])?;
            self.flash.wait(&mut self.watchdog)?;
            if !self.flash.verify(at, &data[done..done + n])? {
                error!("readback mismatch at {:#x}", at);
                return Err(Error::HardwareFault);
            }
            done += n;
        }
        self.ledger.commit(data.len() as u32, &mut self.watchdog)?;
        self.cursor = address + data.len() as u32;
        self.state = SessionState::Connected;
        Ok(Response::Ack)
    }

    fn check_chunk(&self, address: u32, data: &[u8]) -> Result<()> {
        let result = self.chunk_allowed(address, data);
        if let Err(e) = result {
            warn!("chunk at {:#x} rejected: {:?}", address, e);
        }
        result
    }

    fn chunk_allowed(&self, address: u32, data: &[u8]) -> Result<()> {
        if self.locked {
            return Err(Error::AccessLocked);
        }
        if data.is_empty() {
            return Err(Error::Malformed);
        }
        let length = u32::try_from(data.len()).map_err(|_| Error::Malformed)?;
        if self.flash.is_protected(address, length) {
            return Err(Error::ProtectedRegion);
        }
        let region = Region::checked(address, length).ok_or(Error::NotErased)?;
        match self.erased {
            Some(erased) if erased.contains_region(&region) => (),
            _ => return Err(Error::NotErased),
        }
        if address != self.cursor {
            return Err(Error::OutOfOrder);
        }
        storage::check_slice(self.flash.write_size(), address, data.len())
            .map_err(|_| Error::Misaligned)
    }

    /// Start writing as much of `rest` as fits in the sector at `address`.
    fn issue_piece(&mut self, address: u32, rest: &[u8]) -> Result<usize> {
        let sector = self
            .flash
            .map()
            .find(address)
            .and_then(|pos| self.flash.sector(pos))
            .ok_or(Error::OutOfBounds)?;
        let n = ((sector.end() - address) as usize).min(rest.len());
        self.flash.start_program(address, &rest[..n])?;
        Ok(n)
    }

    fn advance(&mut self, pending: Pending) -> Result<Progress> {
        self.watchdog.service();
        if !self.flash.poll()? {
            self.polls += 1;
            if self.polls >= self.config.nvm_poll_limit {
                error!("flash operation did not complete");
                return Err(Error::HardwareFault);
            }
            return Ok(Progress::Waiting(pending));
        }
        self.polls = 0;

        match pending {
            Pending::Erase {
                span,
                region,
                current,
            } => {
                self.flash.check_erased(current, &mut self.watchdog)?;
                if let Some(stop) = self.stop.take() {
                    return self.stop_early(stop);
                }
                if current < span.last {
                    self.flash.start_erase_sector(current + 1)?;
                    return Ok(Progress::Waiting(Pending::Erase {
                        span,
                        region,
                        current: current + 1,
                    }));
                }
                self.ledger.mark_erased(&mut self.watchdog)?;
                let erased = match self.erased {
                    Some(done) => Region::checked(done.start(), done.len() + region.len()),
                    None => Some(region),
                };
                self.erased = Some(erased.ok_or(Error::Defect)?);
                self.state = SessionState::Connected;
                info!("erase complete");
                Ok(Progress::Finished(Response::Ack))
            }
            Pending::Program {
                address,
                data,
                done,
                issued,
            } => {
                let at = address + done as u32;
                if !self.flash.verify(at, &data[done..done + issued])? {
                    error!("readback mismatch at {:#x}", at);
                    return Err(Error::HardwareFault);
                }
                if let Some(stop) = self.stop.take() {
                    return self.stop_early(stop);
                }
                let done = done + issued;
                if done < data.len() {
                    let issued = self.issue_piece(address + done as u32, &data[done..])?;
                    return Ok(Progress::Waiting(Pending::Program {
                        address,
                        data,
                        done,
                        issued,
                    }));
                }
                self.ledger.commit(data.len() as u32, &mut self.watchdog)?;
                self.cursor = address + data.len() as u32;
                self.state = SessionState::Connected;
                Ok(Progress::Finished(Response::Ack))
            }
        }
    }

    /// Abort or reset at a sector or write boundary.  Work not yet recorded
    /// in the ledger is given up.
    fn stop_early(&mut self, stop: Stop) -> Result<Progress> {
        self.state = SessionState::Connected;
        match stop {
            Stop::Abort => {
                self.abort()?;
            }
            Stop::Reset => {
                info!("reset at operation boundary");
                self.reset = true;
            }
        }
        Err(Error::Aborted)
    }

    fn finalize(&mut self, expected: Checksum) -> Result<Response> {
        if expected.kind() != self.config.checksum {
            return Err(Error::Malformed);
        }
        let entry = self.ledger.read();
        if entry.status == LedgerStatus::Complete {
            // Already done.  Nothing is rewritten either way.
            return if entry.checksum == Some(expected) {
                self.finalized = true;
                Ok(Response::Finalized)
            } else {
                Err(Error::ChecksumMismatch)
            };
        }
        if !entry.status.is_active() || entry.committed != entry.total_length {
            return Err(Error::Incomplete);
        }
        let region = entry.region().ok_or(Error::Defect)?;

        self.state = SessionState::Verifying;
        let actual = self
            .flash
            .checksum(expected.kind(), &region, &mut self.watchdog);
        self.state = SessionState::Connected;
        let actual = actual?;

        let matched = actual == expected;
        self.ledger.finalize(matched, actual, &mut self.watchdog)?;
        self.erased = None;
        if matched {
            info!("image verified, {} bytes", entry.total_length);
            self.finalized = true;
            Ok(Response::Finalized)
        } else {
            warn!("image checksum mismatch");
            Err(Error::ChecksumMismatch)
        }
    }

    /// Apply the consequences of an error to the session.
    fn settle(&mut self, result: Result<Response>) -> Result<Response> {
        match result {
            Err(Error::Defect) => {
                error!("internal check failed");
                self.pending = None;
                self.halted = true;
            }
            Err(e) if e.is_fatal_to_update() => self.abandon(e),
            _ => {
                if self.pending.is_none() && self.state.is_busy() {
                    self.state = SessionState::Connected;
                }
            }
        }
        result
    }

    /// The device or the ledger failed.  What was written can no longer be
    /// trusted, and the host has to start over.
    fn abandon(&mut self, e: Error) {
        error!("update abandoned: {:?}", e);
        self.pending = None;
        self.stop = None;
        self.finalized = false;
        self.end_session();
        if self.ledger.read().status.is_active() {
            if let Err(e) = self.ledger.mark_corrupt(&mut self.watchdog) {
                error!("could not mark ledger corrupt: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RamSlot;
    use crate::watchdog::NoWatchdog;
    use simflash::styles::STM32F4;
    use simflash::SimFlash;

    type TestEngine = Engine<SimFlash, RamSlot, NoWatchdog>;

    fn engine(latency: u32) -> TestEngine {
        let config = Config::new(STM32F4.application, STM32F4.protected());
        let flash = STM32F4.build().unwrap().with_latency(latency);
        Engine::new(config, flash, RamSlot::new(), NoWatchdog).unwrap()
    }

    #[test]
    fn idle_is_silent() {
        let mut e = engine(0);
        assert_eq!(e.submit(Command::GetStatus, 0), Outcome::Ignored);
        assert_eq!(e.handle_packet(&[0xd0, 0, 0x40, 0, 8, 1, 2, 3, 4], 0), None);
        assert_eq!(e.handle_packet(&[0x42], 0), None);
        assert!(e.flash().nvm().is_initialized());
        let reply = e.handle_packet(&[0xff], 0).unwrap();
        assert_eq!(reply[0], 0xff);
        assert_eq!(e.state(), SessionState::Connected);
        assert_eq!(e.handle_packet(&[0x42], 0).as_deref(), Some(&[0xfe, 0x42][..]));
    }

    #[test]
    fn capabilities_follow_transport() {
        let mut e = engine(0);
        e.limit_packet_size(64).unwrap();
        let Ok(Response::Connected(caps)) = e.execute(Command::Connect, 0) else {
            panic!("no capabilities");
        };
        assert_eq!(caps.max_packet, 64);
        assert_eq!(caps.max_chunk, 60);
        assert_eq!(caps.write_size, 4);

        e.limit_packet_size(MIN_PACKET).unwrap();
        let Ok(Response::Connected(caps)) = e.execute(Command::Connect, 0) else {
            panic!("no capabilities");
        };
        assert_eq!(caps.max_chunk, 4);
        assert_eq!(e.limit_packet_size(MIN_PACKET - 1), Err(Error::Defect));
        assert_eq!(e.max_packet(), MIN_PACKET);
    }

    #[test]
    fn busy_while_erasing() {
        let mut e = engine(3);
        e.execute(Command::Connect, 0).unwrap();
        let erase = Command::EraseRegion {
            start: 0x0800_4000,
            length: 0x8000,
        };
        assert_eq!(e.submit(erase, 1), Outcome::Pending);
        assert_eq!(e.state(), SessionState::Erasing);
        assert_eq!(
            e.submit(Command::Connect, 2),
            Outcome::Done(Err(Error::AlreadyBusy))
        );
        assert_eq!(
            e.submit(Command::Disconnect, 2),
            Outcome::Done(Err(Error::UnsafeToDisconnect))
        );
        assert_eq!(e.submit(erase, 2), Outcome::Done(Err(Error::Busy)));

        let mut result = None;
        while result.is_none() {
            result = e.poll(1);
        }
        assert_eq!(result, Some(Ok(Response::Ack)));
        assert_eq!(e.state(), SessionState::Connected);
        assert_eq!(e.ledger().status, LedgerStatus::EraseComplete);
        assert_eq!(e.flash().nvm().stats().erases, vec![0x0800_4000, 0x0800_8000]);
    }

    #[test]
    fn reset_waits_for_sector_boundary() {
        let mut e = engine(2);
        e.execute(Command::Connect, 0).unwrap();
        let erase = Command::EraseRegion {
            start: 0x0800_4000,
            length: 0xc000,
        };
        assert_eq!(e.submit(erase, 1), Outcome::Pending);
        assert_eq!(e.submit(Command::Reset, 1), Outcome::Done(Ok(Response::Ack)));
        assert!(!e.take_reset());

        let mut result = None;
        while result.is_none() {
            result = e.poll(1);
        }
        assert_eq!(result, Some(Err(Error::Aborted)));
        assert!(e.take_reset());
        // Only the sector in progress was finished.
        assert_eq!(e.flash().nvm().stats().erases, vec![0x0800_4000]);
        assert_eq!(e.ledger().status, LedgerStatus::InProgress);
    }

    #[test]
    fn abort_clears_this_sessions_update() {
        let mut e = engine(0);
        e.execute(Command::Connect, 0).unwrap();
        e.execute(
            Command::EraseRegion {
                start: 0x0800_4000,
                length: 0x4000,
            },
            0,
        )
        .unwrap();
        assert_eq!(e.execute(Command::Abort, 0), Ok(Response::Ack));
        assert_eq!(e.ledger().status, LedgerStatus::Empty);
        assert_eq!(
            e.execute(
                Command::ProgramChunk {
                    address: 0x0800_4000,
                    data: &[0; 4]
                },
                0
            ),
            Err(Error::NotErased)
        );
    }

    #[test]
    fn inactivity_drops_session() {
        let mut e = engine(0);
        e.execute(Command::Connect, 100).unwrap();
        assert!(!e.check_timeout(100 + 9_999));
        assert!(e.check_timeout(100 + 10_000));
        assert_eq!(e.state(), SessionState::Idle);
        assert_eq!(e.submit(Command::GetStatus, 20_000), Outcome::Ignored);
    }

    #[test]
    fn extension_without_session() {
        let mut e = engine(0);
        assert_eq!(
            e.submit(Command::ExtendBackdoor { ms: 700 }, 0),
            Outcome::Done(Ok(Response::Ack))
        );
        assert_eq!(e.take_extension(), Some(700));
        assert_eq!(e.take_extension(), None);
        assert_eq!(e.state(), SessionState::Idle);
    }
}
