//! Wire format.
//!
//! Every packet starts with a one byte opcode, followed by fixed little endian
//! fields.  Replies start with [`REPLY_OK`] followed by any result, or with
//! [`REPLY_ERR`] and a single [`Error::code`].
//!
//! | Command           | Opcode | Body                                  |
//! |-------------------|--------|---------------------------------------|
//! | Connect           | `0xff` | (optional mode byte, ignored)         |
//! | Disconnect        | `0xfe` |                                       |
//! | GetStatus         | `0xfd` |                                       |
//! | ExtendBackdoor    | `0xfc` | milliseconds: u32                     |
//! | Abort             | `0xfb` |                                       |
//! | GetId             | `0xfa` |                                       |
//! | GetSeed           | `0xf8` |                                       |
//! | Unlock            | `0xf7` | key (1..=MAX_KEY)                     |
//! | SetMta            | `0xf6` | address: u32                          |
//! | Upload            | `0xf5` | length: u8                            |
//! | ShortUpload       | `0xf4` | length: u8, address: u32              |
//! | BuildChecksum     | `0xf3` | length: u32                           |
//! | FinalizeAndVerify | `0xd3` | kind: u8, checksum (4 or 32 bytes)    |
//! | EraseRegion       | `0xd1` | start: u32, length: u32               |
//! | EraseFromMta      | `0xd1` | length: u32                           |
//! | ProgramChunk      | `0xd0` | address: u32, data (1..=MAX_CHUNK)    |
//! | ProgramNext       | `0xca` | data (1..=MAX_CHUNK)                  |
//! | Reset             | `0xcf` |                                       |
//!
//! Every reply fits in [`MIN_PACKET`] bytes, except uploads, which never ask
//! for more than the link carries, and the long form of a status reply, which
//! is only sent where it fits.  A link of `MIN_PACKET` bytes, such as classic
//! CAN, can therefore drive a whole update with `EraseFromMta`, `ProgramNext`
//! and a CRC-32 finalize.  SHA-256 finalize needs 34 bytes.
//!
//! Uploads and `BuildChecksum` work from the memory transfer address (MTA),
//! which `SetMta` and `ShortUpload` set and uploads move past what they read.
//! `GetId` points it at the station id instead of at memory.

use byteorder::{ByteOrder, LittleEndian};
use storage::Region;

use crate::checksum::{Checksum, ChecksumKind};
use crate::engine::SessionState;
use crate::ledger::{LedgerStatus, TargetId};
use crate::{Error, Result};

pub const PROTOCOL_VERSION: u8 = 1;

/// Largest data payload of a single ProgramChunk or ProgramNext.
pub const MAX_CHUNK: usize = 512;

/// Opcode and address ahead of the chunk data.
pub const CHUNK_HEADER: usize = 5;

/// Largest packet in either direction.
pub const MAX_PACKET: usize = CHUNK_HEADER + MAX_CHUNK;

/// Smallest link the engine can be driven over.
pub const MIN_PACKET: usize = 8;

/// Largest seed handed out, and largest key accepted.
pub const MAX_SEED: usize = MIN_PACKET - 1;
pub const MAX_KEY: usize = MIN_PACKET - 1;

/// Most bytes a single upload can return.
pub const MAX_UPLOAD: usize = MAX_PACKET - 1;

/// Length of the long form of a status reply.
pub const STATUS_LEN: usize = 16;

pub const REPLY_OK: u8 = 0xff;
pub const REPLY_ERR: u8 = 0xfe;

const LOCKED: u8 = 0x01;

pub type Packet = heapless::Vec<u8, MAX_PACKET>;
pub type Seed = heapless::Vec<u8, MAX_SEED>;
pub type UploadData = heapless::Vec<u8, MAX_UPLOAD>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Opcode {
    Connect = 0xff,
    Disconnect = 0xfe,
    GetStatus = 0xfd,
    ExtendBackdoor = 0xfc,
    Abort = 0xfb,
    GetId = 0xfa,
    GetSeed = 0xf8,
    Unlock = 0xf7,
    SetMta = 0xf6,
    Upload = 0xf5,
    ShortUpload = 0xf4,
    BuildChecksum = 0xf3,
    FinalizeAndVerify = 0xd3,
    EraseRegion = 0xd1,
    ProgramChunk = 0xd0,
    Reset = 0xcf,
    ProgramNext = 0xca,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Opcode> {
        let op = match value {
            0xff => Opcode::Connect,
            0xfe => Opcode::Disconnect,
            0xfd => Opcode::GetStatus,
            0xfc => Opcode::ExtendBackdoor,
            0xfb => Opcode::Abort,
            0xfa => Opcode::GetId,
            0xf8 => Opcode::GetSeed,
            0xf7 => Opcode::Unlock,
            0xf6 => Opcode::SetMta,
            0xf5 => Opcode::Upload,
            0xf4 => Opcode::ShortUpload,
            0xf3 => Opcode::BuildChecksum,
            0xd3 => Opcode::FinalizeAndVerify,
            0xd1 => Opcode::EraseRegion,
            0xd0 => Opcode::ProgramChunk,
            0xcf => Opcode::Reset,
            0xca => Opcode::ProgramNext,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command<'a> {
    Connect,
    Disconnect,
    GetStatus,
    ExtendBackdoor { ms: u32 },
    Abort,
    GetId,
    GetSeed,
    Unlock { key: &'a [u8] },
    SetMta { address: u32 },
    Upload { length: u8 },
    ShortUpload { length: u8, address: u32 },
    BuildChecksum { length: u32 },
    EraseRegion { start: u32, length: u32 },
    /// EraseRegion starting at the memory transfer address.
    EraseFromMta { length: u32 },
    ProgramChunk { address: u32, data: &'a [u8] },
    /// Program at the address the previous chunk ended at.
    ProgramNext { data: &'a [u8] },
    FinalizeAndVerify { expected: Checksum },
    Reset,
}

impl<'a> Command<'a> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Connect => Opcode::Connect,
            Command::Disconnect => Opcode::Disconnect,
            Command::GetStatus => Opcode::GetStatus,
            Command::ExtendBackdoor { .. } => Opcode::ExtendBackdoor,
            Command::Abort => Opcode::Abort,
            Command::GetId => Opcode::GetId,
            Command::GetSeed => Opcode::GetSeed,
            Command::Unlock { .. } => Opcode::Unlock,
            Command::SetMta { .. } => Opcode::SetMta,
            Command::Upload { .. } => Opcode::Upload,
            Command::ShortUpload { .. } => Opcode::ShortUpload,
            Command::BuildChecksum { .. } => Opcode::BuildChecksum,
            Command::EraseRegion { .. } | Command::EraseFromMta { .. } => Opcode::EraseRegion,
            Command::ProgramChunk { .. } => Opcode::ProgramChunk,
            Command::ProgramNext { .. } => Opcode::ProgramNext,
            Command::FinalizeAndVerify { .. } => Opcode::FinalizeAndVerify,
            Command::Reset => Opcode::Reset,
        }
    }

    /// Commands that change code memory or the ledger.  Refused while the
    /// device is locked.
    pub fn needs_unlock(&self) -> bool {
        matches!(
            self,
            Command::Abort
                | Command::EraseRegion { .. }
                | Command::EraseFromMta { .. }
                | Command::ProgramChunk { .. }
                | Command::ProgramNext { .. }
                | Command::FinalizeAndVerify { .. }
        )
    }

    pub fn decode(packet: &'a [u8]) -> Result<Command<'a>> {
        let (&op, body) = packet.split_first().ok_or(Error::Malformed)?;
        let op = Opcode::from_u8(op).ok_or(Error::UnknownCommand)?;
        let exact = |len: usize| {
            if body.len() == len {
                Ok(())
            } else {
                Err(Error::Malformed)
            }
        };
        let between = |min: usize, max: usize| {
            if (min..=max).contains(&body.len()) {
                Ok(())
            } else {
                Err(Error::Malformed)
            }
        };
        let cmd = match op {
            Opcode::Connect => {
                between(0, 1)?;
                Command::Connect
            }
            Opcode::Disconnect => {
                exact(0)?;
                Command::Disconnect
            }
            Opcode::GetStatus => {
                exact(0)?;
                Command::GetStatus
            }
            Opcode::ExtendBackdoor => {
                exact(4)?;
                Command::ExtendBackdoor {
                    ms: LittleEndian::read_u32(body),
                }
            }
            Opcode::Abort => {
                exact(0)?;
                Command::Abort
            }
            Opcode::GetId => {
                exact(0)?;
                Command::GetId
            }
            Opcode::GetSeed => {
                exact(0)?;
                Command::GetSeed
            }
            Opcode::Unlock => {
                between(1, MAX_KEY)?;
                Command::Unlock { key: body }
            }
            Opcode::SetMta => {
                exact(4)?;
                Command::SetMta {
                    address: LittleEndian::read_u32(body),
                }
            }
            Opcode::Upload => {
                exact(1)?;
                Command::Upload { length: body[0] }
            }
            Opcode::ShortUpload => {
                exact(5)?;
                Command::ShortUpload {
                    length: body[0],
                    address: LittleEndian::read_u32(&body[1..5]),
                }
            }
            Opcode::BuildChecksum => {
                exact(4)?;
                Command::BuildChecksum {
                    length: LittleEndian::read_u32(body),
                }
            }
            Opcode::EraseRegion => match body.len() {
                4 => Command::EraseFromMta {
                    length: LittleEndian::read_u32(body),
                },
                8 => Command::EraseRegion {
                    start: LittleEndian::read_u32(&body[0..4]),
                    length: LittleEndian::read_u32(&body[4..8]),
                },
                _ => return Err(Error::Malformed),
            },
            Opcode::ProgramChunk => {
                between(5, 4 + MAX_CHUNK)?;
                Command::ProgramChunk {
                    address: LittleEndian::read_u32(&body[0..4]),
                    data: &body[4..],
                }
            }
            Opcode::ProgramNext => {
                between(1, MAX_CHUNK)?;
                Command::ProgramNext { data: body }
            }
            Opcode::FinalizeAndVerify => {
                let (&kind, sum) = body.split_first().ok_or(Error::Malformed)?;
                let kind = ChecksumKind::from_code(kind).ok_or(Error::Malformed)?;
                Command::FinalizeAndVerify {
                    expected: Checksum::read_from(kind, sum)?,
                }
            }
            Opcode::Reset => {
                exact(0)?;
                Command::Reset
            }
        };
        Ok(cmd)
    }

    /// Host side encoding.
    pub fn encode(&self) -> Result<Packet> {
        let mut p = Packet::new();
        put(&mut p, &[self.opcode() as u8])?;
        match self {
            Command::ExtendBackdoor { ms } => put_u32(&mut p, *ms)?,
            Command::Unlock { key } => put(&mut p, key)?,
            Command::SetMta { address } => put_u32(&mut p, *address)?,
            Command::Upload { length } => put(&mut p, &[*length])?,
            Command::ShortUpload { length, address } => {
                put(&mut p, &[*length])?;
                put_u32(&mut p, *address)?;
            }
            Command::BuildChecksum { length } => put_u32(&mut p, *length)?,
            Command::EraseRegion { start, length } => {
                put_u32(&mut p, *start)?;
                put_u32(&mut p, *length)?;
            }
            Command::EraseFromMta { length } => put_u32(&mut p, *length)?,
            Command::ProgramChunk { address, data } => {
                put_u32(&mut p, *address)?;
                put(&mut p, data)?;
            }
            Command::ProgramNext { data } => put(&mut p, data)?,
            Command::FinalizeAndVerify { expected } => {
                let kind = expected.kind();
                let mut sum = [0u8; Checksum::MAX_LEN];
                expected.write_to(&mut sum[..kind.len()]);
                put(&mut p, &[kind.code()])?;
                put(&mut p, &sum[..kind.len()])?;
            }
            _ => (),
        }
        Ok(p)
    }
}

fn put(p: &mut Packet, bytes: &[u8]) -> Result<()> {
    p.extend_from_slice(bytes).map_err(|_| Error::Malformed)
}

fn put_u32(p: &mut Packet, value: u32) -> Result<()> {
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, value);
    put(p, &word)
}

fn put_u16(p: &mut Packet, value: u16) -> Result<()> {
    let mut half = [0u8; 2];
    LittleEndian::write_u16(&mut half, value);
    put(p, &half)
}

/// What a Connect reply tells the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities {
    pub version: u8,
    /// Largest ProgramNext payload the link carries, in whole write units.
    /// A ProgramChunk carries four bytes less.
    pub max_chunk: u16,
    pub max_packet: u16,
    /// Always a power of two.  Sent as its logarithm.
    pub write_size: u16,
    pub checksum: ChecksumKind,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    pub session: SessionState,
    /// Programming is refused until the host unlocks.
    pub locked: bool,
    pub target: TargetId,
    pub ledger: LedgerStatus,
    pub committed: u32,
    /// Base and length of the update.  Left out on links shorter than
    /// [`STATUS_LEN`].
    pub region: Option<Region>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    Connected(Capabilities),
    Ack,
    Status(Status),
    /// The image checked out, and will be started once the host lets go.
    Finalized,
    /// Length of the station id, which uploads now read.
    Id { length: u32 },
    /// Empty when there is nothing to unlock.
    Seed(Seed),
    Data(UploadData),
    /// CRC-32 of a block read back from memory.
    BlockChecksum(u32),
}

impl Response {
    /// Encode for a link carrying at most `max_packet` bytes.
    pub fn encode(&self, max_packet: usize) -> Packet {
        let mut p = Packet::new();
        match self.write(&mut p, max_packet) {
            Ok(()) => p,
            Err(e) => error_reply(e),
        }
    }

    fn write(&self, p: &mut Packet, max_packet: usize) -> Result<()> {
        put(p, &[REPLY_OK])?;
        match self {
            Response::Connected(caps) => {
                put(p, &[caps.version])?;
                put_u16(p, caps.max_chunk)?;
                put_u16(p, caps.max_packet)?;
                put(p, &[caps.write_size.trailing_zeros() as u8, caps.checksum.code()])?;
            }
            Response::Ack | Response::Finalized => (),
            Response::Status(status) => {
                let flags = if status.locked { LOCKED } else { 0 };
                let ledger = (status.target as u8) << 4 | status.ledger as u8;
                put(p, &[status.session as u8, flags, ledger])?;
                if let Some(region) = status.region.filter(|_| max_packet >= STATUS_LEN) {
                    put_u32(p, region.start())?;
                    put_u32(p, region.len())?;
                }
                put_u32(p, status.committed)?;
            }
            Response::Id { length } => {
                put(p, &[0, 0, 0])?;
                put_u32(p, *length)?;
            }
            Response::Seed(seed) => put(p, seed)?,
            Response::Data(data) => put(p, data)?,
            Response::BlockChecksum(crc) => {
                put(p, &[ChecksumKind::Crc32.code(), 0, 0])?;
                put_u32(p, *crc)?;
            }
        }
        Ok(())
    }

    /// Host side decoding.  What a reply holds depends on the command it
    /// answers, so that has to be known.
    pub fn decode(to: Opcode, packet: &[u8]) -> Result<Response> {
        match packet {
            [REPLY_ERR, code] => Err(Error::from_code(*code).ok_or(Error::Malformed)?),
            [REPLY_OK, body @ ..] => Response::decode_body(to, body),
            _ => Err(Error::Malformed),
        }
    }

    fn decode_body(to: Opcode, body: &[u8]) -> Result<Response> {
        let response = match (to, body.len()) {
            (Opcode::Connect, 7) => Response::Connected(Capabilities {
                version: body[0],
                max_chunk: LittleEndian::read_u16(&body[1..3]),
                max_packet: LittleEndian::read_u16(&body[3..5]),
                write_size: 1u16
                    .checked_shl(u32::from(body[5]))
                    .ok_or(Error::Malformed)?,
                checksum: ChecksumKind::from_code(body[6]).ok_or(Error::Malformed)?,
            }),
            (Opcode::GetStatus, 7) | (Opcode::GetStatus, 15) => {
                let region = if body.len() == STATUS_LEN - 1 {
                    let base = LittleEndian::read_u32(&body[3..7]);
                    let length = LittleEndian::read_u32(&body[7..11]);
                    Some(Region::checked(base, length).ok_or(Error::Malformed)?)
                } else {
                    None
                };
                Response::Status(Status {
                    session: SessionState::from_u8(body[0]).ok_or(Error::Malformed)?,
                    locked: body[1] & LOCKED != 0,
                    target: TargetId::from_u8(body[2] >> 4).ok_or(Error::Malformed)?,
                    ledger: LedgerStatus::from_u8(body[2] & 0x0f).ok_or(Error::Malformed)?,
                    committed: LittleEndian::read_u32(&body[body.len() - 4..]),
                    region,
                })
            }
            (Opcode::GetId, 7) => Response::Id {
                length: LittleEndian::read_u32(&body[3..7]),
            },
            (Opcode::BuildChecksum, 7) => {
                Response::BlockChecksum(LittleEndian::read_u32(&body[3..7]))
            }
            (Opcode::GetSeed, _) => {
                Response::Seed(Seed::from_slice(body).map_err(|_| Error::Malformed)?)
            }
            (Opcode::Upload | Opcode::ShortUpload, _) => {
                Response::Data(UploadData::from_slice(body).map_err(|_| Error::Malformed)?)
            }
            (Opcode::FinalizeAndVerify, 0) => Response::Finalized,
            (Opcode::Connect | Opcode::GetStatus | Opcode::GetId | Opcode::BuildChecksum, _) => {
                return Err(Error::Malformed)
            }
            (_, 0) => Response::Ack,
            _ => return Err(Error::Malformed),
        };
        Ok(response)
    }
}

fn error_reply(e: Error) -> Packet {
    let mut p = Packet::new();
    // Two bytes always fit.
    let _ = p.extend_from_slice(&[REPLY_ERR, e.code()]);
    p
}

/// Encode a command result for a link carrying at most `max_packet` bytes.
pub fn reply(result: &Result<Response>, max_packet: usize) -> Packet {
    match result {
        Ok(response) => response.encode(max_packet),
        Err(e) => error_reply(*e),
    }
}
