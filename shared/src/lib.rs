//! Wire protocol shared by the CTF game server and its clients.
//!
//! Every datagram is a sequence of `(opcode, payload)` frames. Payload sizes
//! are fixed per opcode, so frames are self-delimiting and can be packed back
//! to back. Server to client datagrams carry a leading count byte in front of
//! the frames; client to server datagrams do not.
//!
//! Multi-byte payload fields are little-endian on the wire. Payload structs are
//! encoded with bincode's fixed-int layout, which matches that regardless of
//! the host byte order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 7777;
pub const MAX_NAME: usize = 16;
pub const MAX_STATUS_MSG: usize = 32;
/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM: usize = 65_507;

pub const VIEWPORT_SIZE: usize = 8;
pub const MAP_XY_SIZE: usize = 4;
pub const STATUS_MSG_SIZE: usize = 1 + MAX_STATUS_MSG;
pub const PLAYER_ID_MSG_SIZE: usize = 1 + MAX_NAME;
pub const SPRITE_MSG_SIZE: usize = 5;
pub const SPRITE_MSG16_SIZE: usize = 7;
pub const REMOVE_SPRITE_MSG_SIZE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("empty buffer")]
    Empty,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("opcode {0:#04x} is not valid inside a frame stream")]
    UnexpectedOpcode(u8),
    #[error("opcode {opcode:#04x} needs {needed} payload bytes, {available} left")]
    Truncated {
        opcode: u8,
        needed: usize,
        available: usize,
    },
    #[error("batch declares {declared} frames but carries {found}")]
    CountMismatch { declared: u8, found: usize },
    #[error("payload encoding failed: {0}")]
    Payload(String),
}

/// Opcodes sent from client to server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientOpcode {
    Hello = 0x01,
    SpectatorHello = 0x02,
    Start = 0x03,
    Control = 0x04,
    Bye = 0x05,
    ClientReady = 0x06,
    Viewport = 0x07,
    Ping = 0x08,
    TeamRequest = 0x09,
    MatchmakingStart = 0x0a,
    MatchmakingStop = 0x0b,
    MatchmakingReady = 0x0c,
    ServerKill = 0xff,
}

impl ClientOpcode {
    /// Fixed payload size following the opcode byte. The join opcodes carry
    /// handshake data of their own length and report 0 here.
    pub const fn payload_len(self) -> usize {
        match self {
            ClientOpcode::Control | ClientOpcode::TeamRequest => 1,
            ClientOpcode::Viewport => VIEWPORT_SIZE,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for ClientOpcode {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        let opcode = match byte {
            0x01 => ClientOpcode::Hello,
            0x02 => ClientOpcode::SpectatorHello,
            0x03 => ClientOpcode::Start,
            0x04 => ClientOpcode::Control,
            0x05 => ClientOpcode::Bye,
            0x06 => ClientOpcode::ClientReady,
            0x07 => ClientOpcode::Viewport,
            0x08 => ClientOpcode::Ping,
            0x09 => ClientOpcode::TeamRequest,
            0x0a => ClientOpcode::MatchmakingStart,
            0x0b => ClientOpcode::MatchmakingStop,
            0x0c => ClientOpcode::MatchmakingReady,
            0xff => ClientOpcode::ServerKill,
            other => return Err(CodecError::UnknownOpcode(other)),
        };
        Ok(opcode)
    }
}

/// Opcodes sent from server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerOpcode {
    /// Same byte as the client's ping so clients can echo it back unchanged.
    Ping = 0x08,
    AckOk = 0x40,
    AckUnable = 0x41,
    AckTooMany = 0x42,
    ByeAck = 0x43,
    StartAck = 0x44,
    ChangeViewport = 0x45,
    StatusMessage = 0x46,
    PlayerId = 0x47,
    /// Object position in viewport-relative 8-bit coordinates.
    Sprite = 0x48,
    /// Object position in 16-bit map coordinates.
    Sprite16 = 0x49,
    RemoveSprite = 0x4a,
}

impl ServerOpcode {
    pub const fn payload_len(self) -> usize {
        match self {
            ServerOpcode::StartAck | ServerOpcode::ChangeViewport => MAP_XY_SIZE,
            ServerOpcode::Ping => 1,
            ServerOpcode::StatusMessage => STATUS_MSG_SIZE,
            ServerOpcode::PlayerId => PLAYER_ID_MSG_SIZE,
            ServerOpcode::Sprite => SPRITE_MSG_SIZE,
            ServerOpcode::Sprite16 => SPRITE_MSG16_SIZE,
            ServerOpcode::RemoveSprite => REMOVE_SPRITE_MSG_SIZE,
            ServerOpcode::AckOk
            | ServerOpcode::AckUnable
            | ServerOpcode::AckTooMany
            | ServerOpcode::ByeAck => 0,
        }
    }
}

impl TryFrom<u8> for ServerOpcode {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        let opcode = match byte {
            0x08 => ServerOpcode::Ping,
            0x40 => ServerOpcode::AckOk,
            0x41 => ServerOpcode::AckUnable,
            0x42 => ServerOpcode::AckTooMany,
            0x43 => ServerOpcode::ByeAck,
            0x44 => ServerOpcode::StartAck,
            0x45 => ServerOpcode::ChangeViewport,
            0x46 => ServerOpcode::StatusMessage,
            0x47 => ServerOpcode::PlayerId,
            0x48 => ServerOpcode::Sprite,
            0x49 => ServerOpcode::Sprite16,
            0x4a => ServerOpcode::RemoveSprite,
            other => return Err(CodecError::UnknownOpcode(other)),
        };
        Ok(opcode)
    }
}

/// Per-session state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PlayerFlags(u8);

impl PlayerFlags {
    pub const NONE: Self = Self(0);
    pub const SPECTATOR: Self = Self(0x01);
    pub const PLAYER_READY: Self = Self(0x02);
    pub const RUNNING: Self = Self(0x04);
    pub const MATCHMAKING: Self = Self(0x08);
    pub const NEW_VIEWPORT: Self = Self(0x10);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when any bit of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for PlayerFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PlayerFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A fixed-size payload struct with a bincode wire image.
pub trait Payload: Serialize + DeserializeOwned {
    const SIZE: usize;

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Payload(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < Self::SIZE {
            return Err(CodecError::Payload(format!(
                "need {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        bincode::deserialize(&bytes[..Self::SIZE]).map_err(|e| CodecError::Payload(e.to_string()))
    }
}

/// Visible map region reported by a client, in map tile coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub tx: u16,
    pub ty: u16,
    pub bx: u16,
    pub by: u16,
}

impl Payload for Viewport {
    const SIZE: usize = VIEWPORT_SIZE;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MapXY {
    pub mapx: u16,
    pub mapy: u16,
}

impl Payload for MapXY {
    const SIZE: usize = MAP_XY_SIZE;
}

/// One line for the client's message area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMsg {
    pub len: u8,
    pub text: [u8; MAX_STATUS_MSG],
}

impl StatusMsg {
    /// Truncates to `MAX_STATUS_MSG - 1` bytes on a char boundary.
    pub fn new(text: &str) -> Self {
        let text_bytes = fixed_str::<MAX_STATUS_MSG>(text);
        let len = text_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_STATUS_MSG);
        Self {
            len: len as u8,
            text: text_bytes,
        }
    }

    pub fn text(&self) -> String {
        let len = (self.len as usize).min(MAX_STATUS_MSG);
        String::from_utf8_lossy(&self.text[..len]).into_owned()
    }
}

impl Payload for StatusMsg {
    const SIZE: usize = STATUS_MSG_SIZE;
}

/// Associates a slot number with a player name, sent to spectators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerIdMsg {
    pub owner_id: u8,
    pub name: [u8; MAX_NAME],
}

impl PlayerIdMsg {
    pub fn new(owner_id: u8, name: &str) -> Self {
        Self {
            owner_id,
            name: fixed_str::<MAX_NAME>(name),
        }
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }
}

impl Payload for PlayerIdMsg {
    const SIZE: usize = PLAYER_ID_MSG_SIZE;
}

/// Places or moves a game object on the client's screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpriteMsg {
    pub objid: u8,
    pub x: u8,
    pub y: u8,
    pub id: u8,
    pub rotation: u8,
}

impl Payload for SpriteMsg {
    const SIZE: usize = SPRITE_MSG_SIZE;
}

/// Like [`SpriteMsg`], for objects addressed in map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpriteMsg16 {
    pub objid: u8,
    pub x: u16,
    pub y: u16,
    pub id: u8,
    pub rotation: u8,
}

impl Payload for SpriteMsg16 {
    const SIZE: usize = SPRITE_MSG16_SIZE;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoveSpriteMsg {
    pub objid: u8,
    /// Nonzero when the object was destroyed rather than moved out of view.
    pub reason: u8,
}

impl Payload for RemoveSpriteMsg {
    const SIZE: usize = REMOVE_SPRITE_MSG_SIZE;
}

/// Copies `s` into a NUL-padded array, keeping room for one terminating NUL.
pub fn fixed_str<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let mut end = s.len().min(N.saturating_sub(1));
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].copy_from_slice(&s.as_bytes()[..end]);
    out
}

/// Reads a NUL-terminated (or field-length) name, at most `MAX_NAME` bytes.
pub fn decode_name(bytes: &[u8]) -> String {
    let field = &bytes[..bytes.len().min(MAX_NAME)];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// A single client to server frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFrame {
    Start,
    Control(u8),
    Bye,
    ClientReady,
    Viewport(Viewport),
    Ping,
    TeamRequest(u8),
    MatchmakingStart,
    MatchmakingStop,
    MatchmakingReady,
    ServerKill,
}

impl ClientFrame {
    pub fn opcode(&self) -> ClientOpcode {
        match self {
            ClientFrame::Start => ClientOpcode::Start,
            ClientFrame::Control(_) => ClientOpcode::Control,
            ClientFrame::Bye => ClientOpcode::Bye,
            ClientFrame::ClientReady => ClientOpcode::ClientReady,
            ClientFrame::Viewport(_) => ClientOpcode::Viewport,
            ClientFrame::Ping => ClientOpcode::Ping,
            ClientFrame::TeamRequest(_) => ClientOpcode::TeamRequest,
            ClientFrame::MatchmakingStart => ClientOpcode::MatchmakingStart,
            ClientFrame::MatchmakingStop => ClientOpcode::MatchmakingStop,
            ClientFrame::MatchmakingReady => ClientOpcode::MatchmakingReady,
            ClientFrame::ServerKill => ClientOpcode::ServerKill,
        }
    }

    /// Decodes the frame at the start of `buf`, returning it with the number
    /// of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (&first, rest) = buf.split_first().ok_or(CodecError::Empty)?;
        let opcode = ClientOpcode::try_from(first)?;
        let needed = opcode.payload_len();
        if rest.len() < needed {
            return Err(CodecError::Truncated {
                opcode: first,
                needed,
                available: rest.len(),
            });
        }
        let payload = &rest[..needed];

        let frame = match opcode {
            ClientOpcode::Start => ClientFrame::Start,
            ClientOpcode::Control => ClientFrame::Control(payload[0]),
            ClientOpcode::Bye => ClientFrame::Bye,
            ClientOpcode::ClientReady => ClientFrame::ClientReady,
            ClientOpcode::Viewport => ClientFrame::Viewport(Viewport::from_bytes(payload)?),
            ClientOpcode::Ping => ClientFrame::Ping,
            ClientOpcode::TeamRequest => ClientFrame::TeamRequest(payload[0]),
            ClientOpcode::MatchmakingStart => ClientFrame::MatchmakingStart,
            ClientOpcode::MatchmakingStop => ClientFrame::MatchmakingStop,
            ClientOpcode::MatchmakingReady => ClientFrame::MatchmakingReady,
            ClientOpcode::ServerKill => ClientFrame::ServerKill,
            ClientOpcode::Hello | ClientOpcode::SpectatorHello => {
                return Err(CodecError::UnexpectedOpcode(first))
            }
        };

        Ok((frame, 1 + needed))
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.push(self.opcode() as u8);
        match self {
            ClientFrame::Control(value) | ClientFrame::TeamRequest(value) => out.push(*value),
            ClientFrame::Viewport(view) => out.extend_from_slice(&view.to_bytes()?),
            _ => {}
        }
        Ok(())
    }
}

/// Concatenates frames into one client datagram.
pub fn encode_frames(frames: &[ClientFrame]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for frame in frames {
        frame.encode(&mut out)?;
    }
    Ok(out)
}

/// Walks a frame stream. Yields at most one error, after which it stops.
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        self.buf
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Result<ClientFrame, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }
        match ClientFrame::decode(self.buf) {
            Ok((frame, used)) => {
                self.buf = &self.buf[used..];
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for FrameReader<'_> {}

/// How the first byte of an inbound datagram asks to be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram<'a> {
    Join { spectator: bool, hello: &'a [u8] },
    Frames(&'a [u8]),
}

impl<'a> Datagram<'a> {
    pub fn classify(buf: &'a [u8]) -> Self {
        match buf.split_first() {
            Some((&op, hello)) if op == ClientOpcode::Hello as u8 => Datagram::Join {
                spectator: false,
                hello,
            },
            Some((&op, hello)) if op == ClientOpcode::SpectatorHello as u8 => Datagram::Join {
                spectator: true,
                hello,
            },
            _ => Datagram::Frames(buf),
        }
    }
}

/// Join request: opcode followed by the NUL-padded player name.
pub fn encode_hello(name: &str, spectator: bool) -> Vec<u8> {
    let opcode = if spectator {
        ClientOpcode::SpectatorHello
    } else {
        ClientOpcode::Hello
    };
    let mut out = Vec::with_capacity(1 + MAX_NAME);
    out.push(opcode as u8);
    out.extend_from_slice(&fixed_str::<MAX_NAME>(name));
    out
}

/// A frame inside a server batch, borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerFrame<'a> {
    pub opcode: ServerOpcode,
    pub payload: &'a [u8],
}

/// Splits a `[count][opcode][payload]...` datagram from the server.
pub fn decode_batch(buf: &[u8]) -> Result<Vec<ServerFrame<'_>>, CodecError> {
    let (&count, mut rest) = buf.split_first().ok_or(CodecError::Empty)?;
    let mut frames = Vec::with_capacity(count as usize);

    while let Some((&op, tail)) = rest.split_first() {
        let opcode = ServerOpcode::try_from(op)?;
        let needed = opcode.payload_len();
        if tail.len() < needed {
            return Err(CodecError::Truncated {
                opcode: op,
                needed,
                available: tail.len(),
            });
        }
        frames.push(ServerFrame {
            opcode,
            payload: &tail[..needed],
        });
        rest = &tail[needed..];
    }

    if frames.len() != count as usize {
        return Err(CodecError::CountMismatch {
            declared: count,
            found: frames.len(),
        });
    }
    Ok(frames)
}
