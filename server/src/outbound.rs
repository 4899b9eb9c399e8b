//! Per-session accumulator packing outbound frames into one datagram per tick.
//!
//! Layout is `[count][opcode][payload][opcode][payload]...`. The buffer never
//! grows past its capacity: a frame that does not fit is rejected whole and
//! the buffer is left byte-for-byte as it was.

use crate::error::{EnqueueError, FlushError};
use crate::transport::Transport;
use shared::{
    MapXY, Payload, PlayerIdMsg, RemoveSpriteMsg, ServerOpcode, SpriteMsg, SpriteMsg16, StatusMsg,
};
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBuffer {
    buf: Vec<u8>,
    capacity: usize,
}

impl OutboundBuffer {
    /// `capacity` counts the leading count byte and must be at least 1.
    pub fn new(capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.push(0);
        Self { buf, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently written, count byte included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn frame_count(&self) -> u8 {
        self.buf[0]
    }

    /// True when no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.frame_count() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn enqueue(&mut self, opcode: ServerOpcode, payload: &[u8]) -> Result<(), EnqueueError> {
        debug_assert_eq!(payload.len(), opcode.payload_len());

        let needed = 1 + payload.len();
        if self.buf.len() + needed > self.capacity || self.frame_count() == u8::MAX {
            return Err(EnqueueError::Overflow {
                needed,
                used: self.buf.len(),
                capacity: self.capacity,
            });
        }

        self.buf[0] += 1;
        self.buf.push(opcode as u8);
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    pub fn enqueue_payload<P: Payload>(
        &mut self,
        opcode: ServerOpcode,
        payload: &P,
    ) -> Result<(), EnqueueError> {
        let bytes = payload.to_bytes()?;
        self.enqueue(opcode, &bytes)
    }

    pub fn add_ping(&mut self) -> Result<(), EnqueueError> {
        self.enqueue(ServerOpcode::Ping, &[0])
    }

    /// Tells the client where its player starts.
    pub fn add_init_game(&mut self, start: MapXY) -> Result<(), EnqueueError> {
        self.enqueue_payload(ServerOpcode::StartAck, &start)
    }

    /// Asks the client to move its viewport so that `(x, y)` is visible.
    pub fn add_change_viewport(&mut self, x: u16, y: u16) -> Result<(), EnqueueError> {
        self.enqueue_payload(ServerOpcode::ChangeViewport, &MapXY { mapx: x, mapy: y })
    }

    pub fn add_status(&mut self, text: &str) -> Result<(), EnqueueError> {
        self.enqueue_payload(ServerOpcode::StatusMessage, &StatusMsg::new(text))
    }

    pub fn add_player_id(&mut self, owner_id: u8, name: &str) -> Result<(), EnqueueError> {
        self.enqueue_payload(ServerOpcode::PlayerId, &PlayerIdMsg::new(owner_id, name))
    }

    pub fn add_sprite(&mut self, sprite: &SpriteMsg) -> Result<(), EnqueueError> {
        self.enqueue_payload(ServerOpcode::Sprite, sprite)
    }

    pub fn add_sprite16(&mut self, sprite: &SpriteMsg16) -> Result<(), EnqueueError> {
        self.enqueue_payload(ServerOpcode::Sprite16, sprite)
    }

    /// Tells the client an object is gone.
    pub fn add_destruction(&mut self, removal: &RemoveSpriteMsg) -> Result<(), EnqueueError> {
        self.enqueue_payload(ServerOpcode::RemoveSprite, removal)
    }

    pub fn clear(&mut self) {
        self.buf.truncate(1);
        self.buf[0] = 0;
    }

    /// Sends the batch as one datagram. Returns `Ok(false)` without sending
    /// when nothing is queued. The buffer is only cleared after a successful
    /// send.
    pub async fn flush<T: Transport>(
        &mut self,
        transport: &T,
        addr: SocketAddr,
    ) -> Result<bool, FlushError> {
        if self.is_empty() {
            return Ok(false);
        }
        transport.send_to(&self.buf, addr).await?;
        self.clear();
        Ok(true)
    }
}
