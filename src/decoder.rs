//! Streaming MIDI message decoder
//!
//! Rebuilds complete messages from packets that may split a message at any
//! byte. Handles running status, real-time bytes interleaved anywhere, and
//! SysEx payloads spanning any number of packets.
//!
//! One decoder belongs to exactly one open source endpoint. It holds no
//! shared state, so malformed input on one endpoint cannot disturb another.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{Error, MalformedReason, Result};
use crate::midi::{format_hex, status, MidiMessage};

/// Normalized message timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timestamp {
    /// Apply immediately (raw hardware timestamp 0)
    Now,
    /// Microseconds relative to the endpoint's open-time origin
    Micros(i64),
}

impl Timestamp {
    /// Signed sentinel value used when a plain integer is required
    pub const NOW_MICROS: i64 = -1;

    /// Normalize a raw device-clock timestamp against an origin.
    ///
    /// Stamps earlier than the origin clamp to 0, so a `Micros` value never
    /// collides with [`Self::NOW_MICROS`].
    pub fn normalize(raw_micros: u64, origin_micros: u64) -> Self {
        if raw_micros == 0 {
            return Timestamp::Now;
        }
        let elapsed = raw_micros.saturating_sub(origin_micros);
        Timestamp::Micros(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }

    /// Integer form; `Now` maps to -1, everything else is >= 0
    pub fn as_micros(&self) -> i64 {
        match *self {
            Timestamp::Now => Self::NOW_MICROS,
            Timestamp::Micros(us) => us,
        }
    }

    pub fn is_now(&self) -> bool {
        matches!(self, Timestamp::Now)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Now => write!(f, "now"),
            Timestamp::Micros(us) => write!(f, "{}us", us),
        }
    }
}

/// Message payload variants produced by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Channel voice or mode message; `data2` is 0 for one-byte messages
    ChannelVoice { status: u8, data1: u8, data2: u8 },
    /// System common message (MTC, song position, song select, tune request)
    SystemCommon { status: u8, data: SmallVec<[u8; 2]> },
    /// Single-byte system real-time message
    SystemRealTime { status: u8 },
    /// Full SysEx bytes including the leading 0xF0 and, when `complete`,
    /// the trailing 0xF7
    SystemExclusive { data: Vec<u8>, complete: bool },
}

/// A complete message with its normalized timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub kind: MessageKind,
    pub timestamp: Timestamp,
}

impl DecodedMessage {
    pub fn new(kind: MessageKind, timestamp: Timestamp) -> Self {
        Self { kind, timestamp }
    }

    /// Status byte of the message
    pub fn status(&self) -> u8 {
        match &self.kind {
            MessageKind::ChannelVoice { status, .. }
            | MessageKind::SystemCommon { status, .. }
            | MessageKind::SystemRealTime { status } => *status,
            MessageKind::SystemExclusive { .. } => status::SYSTEM_EXCLUSIVE,
        }
    }

    /// Wire bytes of the message
    pub fn bytes(&self) -> Vec<u8> {
        match &self.kind {
            MessageKind::ChannelVoice { status, data1, data2 } => {
                match status::expected_data_length(*status) {
                    Some(1) => vec![*status, *data1],
                    _ => vec![*status, *data1, *data2],
                }
            }
            MessageKind::SystemCommon { status, data } => {
                let mut bytes = Vec::with_capacity(data.len() + 1);
                bytes.push(*status);
                bytes.extend_from_slice(data);
                bytes
            }
            MessageKind::SystemRealTime { status } => vec![*status],
            MessageKind::SystemExclusive { data, .. } => data.clone(),
        }
    }

    /// Length in bytes on the wire
    pub fn wire_len(&self) -> usize {
        match &self.kind {
            MessageKind::SystemExclusive { data, .. } => data.len(),
            MessageKind::SystemRealTime { .. } => 1,
            MessageKind::SystemCommon { data, .. } => data.len() + 1,
            MessageKind::ChannelVoice { status, .. } => {
                status::expected_data_length(*status).unwrap_or(2) + 1
            }
        }
    }

    pub fn is_real_time(&self) -> bool {
        matches!(self.kind, MessageKind::SystemRealTime { .. })
    }

    /// Typed interpretation for display and routing
    pub fn to_midi(&self) -> Option<MidiMessage> {
        MidiMessage::parse(&self.bytes())
    }
}

impl fmt::Display for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_midi() {
            Some(msg) => write!(f, "[{}] {}", self.timestamp, msg),
            None => write!(f, "[{}] {}", self.timestamp, format_hex(&self.bytes())),
        }
    }
}

/// What to do with a SysEx message interrupted by another status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteSysex {
    /// Emit the partial message flagged `complete: false`
    #[default]
    Deliver,
    /// Drop the partial message silently
    Discard,
}

/// How a packet continues after a malformed byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Abort only the broken message and keep decoding the packet
    #[default]
    Resume,
    /// Drop the rest of the packet
    AbortPacket,
}

/// Decoder position within the byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    #[default]
    Idle,
    CollectingOneByte { status: u8 },
    CollectingFirstOfTwo { status: u8 },
    CollectingSecondOfTwo { status: u8, first: u8 },
    CollectingSysex,
}

impl DecoderState {
    /// Status byte of the message being collected (0 when idle)
    pub fn current_status(&self) -> u8 {
        match *self {
            DecoderState::Idle => 0,
            DecoderState::CollectingOneByte { status }
            | DecoderState::CollectingFirstOfTwo { status }
            | DecoderState::CollectingSecondOfTwo { status, .. } => status,
            DecoderState::CollectingSysex => status::SYSTEM_EXCLUSIVE,
        }
    }
}

/// Stateful byte-to-message reconstructor for one endpoint
#[derive(Debug)]
pub struct MessageDecoder {
    state: DecoderState,
    sysex: Vec<u8>,
    origin_micros: u64,
    incomplete_sysex: IncompleteSysex,
}

impl MessageDecoder {
    /// Create a decoder for an endpoint opened at `origin_micros`
    pub fn new(origin_micros: u64) -> Self {
        Self {
            state: DecoderState::Idle,
            sysex: Vec::new(),
            origin_micros,
            incomplete_sysex: IncompleteSysex::default(),
        }
    }

    pub fn with_incomplete_sysex(mut self, policy: IncompleteSysex) -> Self {
        self.incomplete_sysex = policy;
        self
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn origin_micros(&self) -> u64 {
        self.origin_micros
    }

    /// Bytes accumulated for an unterminated SysEx message
    pub fn pending_sysex_len(&self) -> usize {
        self.sysex.len()
    }

    /// Return to `Idle`, discarding any partial message
    pub fn reset(&mut self) {
        self.state = DecoderState::Idle;
        self.sysex = Vec::new();
    }

    /// Feed one packet.
    ///
    /// Every complete message is passed to `emit` in stream order. On
    /// success the whole packet is consumed and its length returned.
    ///
    /// On a malformed byte the decoder resets to `Idle` and returns
    /// [`Error::MalformedStream`] carrying the byte and its offset. Bytes up
    /// to and including that offset are consumed; the caller decides whether
    /// to resume with `&bytes[offset + 1..]` or drop the rest of the packet.
    pub fn receive<F>(&mut self, raw_timestamp: u64, bytes: &[u8], mut emit: F) -> Result<usize>
    where
        F: FnMut(DecodedMessage),
    {
        let timestamp = Timestamp::normalize(raw_timestamp, self.origin_micros);
        let mut offset = 0;

        while offset < bytes.len() {
            let byte = bytes[offset];

            if status::is_real_time(byte) {
                // Leaves state and any SysEx buffer untouched
                self.emit(MessageKind::SystemRealTime { status: byte }, timestamp, &mut emit);
                offset += 1;
                continue;
            }

            if self.state == DecoderState::CollectingSysex {
                offset += self.collect_sysex(&bytes[offset..], timestamp, &mut emit);
                continue;
            }

            if status::is_status(byte) {
                self.accept_status(byte, offset, timestamp, &mut emit)?;
            } else {
                self.accept_data(byte, offset, timestamp, &mut emit)?;
            }
            offset += 1;
        }

        Ok(offset)
    }

    /// Feed one packet, skipping past malformed bytes.
    ///
    /// Each malformed byte aborts only the message it belongs to; decoding
    /// resumes at the next byte. Returns the errors encountered.
    pub fn receive_resuming<F>(&mut self, raw_timestamp: u64, bytes: &[u8], mut emit: F) -> Vec<Error>
    where
        F: FnMut(DecodedMessage),
    {
        let mut errors = Vec::new();
        let mut start = 0;

        while start < bytes.len() {
            match self.receive(raw_timestamp, &bytes[start..], &mut emit) {
                Ok(_) => break,
                Err(Error::MalformedStream { byte, offset, reason }) => {
                    errors.push(Error::MalformedStream {
                        byte,
                        offset: start + offset,
                        reason,
                    });
                    start += offset + 1;
                }
                Err(other) => {
                    errors.push(other);
                    break;
                }
            }
        }

        errors
    }

    fn accept_status<F>(&mut self, byte: u8, offset: usize, timestamp: Timestamp, emit: &mut F) -> Result<()>
    where
        F: FnMut(DecodedMessage),
    {
        match byte {
            status::SYSTEM_EXCLUSIVE => {
                self.sysex.clear();
                self.sysex.push(byte);
                self.state = DecoderState::CollectingSysex;
                trace!("SysEx collection started");
            }
            status::END_OF_EXCLUSIVE => {
                return Err(self.malformed(byte, offset, MalformedReason::UnexpectedEndOfExclusive));
            }
            _ => match status::expected_data_length(byte) {
                Some(0) => {
                    // Any running status ends here
                    self.state = DecoderState::Idle;
                    self.emit(short_message(byte, &[]), timestamp, emit);
                }
                Some(1) => self.state = DecoderState::CollectingOneByte { status: byte },
                Some(2) => self.state = DecoderState::CollectingFirstOfTwo { status: byte },
                _ => return Err(self.malformed(byte, offset, MalformedReason::UndefinedStatus)),
            },
        }
        Ok(())
    }

    fn accept_data<F>(&mut self, byte: u8, offset: usize, timestamp: Timestamp, emit: &mut F) -> Result<()>
    where
        F: FnMut(DecodedMessage),
    {
        match self.state {
            DecoderState::Idle | DecoderState::CollectingSysex => {
                return Err(self.malformed(byte, offset, MalformedReason::DataOutsideMessage));
            }
            DecoderState::CollectingOneByte { status } => {
                if !status::is_running_status(status) {
                    self.state = DecoderState::Idle;
                }
                self.emit(short_message(status, &[byte]), timestamp, emit);
            }
            DecoderState::CollectingFirstOfTwo { status } => {
                self.state = DecoderState::CollectingSecondOfTwo { status, first: byte };
            }
            DecoderState::CollectingSecondOfTwo { status, first } => {
                self.state = if status::is_running_status(status) {
                    DecoderState::CollectingFirstOfTwo { status }
                } else {
                    DecoderState::Idle
                };
                self.emit(short_message(status, &[first, byte]), timestamp, emit);
            }
        }
        Ok(())
    }

    /// Scan SysEx bytes from the start of `bytes`, returning how many were
    /// consumed.
    ///
    /// Stops after End of Exclusive (consumed), before a real-time byte (the
    /// caller emits it and collection resumes), or before any other status
    /// byte, which ends the SysEx message and is left for the caller to
    /// process as the start of the next message.
    fn collect_sysex<F>(&mut self, bytes: &[u8], timestamp: Timestamp, emit: &mut F) -> usize
    where
        F: FnMut(DecodedMessage),
    {
        let mut consumed = 0;
        let mut terminated = false;

        for &byte in bytes {
            if status::is_status(byte) {
                if byte == status::END_OF_EXCLUSIVE {
                    consumed += 1;
                    terminated = true;
                }
                break;
            }
            consumed += 1;
        }

        self.sysex.extend_from_slice(&bytes[..consumed]);

        if terminated {
            self.state = DecoderState::Idle;
            let data = std::mem::take(&mut self.sysex);
            self.emit(MessageKind::SystemExclusive { data, complete: true }, timestamp, emit);
        } else if let Some(&next) = bytes.get(consumed) {
            if !status::is_real_time(next) {
                self.interrupt_sysex(next, timestamp, emit);
            }
        }

        consumed
    }

    /// End an unterminated SysEx message because `next` starts another one
    fn interrupt_sysex<F>(&mut self, next: u8, timestamp: Timestamp, emit: &mut F)
    where
        F: FnMut(DecodedMessage),
    {
        self.state = DecoderState::Idle;
        let data = std::mem::take(&mut self.sysex);

        // A fresh SysEx start replaces the unterminated one
        if next == status::SYSTEM_EXCLUSIVE || self.incomplete_sysex == IncompleteSysex::Discard {
            debug!(
                "Discarding incomplete SysEx ({} bytes) interrupted by 0x{:02X}",
                data.len(),
                next
            );
            return;
        }

        debug!(
            "Delivering incomplete SysEx ({} bytes) interrupted by 0x{:02X}",
            data.len(),
            next
        );
        self.emit(MessageKind::SystemExclusive { data, complete: false }, timestamp, emit);
    }

    fn emit<F>(&self, kind: MessageKind, timestamp: Timestamp, emit: &mut F)
    where
        F: FnMut(DecodedMessage),
    {
        let message = DecodedMessage::new(kind, timestamp);
        trace!("Decoded: {}", message);
        emit(message);
    }

    fn malformed(&mut self, byte: u8, offset: usize, reason: MalformedReason) -> Error {
        self.reset();
        Error::MalformedStream { byte, offset, reason }
    }
}

/// Build a fixed-length message from its status and data bytes
fn short_message(status: u8, data: &[u8]) -> MessageKind {
    if status < status::SYSTEM_EXCLUSIVE {
        MessageKind::ChannelVoice {
            status,
            data1: data.first().copied().unwrap_or(0),
            data2: data.get(1).copied().unwrap_or(0),
        }
    } else if status::is_real_time(status) {
        MessageKind::SystemRealTime { status }
    } else {
        // System common, plus the undefined 0xF9/0xFD
        MessageKind::SystemCommon {
            status,
            data: SmallVec::from_slice(data),
        }
    }
}
