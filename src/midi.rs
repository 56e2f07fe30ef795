//! MIDI status table and message types
//!
//! Provides the fixed status-byte table used by the stream decoder, a typed
//! interpretation of complete messages, and hex formatting for logs.

use std::fmt;

/// Status byte constants
pub mod status {
    pub const NOTE_OFF: u8 = 0x80;
    pub const NOTE_ON: u8 = 0x90;
    pub const POLY_PRESSURE: u8 = 0xA0;
    pub const CONTROL_CHANGE: u8 = 0xB0;
    pub const PROGRAM_CHANGE: u8 = 0xC0;
    pub const CHANNEL_PRESSURE: u8 = 0xD0;
    pub const PITCH_BEND: u8 = 0xE0;

    pub const SYSTEM_EXCLUSIVE: u8 = 0xF0;
    pub const MIDI_TIME_CODE: u8 = 0xF1;
    pub const SONG_POSITION_POINTER: u8 = 0xF2;
    pub const SONG_SELECT: u8 = 0xF3;
    pub const TUNE_REQUEST: u8 = 0xF6;
    pub const END_OF_EXCLUSIVE: u8 = 0xF7;

    pub const TIMING_CLOCK: u8 = 0xF8;
    pub const START: u8 = 0xFA;
    pub const CONTINUE: u8 = 0xFB;
    pub const STOP: u8 = 0xFC;
    pub const ACTIVE_SENSING: u8 = 0xFE;
    pub const SYSTEM_RESET: u8 = 0xFF;

    /// High bit set
    pub fn is_status(byte: u8) -> bool {
        byte & 0x80 != 0
    }

    /// Real-time messages may appear anywhere, even between data bytes of
    /// another message, and never disturb decoder state.
    pub fn is_real_time(byte: u8) -> bool {
        matches!(
            byte,
            TIMING_CLOCK | START | CONTINUE | STOP | ACTIVE_SENSING | SYSTEM_RESET
        )
    }

    /// Channel voice/mode statuses that may be continued without repeating
    /// the status byte.
    pub fn is_running_status(byte: u8) -> bool {
        matches!(
            byte & 0xF0,
            NOTE_OFF
                | NOTE_ON
                | POLY_PRESSURE
                | CONTROL_CHANGE
                | PROGRAM_CHANGE
                | CHANNEL_PRESSURE
                | PITCH_BEND
        )
    }

    /// Number of trailing data bytes a status expects.
    ///
    /// Returns `None` for bytes the table does not define (data bytes,
    /// 0xF4, 0xF5). SysEx start is variable length and also returns `None`;
    /// the decoder handles it before consulting the table.
    pub fn expected_data_length(byte: u8) -> Option<usize> {
        match byte {
            TUNE_REQUEST | END_OF_EXCLUSIVE => return Some(0),
            0xF8..=0xFF => return Some(0),
            MIDI_TIME_CODE | SONG_SELECT => return Some(1),
            SONG_POSITION_POINTER => return Some(2),
            _ => {}
        }

        match byte & 0xF0 {
            NOTE_OFF | NOTE_ON | POLY_PRESSURE | CONTROL_CHANGE | PITCH_BEND => Some(2),
            PROGRAM_CHANGE | CHANNEL_PRESSURE => Some(1),
            _ => None,
        }
    }
}

/// Typed view of one complete message.
///
/// Channels are zero-based; `Display` shows them one-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyPressure { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, cc: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    /// 14-bit value, 8192 is centre
    PitchBend { channel: u8, value: u16 },

    /// Payload without the 0xF0/0xF7 framing
    SysEx { data: Vec<u8> },
    /// Quarter frame
    MidiTimeCode { data: u8 },
    /// In MIDI beats (sixteenth notes)
    SongPosition { position: u16 },
    SongSelect { song: u8 },
    TuneRequest,

    TimingClock,
    Start,
    Continue,
    Stop,
    ActiveSensing,
    SystemReset,

    /// 0xF9 or 0xFD
    Undefined { status: u8 },
}

impl MidiMessage {
    /// Parse one complete MIDI message from raw bytes
    ///
    /// Running status is not handled here; use [`crate::decoder::MessageDecoder`]
    /// for streams.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (&first, rest) = data.split_first()?;

        if !status::is_status(first) {
            return None;
        }

        let d1 = rest.first().map(|b| b & 0x7F);
        let d2 = rest.get(1).map(|b| b & 0x7F);

        if first < 0xF0 {
            let channel = first & 0x0F;

            return match first & 0xF0 {
                status::NOTE_OFF => Some(MidiMessage::NoteOff {
                    channel,
                    note: d1?,
                    velocity: d2?,
                }),
                status::NOTE_ON => {
                    let (note, velocity) = (d1?, d2?);
                    // velocity 0 is a Note Off
                    if velocity == 0 {
                        Some(MidiMessage::NoteOff { channel, note, velocity: 0 })
                    } else {
                        Some(MidiMessage::NoteOn { channel, note, velocity })
                    }
                }
                status::POLY_PRESSURE => Some(MidiMessage::PolyPressure {
                    channel,
                    note: d1?,
                    pressure: d2?,
                }),
                status::CONTROL_CHANGE => Some(MidiMessage::ControlChange {
                    channel,
                    cc: d1?,
                    value: d2?,
                }),
                status::PROGRAM_CHANGE => Some(MidiMessage::ProgramChange { channel, program: d1? }),
                status::CHANNEL_PRESSURE => {
                    Some(MidiMessage::ChannelPressure { channel, pressure: d1? })
                }
                status::PITCH_BEND => Some(MidiMessage::PitchBend {
                    channel,
                    value: ((d2? as u16) << 7) | d1? as u16,
                }),
                _ => None,
            };
        }

        match first {
            status::SYSTEM_EXCLUSIVE => {
                let end = rest
                    .iter()
                    .position(|&b| b == status::END_OF_EXCLUSIVE)
                    .unwrap_or(rest.len());
                Some(MidiMessage::SysEx { data: rest[..end].to_vec() })
            }
            status::MIDI_TIME_CODE => Some(MidiMessage::MidiTimeCode { data: d1? }),
            status::SONG_POSITION_POINTER => Some(MidiMessage::SongPosition {
                position: ((d2? as u16) << 7) | d1? as u16,
            }),
            status::SONG_SELECT => Some(MidiMessage::SongSelect { song: d1? }),
            status::TUNE_REQUEST => Some(MidiMessage::TuneRequest),
            status::TIMING_CLOCK => Some(MidiMessage::TimingClock),
            status::START => Some(MidiMessage::Start),
            status::CONTINUE => Some(MidiMessage::Continue),
            status::STOP => Some(MidiMessage::Stop),
            status::ACTIVE_SENSING => Some(MidiMessage::ActiveSensing),
            status::SYSTEM_RESET => Some(MidiMessage::SystemReset),
            0xF9 | 0xFD => Some(MidiMessage::Undefined { status: first }),
            _ => None,
        }
    }

    /// Wire bytes; data values are masked to 7 bits
    pub fn encode(&self) -> Vec<u8> {
        let voice = |kind: u8, channel: u8, data: &[u8]| {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(kind | (channel & 0x0F));
            out.extend(data.iter().map(|b| b & 0x7F));
            out
        };
        let split = |value: u16| [(value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8];

        match self {
            MidiMessage::NoteOff { channel, note, velocity } => voice(status::NOTE_OFF, *channel, &[*note, *velocity]),
            MidiMessage::NoteOn { channel, note, velocity } => voice(status::NOTE_ON, *channel, &[*note, *velocity]),
            MidiMessage::PolyPressure { channel, note, pressure } => {
                voice(status::POLY_PRESSURE, *channel, &[*note, *pressure])
            }
            MidiMessage::ControlChange { channel, cc, value } => voice(status::CONTROL_CHANGE, *channel, &[*cc, *value]),
            MidiMessage::ProgramChange { channel, program } => voice(status::PROGRAM_CHANGE, *channel, &[*program]),
            MidiMessage::ChannelPressure { channel, pressure } => {
                voice(status::CHANNEL_PRESSURE, *channel, &[*pressure])
            }
            MidiMessage::PitchBend { channel, value } => voice(status::PITCH_BEND, *channel, &split(*value)),
            MidiMessage::SysEx { data } => std::iter::once(status::SYSTEM_EXCLUSIVE)
                .chain(data.iter().copied())
                .chain(std::iter::once(status::END_OF_EXCLUSIVE))
                .collect(),
            MidiMessage::MidiTimeCode { data } => vec![status::MIDI_TIME_CODE, data & 0x7F],
            MidiMessage::SongPosition { position } => {
                let [lsb, msb] = split(*position);
                vec![status::SONG_POSITION_POINTER, lsb, msb]
            }
            MidiMessage::SongSelect { song } => vec![status::SONG_SELECT, song & 0x7F],
            MidiMessage::TuneRequest => vec![status::TUNE_REQUEST],
            MidiMessage::TimingClock => vec![status::TIMING_CLOCK],
            MidiMessage::Start => vec![status::START],
            MidiMessage::Continue => vec![status::CONTINUE],
            MidiMessage::Stop => vec![status::STOP],
            MidiMessage::ActiveSensing => vec![status::ACTIVE_SENSING],
            MidiMessage::SystemReset => vec![status::SYSTEM_RESET],
            MidiMessage::Undefined { status: byte } => vec![*byte],
        }
    }

    /// Get the channel for channel messages (0-15), None for system messages
    pub fn channel(&self) -> Option<u8> {
        match *self {
            MidiMessage::NoteOff { channel, .. }
            | MidiMessage::NoteOn { channel, .. }
            | MidiMessage::PolyPressure { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::ChannelPressure { channel, .. }
            | MidiMessage::PitchBend { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Check if this is a channel message
    pub fn is_channel_message(&self) -> bool {
        self.channel().is_some()
    }
}

/// Scientific pitch name, middle C (60) is C4
pub fn note_name(note: u8) -> String {
    const NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    format!("{}{}", NAMES[(note % 12) as usize], (note / 12) as i8 - 1)
}

impl fmt::Display for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(channel) = self.channel() {
            write!(f, "ch{:<2} ", channel + 1)?;
        }

        match self {
            MidiMessage::NoteOff { note, velocity, .. } => {
                write!(f, "Note Off {} vel {}", note_name(*note), velocity)
            }
            MidiMessage::NoteOn { note, velocity, .. } => {
                write!(f, "Note On {} vel {}", note_name(*note), velocity)
            }
            MidiMessage::PolyPressure { note, pressure, .. } => {
                write!(f, "Aftertouch {} {}", note_name(*note), pressure)
            }
            MidiMessage::ControlChange { cc, value, .. } => write!(f, "CC {} = {}", cc, value),
            MidiMessage::ProgramChange { program, .. } => write!(f, "Program {}", program),
            MidiMessage::ChannelPressure { pressure, .. } => write!(f, "Channel Pressure {}", pressure),
            MidiMessage::PitchBend { value, .. } => {
                write!(f, "Pitch Bend {:+}", *value as i32 - 8192)
            }
            MidiMessage::SysEx { data } => write!(f, "SysEx ({} bytes)", data.len()),
            MidiMessage::MidiTimeCode { data } => {
                write!(f, "MTC piece {} value {}", data >> 4, data & 0x0F)
            }
            MidiMessage::SongPosition { position } => write!(f, "Song Position {}", position),
            MidiMessage::SongSelect { song } => write!(f, "Song Select {}", song),
            MidiMessage::TuneRequest => write!(f, "Tune Request"),
            MidiMessage::TimingClock => write!(f, "Clock"),
            MidiMessage::Start => write!(f, "Start"),
            MidiMessage::Continue => write!(f, "Continue"),
            MidiMessage::Stop => write!(f, "Stop"),
            MidiMessage::ActiveSensing => write!(f, "Active Sensing"),
            MidiMessage::SystemReset => write!(f, "Reset"),
            MidiMessage::Undefined { status } => write!(f, "Undefined 0x{:02X}", status),
        }
    }
}

/// Space separated uppercase hex, as printed by the monitor
pub fn format_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_data_length_table() {
        assert_eq!(status::expected_data_length(0x90), Some(2));
        assert_eq!(status::expected_data_length(0x8F), Some(2));
        assert_eq!(status::expected_data_length(0xC3), Some(1));
        assert_eq!(status::expected_data_length(0xD0), Some(1));
        assert_eq!(status::expected_data_length(0xE5), Some(2));
        assert_eq!(status::expected_data_length(0xF1), Some(1));
        assert_eq!(status::expected_data_length(0xF2), Some(2));
        assert_eq!(status::expected_data_length(0xF3), Some(1));
        assert_eq!(status::expected_data_length(0xF6), Some(0));
        assert_eq!(status::expected_data_length(0xF9), Some(0));
        assert_eq!(status::expected_data_length(0xFD), Some(0));
        assert_eq!(status::expected_data_length(0xF4), None);
        assert_eq!(status::expected_data_length(0xF5), None);
        assert_eq!(status::expected_data_length(0x40), None);
    }

    #[test]
    fn test_real_time_and_running_status_sets() {
        for b in [0xF8, 0xFA, 0xFB, 0xFC, 0xFE, 0xFF] {
            assert!(status::is_real_time(b));
        }
        assert!(!status::is_real_time(0xF9));
        assert!(!status::is_real_time(0xF7));

        assert!(status::is_running_status(0x93));
        assert!(status::is_running_status(0xC0));
        assert!(!status::is_running_status(0xF1));
        assert!(!status::is_running_status(0xF3));
    }

    #[test]
    fn test_note_on_parsing() {
        let msg = MidiMessage::parse(&[0x90, 60, 100]).unwrap();
        assert_eq!(msg, MidiMessage::NoteOn { channel: 0, note: 60, velocity: 100 });
    }

    #[test]
    fn test_note_on_velocity_zero() {
        let msg = MidiMessage::parse(&[0x90, 60, 0]).unwrap();
        assert_eq!(msg, MidiMessage::NoteOff { channel: 0, note: 60, velocity: 0 });
    }

    #[test]
    fn test_pitch_bend() {
        let msg = MidiMessage::parse(&[0xE0, 0x00, 0x40]).unwrap();
        assert_eq!(msg, MidiMessage::PitchBend { channel: 0, value: 8192 });
    }

    #[test]
    fn test_truncated_message_is_rejected() {
        assert_eq!(MidiMessage::parse(&[0xB0, 7]), None);
        assert_eq!(MidiMessage::parse(&[0x40]), None);
        assert_eq!(MidiMessage::parse(&[]), None);
    }

    #[test]
    fn test_sysex_strips_framing() {
        let msg = MidiMessage::parse(&[0xF0, 0x7E, 0x01, 0xF7]).unwrap();
        assert_eq!(msg, MidiMessage::SysEx { data: vec![0x7E, 0x01] });
        assert_eq!(msg.encode(), vec![0xF0, 0x7E, 0x01, 0xF7]);
    }

    #[test]
    fn test_encode_masks_and_splits() {
        let bend = MidiMessage::PitchBend { channel: 3, value: 0x3FFF };
        assert_eq!(bend.encode(), vec![0xE3, 0x7F, 0x7F]);
        let cc = MidiMessage::ControlChange { channel: 0x1F, cc: 0x87, value: 0x40 };
        assert_eq!(cc.encode(), vec![0xBF, 0x07, 0x40]);
        assert_eq!(MidiMessage::Undefined { status: 0xFD }.encode(), vec![0xFD]);
    }

    #[test]
    fn test_display() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(0), "C-1");
        let on = MidiMessage::NoteOn { channel: 9, note: 61, velocity: 90 };
        assert_eq!(on.to_string(), "ch10 Note On C#4 vel 90");
        let bend = MidiMessage::PitchBend { channel: 0, value: 8192 };
        assert_eq!(bend.to_string(), "ch1  Pitch Bend +0");
        assert_eq!(MidiMessage::TimingClock.to_string(), "Clock");
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0xF0, 0x01, 0xF7]), "F0 01 F7");
        assert_eq!(format_hex(&[]), "");
    }
}
