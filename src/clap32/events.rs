//! Guest-side layouts of the CLAP event structs, plus the header parsing the
//! pending-event queue does on raw bytes.

use clap_sys::events::{
    CLAP_CORE_EVENT_SPACE_ID, CLAP_EVENT_MIDI, CLAP_EVENT_MIDI2, CLAP_EVENT_MIDI_SYSEX,
    CLAP_EVENT_NOTE_CHOKE, CLAP_EVENT_NOTE_OFF, CLAP_EVENT_NOTE_ON, CLAP_EVENT_PARAM_GESTURE_BEGIN,
    CLAP_EVENT_PARAM_GESTURE_END, CLAP_EVENT_PARAM_MOD, CLAP_EVENT_PARAM_VALUE,
};

use crate::guest::pointer::{GuestPtr, GuestValue};

/// Alignment of event starts in the pending queue. Every CLAP event size is a multiple of this,
/// which keeps the queue gap-free (each event's `size` exactly reaches the next start).
pub const EVENT_ALIGN: usize = 4;

/// `clap_event_header`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader32 {
    pub size: u32,
    pub time: u32,
    pub space_id: u16,
    pub type_: u16,
    pub flags: u32,
}

impl EventHeader32 {
    /// Parse a header from the front of a raw event. Returns `None` when there aren't enough
    /// bytes or the recorded size is nonsensical (smaller than the header itself).
    pub fn from_bytes(bytes: &[u8]) -> Option<EventHeader32> {
        if bytes.len() < std::mem::size_of::<EventHeader32>() {
            return None;
        }

        // SAFETY: length checked above; `read_unaligned` because the queue only aligns to 4
        let header =
            unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const EventHeader32) };
        if (header.size as usize) < std::mem::size_of::<EventHeader32>() {
            return None;
        }
        Some(header)
    }

    /// Whether this event may be forwarded between plug-ins as raw bytes. Parameter events would
    /// need cookie and id translation between the sender's and receiver's namespaces, so only
    /// note and MIDI events qualify.
    pub fn is_forwardable(&self) -> bool {
        self.space_id == CLAP_CORE_EVENT_SPACE_ID
            && matches!(
                self.type_,
                CLAP_EVENT_NOTE_ON
                    | CLAP_EVENT_NOTE_OFF
                    | CLAP_EVENT_NOTE_CHOKE
                    | CLAP_EVENT_MIDI
                    | CLAP_EVENT_MIDI_SYSEX
                    | CLAP_EVENT_MIDI2
            )
    }

    /// Whether `clap_plugin_params::flush()` should see this event.
    pub fn is_param_event(&self) -> bool {
        self.space_id == CLAP_CORE_EVENT_SPACE_ID
            && matches!(
                self.type_,
                CLAP_EVENT_PARAM_VALUE
                    | CLAP_EVENT_PARAM_MOD
                    | CLAP_EVENT_PARAM_GESTURE_BEGIN
                    | CLAP_EVENT_PARAM_GESTURE_END
            )
    }
}

/// `clap_event_param_value`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventParamValue32 {
    pub header: EventHeader32,
    pub param_id: u32,
    pub cookie: GuestPtr<()>,
    pub note_id: i32,
    pub port_index: i16,
    pub channel: i16,
    pub key: i16,
    pub _pad: [u8; 6],
    pub value: f64,
}

/// `clap_event_param_mod`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventParamMod32 {
    pub header: EventHeader32,
    pub param_id: u32,
    pub cookie: GuestPtr<()>,
    pub note_id: i32,
    pub port_index: i16,
    pub channel: i16,
    pub key: i16,
    pub _pad: [u8; 6],
    pub amount: f64,
}

/// `clap_event_note`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventNote32 {
    pub header: EventHeader32,
    pub note_id: i32,
    pub port_index: i16,
    pub channel: i16,
    pub key: i16,
    pub _pad: [u8; 6],
    pub velocity: f64,
}

/// `clap_event_midi`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventMidi32 {
    pub header: EventHeader32,
    pub port_index: u16,
    pub data: [u8; 3],
    pub _pad: [u8; 3],
}

/// `clap_event_midi_sysex`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventMidiSysex32 {
    pub header: EventHeader32,
    pub port_index: u16,
    pub _pad: [u8; 2],
    pub buffer: GuestPtr<u8>,
    pub size: u32,
}

/// `clap_event_midi2`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventMidi2_32 {
    pub header: EventHeader32,
    pub port_index: u16,
    pub _pad: [u8; 2],
    pub data: [u32; 4],
}

/// `clap_event_transport`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EventTransport32 {
    pub header: EventHeader32,
    pub flags: u32,
    pub _pad: [u8; 4],
    pub song_pos_beats: i64,
    pub song_pos_seconds: i64,
    pub tempo: f64,
    pub tempo_inc: f64,
    pub loop_start_beats: i64,
    pub loop_end_beats: i64,
    pub loop_start_seconds: i64,
    pub loop_end_seconds: i64,
    pub bar_start: i64,
    pub bar_number: i32,
    pub tsig_num: u16,
    pub tsig_denom: u16,
}

unsafe impl GuestValue for EventHeader32 {}
unsafe impl GuestValue for EventParamValue32 {}
unsafe impl GuestValue for EventParamMod32 {}
unsafe impl GuestValue for EventNote32 {}
unsafe impl GuestValue for EventMidi32 {}
unsafe impl GuestValue for EventMidiSysex32 {}
unsafe impl GuestValue for EventMidi2_32 {}
unsafe impl GuestValue for EventTransport32 {}
