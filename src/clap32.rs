//! Byte-exact images of the CLAP ABI as seen by a 32-bit guest.
//!
//! These deliberately do not reuse the `clap_sys` struct definitions: those
//! have host-native pointer widths, while the guest lays everything out with
//! 4-byte pointers. Every pointer-sized field here is a [`GuestPtr`] or
//! [`GuestFn`] (both transparent `u32` newtypes), every other field keeps its
//! C size, and padding is spelled out where the C compiler would insert it, so
//! a struct can cross the boundary as a single memcpy.
//!
//! Scalar constants (event types, flags, statuses, extension identifiers) come
//! from `clap_sys`; only the *layouts* differ between the two address spaces.

use crate::guest::pointer::{GuestFn, GuestPtr, GuestValue};

pub mod events;
pub mod ext;

use ext::{InputEvents32, OutputEvents32};

/// The CLAP version this host advertises to guests.
pub const CLAP_VERSION_32: ClapVersion32 = ClapVersion32 {
    major: 1,
    minor: 2,
    revision: 7,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClapVersion32 {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

/// `clap_plugin_entry`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapEntry32 {
    pub clap_version: ClapVersion32,
    pub init: GuestFn<bool, (GuestPtr<u8>,)>,
    pub deinit: GuestFn<(), ()>,
    pub get_factory: GuestFn<GuestPtr<()>, (GuestPtr<u8>,)>,
}

/// `clap_plugin_factory`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapFactory32 {
    pub get_plugin_count: GuestFn<u32, (GuestPtr<ClapFactory32>,)>,
    pub get_plugin_descriptor: GuestFn<GuestPtr<ClapDescriptor32>, (GuestPtr<ClapFactory32>, u32)>,
    pub create_plugin:
        GuestFn<GuestPtr<ClapPlugin32>, (GuestPtr<ClapFactory32>, GuestPtr<ClapHost32>, GuestPtr<u8>)>,
}

/// `clap_plugin_descriptor`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapDescriptor32 {
    pub clap_version: ClapVersion32,
    pub id: GuestPtr<u8>,
    pub name: GuestPtr<u8>,
    pub vendor: GuestPtr<u8>,
    pub url: GuestPtr<u8>,
    pub manual_url: GuestPtr<u8>,
    pub support_url: GuestPtr<u8>,
    pub version: GuestPtr<u8>,
    pub description: GuestPtr<u8>,
    /// NUL-pointer-terminated array of C strings.
    pub features: GuestPtr<GuestPtr<u8>>,
}

/// `clap_plugin`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapPlugin32 {
    pub desc: GuestPtr<ClapDescriptor32>,
    pub plugin_data: GuestPtr<()>,
    pub init: GuestFn<bool, (GuestPtr<ClapPlugin32>,)>,
    pub destroy: GuestFn<(), (GuestPtr<ClapPlugin32>,)>,
    pub activate: GuestFn<bool, (GuestPtr<ClapPlugin32>, f64, u32, u32)>,
    pub deactivate: GuestFn<(), (GuestPtr<ClapPlugin32>,)>,
    pub start_processing: GuestFn<bool, (GuestPtr<ClapPlugin32>,)>,
    pub stop_processing: GuestFn<(), (GuestPtr<ClapPlugin32>,)>,
    pub reset: GuestFn<(), (GuestPtr<ClapPlugin32>,)>,
    pub process: GuestFn<i32, (GuestPtr<ClapPlugin32>, GuestPtr<ClapProcess32>)>,
    pub get_extension: GuestFn<GuestPtr<()>, (GuestPtr<ClapPlugin32>, GuestPtr<u8>)>,
    pub on_main_thread: GuestFn<(), (GuestPtr<ClapPlugin32>,)>,
}

/// `clap_host`. The `host_data` field is repurposed to carry the plugin's registry index; the
/// template copy built at module setup holds `u32::MAX` until `create_plugin` rewrites it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapHost32 {
    pub clap_version: ClapVersion32,
    pub host_data: u32,
    pub name: GuestPtr<u8>,
    pub vendor: GuestPtr<u8>,
    pub url: GuestPtr<u8>,
    pub version: GuestPtr<u8>,
    pub get_extension: GuestFn<GuestPtr<()>, (GuestPtr<ClapHost32>, GuestPtr<u8>)>,
    pub request_restart: GuestFn<(), (GuestPtr<ClapHost32>,)>,
    pub request_process: GuestFn<(), (GuestPtr<ClapHost32>,)>,
    pub request_callback: GuestFn<(), (GuestPtr<ClapHost32>,)>,
}

/// `clap_audio_buffer`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AudioBuffer32 {
    pub data32: GuestPtr<GuestPtr<f32>>,
    pub data64: GuestPtr<()>,
    pub channel_count: u32,
    pub latency: u32,
    pub constant_mask: u64,
}

/// `clap_process`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapProcess32 {
    pub steady_time: i64,
    pub frames_count: u32,
    pub transport: GuestPtr<events::EventTransport32>,
    pub audio_inputs: GuestPtr<AudioBuffer32>,
    pub audio_outputs: GuestPtr<AudioBuffer32>,
    pub audio_inputs_count: u32,
    pub audio_outputs_count: u32,
    pub in_events: GuestPtr<InputEvents32>,
    pub out_events: GuestPtr<OutputEvents32>,
}

/// `clap_istream`. `ctx` carries the plugin's registry index.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IStream32 {
    pub ctx: u32,
    pub read: GuestFn<i64, (GuestPtr<IStream32>, GuestPtr<u8>, u64)>,
}

/// `clap_ostream`. `ctx` carries the plugin's registry index.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OStream32 {
    pub ctx: u32,
    pub write: GuestFn<i64, (GuestPtr<OStream32>, GuestPtr<u8>, u64)>,
}

/// `clap_param_info`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ParamInfo32 {
    pub id: u32,
    pub flags: u32,
    pub cookie: GuestPtr<()>,
    pub name: [u8; 256],
    pub module: [u8; 1024],
    pub _pad: [u8; 4],
    pub min_value: f64,
    pub max_value: f64,
    pub default_value: f64,
}

/// `clap_audio_port_info`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AudioPortInfo32 {
    pub id: u32,
    pub name: [u8; 256],
    pub flags: u32,
    pub channel_count: u32,
    pub port_type: GuestPtr<u8>,
    pub in_place_pair: u32,
}

/// `clap_note_port_info`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NotePortInfo32 {
    pub id: u32,
    pub supported_dialects: u32,
    pub preferred_dialect: u32,
    pub name: [u8; 256],
}

unsafe impl GuestValue for ClapVersion32 {}
unsafe impl GuestValue for ClapEntry32 {}
unsafe impl GuestValue for ClapFactory32 {}
unsafe impl GuestValue for ClapDescriptor32 {}
unsafe impl GuestValue for ClapPlugin32 {}
unsafe impl GuestValue for ClapHost32 {}
unsafe impl GuestValue for AudioBuffer32 {}
unsafe impl GuestValue for ClapProcess32 {}
unsafe impl GuestValue for IStream32 {}
unsafe impl GuestValue for OStream32 {}
unsafe impl GuestValue for ParamInfo32 {}
unsafe impl GuestValue for AudioPortInfo32 {}
unsafe impl GuestValue for NotePortInfo32 {}
