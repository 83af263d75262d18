//! Guest-side layouts of the extension vtables: the plugin-provided structs
//! the host calls into, and the host-provided structs built in guest memory
//! whose function fields are registered trampoline indices.

use std::ffi::CStr;

use super::{
    AudioPortInfo32, ClapHost32, ClapPlugin32, NotePortInfo32, ParamInfo32,
};
pub use super::OStream32;
use crate::guest::pointer::{GuestFn, GuestPtr, GuestValue};

/// `clap.webview/3` is still a draft extension, so `clap_sys` does not carry it.
pub const CLAP_EXT_WEBVIEW: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"clap.webview/3\0") };

// ---- Plugin-side extensions (the host calls these) ----

/// `clap_plugin_audio_ports`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginAudioPorts32 {
    pub count: GuestFn<u32, (GuestPtr<ClapPlugin32>, bool)>,
    pub get: GuestFn<bool, (GuestPtr<ClapPlugin32>, u32, bool, GuestPtr<AudioPortInfo32>)>,
}

/// `clap_plugin_note_ports`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginNotePorts32 {
    pub count: GuestFn<u32, (GuestPtr<ClapPlugin32>, bool)>,
    pub get: GuestFn<bool, (GuestPtr<ClapPlugin32>, u32, bool, GuestPtr<NotePortInfo32>)>,
}

/// `clap_plugin_latency`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginLatency32 {
    pub get: GuestFn<u32, (GuestPtr<ClapPlugin32>,)>,
}

/// `clap_plugin_tail`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginTail32 {
    pub get: GuestFn<u32, (GuestPtr<ClapPlugin32>,)>,
}

/// `clap_plugin_params`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginParams32 {
    pub count: GuestFn<u32, (GuestPtr<ClapPlugin32>,)>,
    pub get_info: GuestFn<bool, (GuestPtr<ClapPlugin32>, u32, GuestPtr<ParamInfo32>)>,
    pub get_value: GuestFn<bool, (GuestPtr<ClapPlugin32>, u32, GuestPtr<f64>)>,
    pub value_to_text: GuestFn<bool, (GuestPtr<ClapPlugin32>, u32, f64, GuestPtr<u8>, u32)>,
    pub text_to_value: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<u8>, GuestPtr<f64>)>,
    pub flush: GuestFn<
        (),
        (
            GuestPtr<ClapPlugin32>,
            GuestPtr<InputEvents32>,
            GuestPtr<OutputEvents32>,
        ),
    >,
}

/// `clap_plugin_state`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginState32 {
    pub save: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<OStream32>)>,
    pub load: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<super::IStream32>)>,
}

/// `clap_plugin_gui`. The bridge only caches the pointer (GUI transport is the outer
/// application's concern), but the layout is part of the guest ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginGui32 {
    pub is_api_supported: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<u8>, bool)>,
    pub get_preferred_api:
        GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<GuestPtr<u8>>, GuestPtr<u32>)>,
    pub create: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<u8>, bool)>,
    pub destroy: GuestFn<(), (GuestPtr<ClapPlugin32>,)>,
    pub set_scale: GuestFn<bool, (GuestPtr<ClapPlugin32>, f64)>,
    pub get_size: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<u32>, GuestPtr<u32>)>,
    pub can_resize: GuestFn<bool, (GuestPtr<ClapPlugin32>,)>,
    pub get_resize_hints: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<()>)>,
    pub adjust_size: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<u32>, GuestPtr<u32>)>,
    pub set_size: GuestFn<bool, (GuestPtr<ClapPlugin32>, u32, u32)>,
    pub set_parent: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<()>)>,
    pub set_transient: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<()>)>,
    pub suggest_title: GuestFn<(), (GuestPtr<ClapPlugin32>, GuestPtr<u8>)>,
    pub show: GuestFn<bool, (GuestPtr<ClapPlugin32>,)>,
    pub hide: GuestFn<bool, (GuestPtr<ClapPlugin32>,)>,
}

/// `clap_plugin_webview` (draft v3, extended with the resource fetch the bridge serves).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginWebview32 {
    /// Writes the UI's starting URI into the buffer and returns its length.
    pub get_uri: GuestFn<i32, (GuestPtr<ClapPlugin32>, GuestPtr<u8>, u32)>,
    /// Writes the MIME type into `mime` and streams the resource body into the `clap_ostream`.
    pub get_resource: GuestFn<
        bool,
        (
            GuestPtr<ClapPlugin32>,
            GuestPtr<u8>,
            GuestPtr<u8>,
            u32,
            GuestPtr<OStream32>,
        ),
    >,
    /// Delivers one message from the host side of the webview.
    pub receive: GuestFn<bool, (GuestPtr<ClapPlugin32>, GuestPtr<u8>, u32)>,
}

// ---- Event lists (host-provided, ctx-bearing) ----

/// `clap_input_events`. `ctx` carries the plugin's registry index.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InputEvents32 {
    pub ctx: u32,
    pub size: GuestFn<u32, (GuestPtr<InputEvents32>,)>,
    pub get: GuestFn<GuestPtr<super::events::EventHeader32>, (GuestPtr<InputEvents32>, u32)>,
}

/// `clap_output_events`. `ctx` carries the plugin's registry index.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OutputEvents32 {
    pub ctx: u32,
    pub try_push:
        GuestFn<bool, (GuestPtr<OutputEvents32>, GuestPtr<super::events::EventHeader32>)>,
}

// ---- Host-side extensions (built in guest memory, fields are trampoline indices) ----

/// `clap_host_audio_ports`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostAudioPorts32 {
    pub is_rescan_flag_supported: GuestFn<bool, (GuestPtr<ClapHost32>, u32)>,
    pub rescan: GuestFn<(), (GuestPtr<ClapHost32>, u32)>,
}

/// `clap_host_gui`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostGui32 {
    pub resize_hints_changed: GuestFn<(), (GuestPtr<ClapHost32>,)>,
    pub request_resize: GuestFn<bool, (GuestPtr<ClapHost32>, u32, u32)>,
    pub request_show: GuestFn<bool, (GuestPtr<ClapHost32>,)>,
    pub request_hide: GuestFn<bool, (GuestPtr<ClapHost32>,)>,
    pub closed: GuestFn<(), (GuestPtr<ClapHost32>, bool)>,
}

/// `clap_host_latency`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostLatency32 {
    pub changed: GuestFn<(), (GuestPtr<ClapHost32>,)>,
}

/// `clap_host_note_ports`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostNotePorts32 {
    pub supported_dialects: GuestFn<u32, (GuestPtr<ClapHost32>,)>,
    pub rescan: GuestFn<(), (GuestPtr<ClapHost32>, u32)>,
}

/// `clap_host_params`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostParams32 {
    pub rescan: GuestFn<(), (GuestPtr<ClapHost32>, u32)>,
    pub clear: GuestFn<(), (GuestPtr<ClapHost32>, u32, u32)>,
    pub request_flush: GuestFn<(), (GuestPtr<ClapHost32>,)>,
}

/// `clap_host_state`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostState32 {
    pub mark_dirty: GuestFn<(), (GuestPtr<ClapHost32>,)>,
}

/// `clap_host_tail`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostTail32 {
    pub changed: GuestFn<(), (GuestPtr<ClapHost32>,)>,
}

/// `clap_host_webview`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostWebview32 {
    pub send: GuestFn<bool, (GuestPtr<ClapHost32>, GuestPtr<u8>, u32)>,
}

unsafe impl GuestValue for PluginAudioPorts32 {}
unsafe impl GuestValue for PluginNotePorts32 {}
unsafe impl GuestValue for PluginLatency32 {}
unsafe impl GuestValue for PluginTail32 {}
unsafe impl GuestValue for PluginParams32 {}
unsafe impl GuestValue for PluginState32 {}
unsafe impl GuestValue for PluginGui32 {}
unsafe impl GuestValue for PluginWebview32 {}
unsafe impl GuestValue for InputEvents32 {}
unsafe impl GuestValue for OutputEvents32 {}
unsafe impl GuestValue for HostAudioPorts32 {}
unsafe impl GuestValue for HostGui32 {}
unsafe impl GuestValue for HostLatency32 {}
unsafe impl GuestValue for HostNotePorts32 {}
unsafe impl GuestValue for HostParams32 {}
unsafe impl GuestValue for HostState32 {}
unsafe impl GuestValue for HostTail32 {}
unsafe impl GuestValue for HostWebview32 {}
