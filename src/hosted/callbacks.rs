//! The host-side trampolines registered with the transport layer.
//!
//! Every function here is installed into the guest's function table by
//! [`super::wclap`]; the transport prepends the guest-instance index when the
//! guest calls one. From that index the trampoline finds the hosted module,
//! reads the `ctx`/`host_data` field out of the guest-provided struct, and
//! resolves the plug-in through the registry. A miss anywhere logs and
//! returns the CLAP-specified safe default. Guest misbehaviour never aborts
//! the host.

use clap_sys::ext::audio_ports::CLAP_EXT_AUDIO_PORTS;
use clap_sys::ext::gui::CLAP_EXT_GUI;
use clap_sys::ext::latency::CLAP_EXT_LATENCY;
use clap_sys::ext::note_ports::{
    CLAP_EXT_NOTE_PORTS, CLAP_NOTE_DIALECT_CLAP, CLAP_NOTE_DIALECT_MIDI, CLAP_NOTE_DIALECT_MIDI2,
};
use clap_sys::ext::params::CLAP_EXT_PARAMS;
use clap_sys::ext::state::CLAP_EXT_STATE;
use clap_sys::ext::tail::CLAP_EXT_TAIL;
use std::mem::offset_of;
use std::sync::Arc;

use super::{shared_for, HostedPlugin, WclapShared};
use crate::clap32::ext::CLAP_EXT_WEBVIEW;
use crate::clap32::ClapHost32;
use crate::ffi;
use crate::guest::pointer::GuestPtr;
use crate::util;

/// Longest extension identifier we'll read out of guest memory.
const MAX_EXTENSION_ID: u32 = 64;

/// Resolve a plug-in from a ctx-bearing object whose context index sits at byte `ctx_offset`.
fn plugin_from_ctx(
    guest: u32,
    object: u32,
    ctx_offset: u32,
    what: &str,
) -> Option<Arc<HostedPlugin>> {
    let shared = shared_for(guest)?;
    if object == 0 {
        log::debug!("'{what}' was called with a null object pointer");
        return None;
    }

    let ctx = shared
        .instance
        .get(GuestPtr::<u32>::from_address(object).field::<u32>(ctx_offset));
    let plugin = shared.plugins.get(ctx);
    if plugin.is_none() {
        log::debug!("'{what}' was called with unknown context index {ctx}");
    }
    plugin
}

/// Resolve a plug-in from a guest `clap_host` pointer.
fn plugin_from_host(guest: u32, host: u32, what: &str) -> Option<Arc<HostedPlugin>> {
    plugin_from_ctx(
        guest,
        host,
        offset_of!(ClapHost32, host_data) as u32,
        what,
    )
}

/// Resolve a plug-in from an event-list or stream object (`ctx` is the first field).
fn plugin_from_object(guest: u32, object: u32, what: &str) -> Option<Arc<HostedPlugin>> {
    plugin_from_ctx(guest, object, 0, what)
}

// ---- clap_host ----

pub(crate) extern "C" fn host_get_extension(guest: u32, _host: u32, id: u32) -> u32 {
    let Some(shared) = shared_for(guest) else {
        return 0;
    };
    extension_table(&shared, GuestPtr::from_address(id))
}

fn extension_table(shared: &WclapShared, id: GuestPtr<u8>) -> u32 {
    let Some(tables) = shared.tables.get() else {
        return 0;
    };
    let Some(id) = util::guest_cstr_to_string(&shared.instance, id, MAX_EXTENSION_ID) else {
        return 0;
    };

    let id = id.as_bytes();
    if id == CLAP_EXT_AUDIO_PORTS.to_bytes() {
        tables.audio_ports.address()
    } else if id == CLAP_EXT_GUI.to_bytes() {
        tables.gui.address()
    } else if id == CLAP_EXT_LATENCY.to_bytes() {
        tables.latency.address()
    } else if id == CLAP_EXT_NOTE_PORTS.to_bytes() {
        tables.note_ports.address()
    } else if id == CLAP_EXT_PARAMS.to_bytes() {
        tables.params.address()
    } else if id == CLAP_EXT_STATE.to_bytes() {
        tables.state.address()
    } else if id == CLAP_EXT_TAIL.to_bytes() {
        tables.tail.address()
    } else if id == CLAP_EXT_WEBVIEW.to_bytes() {
        tables.webview.address()
    } else {
        log::trace!(
            "The plugin asked for the unsupported host extension '{}'",
            String::from_utf8_lossy(id)
        );
        0
    }
}

pub(crate) extern "C" fn host_request_restart(guest: u32, host: u32) {
    if plugin_from_host(guest, host, "clap_host::request_restart()").is_some() {
        log::trace!("'clap_host::request_restart()' is not supported");
    }
}

pub(crate) extern "C" fn host_request_process(guest: u32, host: u32) {
    if plugin_from_host(guest, host, "clap_host::request_process()").is_some() {
        log::trace!("'clap_host::request_process()' is not supported");
    }
}

pub(crate) extern "C" fn host_request_callback(guest: u32, host: u32) {
    if let Some(plugin) = plugin_from_host(guest, host, "clap_host::request_callback()") {
        plugin.request_callback();
    }
}

// ---- clap_host_audio_ports ----

pub(crate) extern "C" fn audio_ports_is_rescan_flag_supported(
    guest: u32,
    host: u32,
    _flag: u32,
) -> u32 {
    let _ = plugin_from_host(guest, host, "clap_host_audio_ports::is_rescan_flag_supported()");
    log::trace!("'clap_host_audio_ports::is_rescan_flag_supported()' is not supported");
    false as u32
}

pub(crate) extern "C" fn audio_ports_rescan(guest: u32, host: u32, flags: u32) {
    if plugin_from_host(guest, host, "clap_host_audio_ports::rescan()").is_some() {
        log::trace!("'clap_host_audio_ports::rescan({flags:#x})' is not supported");
    }
}

// ---- clap_host_gui ----

pub(crate) extern "C" fn gui_resize_hints_changed(guest: u32, host: u32) {
    if plugin_from_host(guest, host, "clap_host_gui::resize_hints_changed()").is_some() {
        log::trace!("'clap_host_gui::resize_hints_changed()' is not supported");
    }
}

pub(crate) extern "C" fn gui_request_resize(guest: u32, host: u32, width: u32, height: u32) -> u32 {
    let _ = plugin_from_host(guest, host, "clap_host_gui::request_resize()");
    log::trace!("'clap_host_gui::request_resize({width}, {height})' is not supported");
    false as u32
}

pub(crate) extern "C" fn gui_request_show(guest: u32, host: u32) -> u32 {
    let _ = plugin_from_host(guest, host, "clap_host_gui::request_show()");
    log::trace!("'clap_host_gui::request_show()' is not supported");
    false as u32
}

pub(crate) extern "C" fn gui_request_hide(guest: u32, host: u32) -> u32 {
    let _ = plugin_from_host(guest, host, "clap_host_gui::request_hide()");
    log::trace!("'clap_host_gui::request_hide()' is not supported");
    false as u32
}

pub(crate) extern "C" fn gui_closed(guest: u32, host: u32, was_destroyed: u32) {
    if plugin_from_host(guest, host, "clap_host_gui::closed()").is_some() {
        log::trace!("'clap_host_gui::closed(was_destroyed: {was_destroyed})'");
    }
}

// ---- clap_host_latency ----

pub(crate) extern "C" fn latency_changed(guest: u32, host: u32) {
    if plugin_from_host(guest, host, "clap_host_latency::changed()").is_some() {
        log::trace!("'clap_host_latency::changed()' noted");
    }
}

// ---- clap_host_note_ports ----

pub(crate) extern "C" fn note_ports_supported_dialects(guest: u32, host: u32) -> u32 {
    let _ = plugin_from_host(guest, host, "clap_host_note_ports::supported_dialects()");
    CLAP_NOTE_DIALECT_CLAP | CLAP_NOTE_DIALECT_MIDI | CLAP_NOTE_DIALECT_MIDI2
}

pub(crate) extern "C" fn note_ports_rescan(guest: u32, host: u32, flags: u32) {
    if plugin_from_host(guest, host, "clap_host_note_ports::rescan()").is_some() {
        log::trace!("'clap_host_note_ports::rescan({flags:#x})' is not supported");
    }
}

// ---- clap_host_params ----

pub(crate) extern "C" fn params_rescan(guest: u32, host: u32, flags: u32) {
    if let Some(plugin) = plugin_from_host(guest, host, "clap_host_params::rescan()") {
        ffi::outer::params_rescan(&plugin, flags);
    }
}

pub(crate) extern "C" fn params_clear(guest: u32, host: u32, param_id: u32, flags: u32) {
    if plugin_from_host(guest, host, "clap_host_params::clear()").is_some() {
        log::trace!("'clap_host_params::clear({param_id}, {flags:#x})' is not supported");
    }
}

pub(crate) extern "C" fn params_request_flush(guest: u32, host: u32) {
    if plugin_from_host(guest, host, "clap_host_params::request_flush()").is_some() {
        // The outer application drives flushes; there is nothing to schedule here
        log::trace!("'clap_host_params::request_flush()' noted");
    }
}

// ---- clap_host_state ----

pub(crate) extern "C" fn state_mark_dirty(guest: u32, host: u32) {
    if let Some(plugin) = plugin_from_host(guest, host, "clap_host_state::mark_dirty()") {
        ffi::outer::state_mark_dirty(&plugin);
    }
}

// ---- clap_host_tail ----

pub(crate) extern "C" fn tail_changed(guest: u32, host: u32) {
    if plugin_from_host(guest, host, "clap_host_tail::changed()").is_some() {
        log::trace!("'clap_host_tail::changed()' noted");
    }
}

// ---- clap_host_webview ----

pub(crate) extern "C" fn webview_send(guest: u32, host: u32, buffer: u32, length: u32) -> u32 {
    match plugin_from_host(guest, host, "clap_host_webview::send()") {
        Some(plugin) => ffi::outer::webview_send(&plugin, buffer, length) as u32,
        None => false as u32,
    }
}

// ---- clap_input_events / clap_output_events ----

pub(crate) extern "C" fn input_events_size(guest: u32, list: u32) -> u32 {
    match plugin_from_object(guest, list, "clap_input_events::size()") {
        Some(plugin) => plugin.input_events_size(),
        None => 0,
    }
}

pub(crate) extern "C" fn input_events_get(guest: u32, list: u32, index: u32) -> u32 {
    match plugin_from_object(guest, list, "clap_input_events::get()") {
        Some(plugin) => plugin.input_events_get(index).address(),
        None => 0,
    }
}

pub(crate) extern "C" fn output_events_try_push(guest: u32, list: u32, event: u32) -> u32 {
    match plugin_from_object(guest, list, "clap_output_events::try_push()") {
        Some(plugin) if event != 0 => {
            plugin.output_events_try_push(GuestPtr::from_address(event)) as u32
        }
        _ => false as u32,
    }
}

// ---- clap_istream / clap_ostream ----

pub(crate) extern "C" fn istream_read(guest: u32, stream: u32, buffer: u32, size: u64) -> i64 {
    match plugin_from_object(guest, stream, "clap_istream::read()") {
        Some(plugin) => plugin.stream_read(GuestPtr::from_address(buffer), size),
        None => 0,
    }
}

pub(crate) extern "C" fn ostream_write(guest: u32, stream: u32, buffer: u32, size: u64) -> i64 {
    match plugin_from_object(guest, stream, "clap_ostream::write()") {
        Some(plugin) => plugin.stream_write(GuestPtr::from_address(buffer), size),
        None => 0,
    }
}
