//! One hosted CLAP plug-in instance: extension discovery, parameters, state
//! streams, the audio-thread event queue and the process-struct plumbing.

use crossbeam::atomic::AtomicCell;
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::cell::RefCell;
use std::ffi::CStr;
use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use clap_sys::events::{CLAP_CORE_EVENT_SPACE_ID, CLAP_EVENT_IS_LIVE, CLAP_EVENT_PARAM_VALUE};
use clap_sys::ext::audio_ports::CLAP_EXT_AUDIO_PORTS;
use clap_sys::ext::gui::CLAP_EXT_GUI;
use clap_sys::ext::latency::CLAP_EXT_LATENCY;
use clap_sys::ext::note_ports::CLAP_EXT_NOTE_PORTS;
use clap_sys::ext::params::CLAP_EXT_PARAMS;
use clap_sys::ext::state::CLAP_EXT_STATE;
use clap_sys::ext::tail::CLAP_EXT_TAIL;
use clap_sys::process::CLAP_PROCESS_ERROR;

use super::wclap::{descriptor_info, DescriptorInfo};
use super::WclapShared;
use crate::clap32::events::{EventHeader32, EventParamValue32, EVENT_ALIGN};
use crate::clap32::ext::{
    InputEvents32, OutputEvents32, PluginAudioPorts32, PluginGui32, PluginLatency32,
    PluginNotePorts32, PluginParams32, PluginState32, PluginTail32, PluginWebview32,
    CLAP_EXT_WEBVIEW,
};
use crate::clap32::{
    AudioBuffer32, AudioPortInfo32, ClapHost32, ClapPlugin32, ClapProcess32, IStream32, OStream32,
    ParamInfo32,
};
use crate::guest::arena::{Arena, ArenaScope};
use crate::guest::pointer::{value_bytes, GuestPtr};
use crate::guest::GuestInstance;
use crate::{ffi, util};

/// The diagnostic the outer application receives in place of a value when the plug-in refuses
/// `clap_plugin_params::get_value()`.
pub const GET_VALUE_FAILED: &str = "plugin_params.get_value() returned false";

/// Size of the guest-side buffer `clap_plugin_webview::get_uri()` writes into.
const WEBVIEW_URI_BYTES: u32 = 2048;
/// Size of the MIME-type buffer for webview resource fetches.
const MIME_BYTES: u32 = 256;
/// Size of the buffer `clap_plugin_params::value_to_text()` writes into.
const TEXT_BYTES: u32 = 256;
/// Number of arena commitments a freshly created plug-in carries (the per-plugin host tables
/// committed by `create_plugin`). `start()` resets the arena back to this depth.
const CREATION_COMMITS: usize = 1;

/// The plug-in's activation state, tracked so `stop()` only calls the lifecycle functions that
/// apply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum PluginStatus {
    #[default]
    Deactivated,
    Activated,
    Processing,
}

/// Cached extension pointers, discovered once during `init()`. Null when the plug-in does not
/// implement the extension.
#[derive(Debug, Default, Clone, Copy)]
struct Extensions {
    audio_ports: GuestPtr<PluginAudioPorts32>,
    gui: GuestPtr<PluginGui32>,
    latency: GuestPtr<PluginLatency32>,
    note_ports: GuestPtr<PluginNotePorts32>,
    params: GuestPtr<PluginParams32>,
    state: GuestPtr<PluginState32>,
    tail: GuestPtr<PluginTail32>,
    webview: GuestPtr<PluginWebview32>,
}

/// An event staged into the audio-thread arena, ready to be served to the plug-in.
#[derive(Debug, Clone, Copy)]
struct CopiedEvent {
    time: u32,
    ptr: GuestPtr<EventHeader32>,
}

/// The pending-event queue plus the staged list served during `process()`/`flush()`. Everything
/// in here is guarded by the recursive event lock.
#[derive(Debug, Default)]
struct EventState {
    /// Raw event payloads, stored contiguously at [`EVENT_ALIGN`]ed offsets.
    pending: Vec<u8>,
    /// Start offset of each pending event, strictly increasing.
    starts: Vec<u32>,
    /// Events already copied into the audio-thread arena, sorted by time once staged.
    copied: Vec<CopiedEvent>,
}

impl EventState {
    /// Append one raw event (already validated against its header).
    fn push_raw(&mut self, bytes: &[u8]) {
        let offset = (self.pending.len() + EVENT_ALIGN - 1) & !(EVENT_ALIGN - 1);
        self.pending.resize(offset, 0);
        self.pending.extend_from_slice(bytes);
        self.starts.push(offset as u32);
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.starts.clear();
        self.copied.clear();
    }
}

/// The buffer behind the `clap_istream`/`clap_ostream` trampolines. Guarded by the recursive
/// stream lock.
#[derive(Debug, Default)]
struct StreamState {
    data: Vec<u8>,
    read_cursor: usize,
}

impl StreamState {
    fn reset(&mut self) {
        self.data.clear();
        self.read_cursor = 0;
    }
}

/// Reply to `plugin_get_param`: either the value (with its optional text rendering), or the
/// literal diagnostic string.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ParamValueReply {
    Value {
        value: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Failure(&'static str),
}

/// One entry of the `plugin_get_params` reply.
#[derive(Debug, Serialize)]
pub struct ParamDescription {
    pub id: u32,
    pub flags: u32,
    pub name: String,
    pub module: String,
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

/// Reply to `plugin_get_info`.
#[derive(Debug, Serialize)]
pub struct PluginInfo {
    pub desc: DescriptorInfo,
    pub webview: Option<String>,
}

/// Reply to `plugin_start`: the guest addresses of every port's channel buffers, so the caller
/// can write input and read output samples directly.
#[derive(Debug, Serialize)]
pub struct ProcessPorts {
    pub inputs: Vec<Vec<u32>>,
    pub outputs: Vec<Vec<u32>>,
}

/// A CLAP plug-in instance living in the guest, together with everything the host keeps for it:
/// its arena, the pending-event queue, the state-stream buffer and the cached extension
/// pointers. Shared as an `Arc`; the outer application's `plugin*` handle is a raw pointer to
/// this allocation.
pub struct HostedPlugin {
    wclap: Arc<WclapShared>,

    plugin: GuestPtr<ClapPlugin32>,
    host: GuestPtr<ClapHost32>,
    in_events: GuestPtr<InputEvents32>,
    out_events: GuestPtr<OutputEvents32>,
    istream: GuestPtr<IStream32>,
    ostream: GuestPtr<OStream32>,

    registry_key: OnceLock<u32>,
    ext: OnceLock<Extensions>,

    /// The audio-thread arena. `None` once the plug-in has been destroyed and the arena went
    /// back to the pool.
    arena: Mutex<Option<Arena>>,
    /// Recursive: `process()` holds it across the guest call while the guest re-enters through
    /// the event-list trampolines.
    events: ReentrantMutex<RefCell<EventState>>,
    /// Recursive for the same reason, via the stream trampolines.
    stream: ReentrantMutex<RefCell<StreamState>>,

    process_struct: AtomicCell<GuestPtr<ClapProcess32>>,
    status: AtomicCell<PluginStatus>,
    /// Cleared by `request_callback`, test-and-set by `main_thread()` so each request triggers
    /// exactly one `on_main_thread`.
    callback_handled: AtomicBool,
}

impl HostedPlugin {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        wclap: Arc<WclapShared>,
        plugin: GuestPtr<ClapPlugin32>,
        host: GuestPtr<ClapHost32>,
        in_events: GuestPtr<InputEvents32>,
        out_events: GuestPtr<OutputEvents32>,
        istream: GuestPtr<IStream32>,
        ostream: GuestPtr<OStream32>,
        arena: Arena,
    ) -> Arc<HostedPlugin> {
        Arc::new(HostedPlugin {
            wclap,
            plugin,
            host,
            in_events,
            out_events,
            istream,
            ostream,
            registry_key: OnceLock::new(),
            ext: OnceLock::new(),
            arena: Mutex::new(Some(arena)),
            events: ReentrantMutex::new(RefCell::new(EventState::default())),
            stream: ReentrantMutex::new(RefCell::new(StreamState::default())),
            process_struct: AtomicCell::new(GuestPtr::null()),
            status: AtomicCell::new(PluginStatus::Deactivated),
            callback_handled: AtomicBool::new(true),
        })
    }

    fn instance(&self) -> &Arc<GuestInstance> {
        &self.wclap.instance
    }

    pub(crate) fn set_registry_key(&self, key: u32) {
        let _ = self.registry_key.set(key);
    }

    pub(crate) fn host_ptr(&self) -> GuestPtr<ClapHost32> {
        self.host
    }
    pub(crate) fn in_events_ptr(&self) -> GuestPtr<InputEvents32> {
        self.in_events
    }
    pub(crate) fn out_events_ptr(&self) -> GuestPtr<OutputEvents32> {
        self.out_events
    }
    pub(crate) fn istream_ptr(&self) -> GuestPtr<IStream32> {
        self.istream
    }
    pub(crate) fn ostream_ptr(&self) -> GuestPtr<OStream32> {
        self.ostream
    }

    fn ext(&self) -> Extensions {
        self.ext.get().copied().unwrap_or_default()
    }

    /// Initialize the plug-in and discover its extensions. Called once, right after the factory
    /// created the instance.
    pub(crate) fn init(&self) -> bool {
        let instance = self.instance();
        let plugin = instance.get(self.plugin);
        if !instance.call(plugin.init, (self.plugin,)) {
            return false;
        }

        let mut arena = self.arena.lock();
        let Some(arena) = arena.as_mut() else {
            return false;
        };
        let mut scope = arena.scoped();

        let mut lookup = |id: &CStr| -> GuestPtr<()> {
            let id_ptr = scope.write_cstr(id);
            instance.call(plugin.get_extension, (self.plugin, id_ptr))
        };
        let extensions = Extensions {
            audio_ports: lookup(CLAP_EXT_AUDIO_PORTS).cast(),
            gui: lookup(CLAP_EXT_GUI).cast(),
            latency: lookup(CLAP_EXT_LATENCY).cast(),
            note_ports: lookup(CLAP_EXT_NOTE_PORTS).cast(),
            params: lookup(CLAP_EXT_PARAMS).cast(),
            state: lookup(CLAP_EXT_STATE).cast(),
            tail: lookup(CLAP_EXT_TAIL).cast(),
            webview: lookup(CLAP_EXT_WEBVIEW).cast(),
        };
        let _ = self.ext.set(extensions);

        true
    }

    /// Destroy the guest-side instance, release the registry entry and return the arena to the
    /// pool. Safe to call once; later calls are ignored.
    pub fn destroy(&self) {
        let Some(arena) = self.arena.lock().take() else {
            log::debug!("Plugin destroyed more than once");
            return;
        };

        let instance = self.instance();
        let plugin = instance.get(self.plugin);
        instance.call(plugin.destroy, (self.plugin,));

        if let Some(&key) = self.registry_key.get() {
            self.wclap.plugins.release(key);
        }

        self.process_struct.store(GuestPtr::null());
        self.wclap.pool.lock().reclaim(arena);
    }

    /// The plug-in's descriptor plus its webview starting URI, if it has a webview.
    pub fn info(&self) -> PluginInfo {
        let instance = self.instance();
        let plugin = instance.get(self.plugin);

        PluginInfo {
            desc: descriptor_info(instance, plugin.desc),
            webview: self.webview_uri(),
        }
    }

    fn webview_uri(&self) -> Option<String> {
        let webview = self.ext().webview;
        if webview.is_null() {
            return None;
        }

        let instance = self.instance();
        let mut arena = self.arena.lock();
        let arena = arena.as_mut()?;
        let mut scope = arena.scoped();

        let buffer = scope.array::<u8>(WEBVIEW_URI_BYTES);
        let ext = instance.get(webview);
        let length = instance.call(ext.get_uri, (self.plugin, buffer, WEBVIEW_URI_BYTES - 1));
        if length <= 0 || length >= WEBVIEW_URI_BYTES as i32 {
            return None;
        }

        let mut bytes = vec![0u8; length as usize];
        if !instance.get_array(buffer, &mut bytes) {
            return None;
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    // ---- Parameters ----

    /// Describe every parameter. An empty list when the plug-in has no params extension.
    pub fn params(&self) -> Vec<ParamDescription> {
        let params = self.ext().params;
        if params.is_null() {
            return Vec::new();
        }

        let instance = self.instance();
        let ext = instance.get(params);
        let count = instance.call(ext.count, (self.plugin,));

        let mut arena = self.arena.lock();
        let Some(arena) = arena.as_mut() else {
            return Vec::new();
        };
        let mut scope = arena.scoped();
        let scratch = scope.array::<ParamInfo32>(1);

        let mut result = Vec::with_capacity(count as usize);
        for index in 0..count {
            if !instance.call(ext.get_info, (self.plugin, index, scratch)) {
                log::debug!("Plugin returned false when querying parameter {index}");
                continue;
            }

            let mut info = instance.get(scratch);
            // Tolerate plugins that fill the whole buffer without terminating
            info.name[255] = 0;
            info.module[1023] = 0;

            result.push(ParamDescription {
                id: info.id,
                flags: info.flags,
                name: util::fixed_cstr_to_string(&info.name),
                module: util::fixed_cstr_to_string(&info.module),
                min: info.min_value,
                max: info.max_value,
                default: info.default_value,
            });
        }
        result
    }

    /// Read one parameter's value and its text rendering. `None` when the plug-in has no params
    /// extension.
    pub fn param_value(&self, param_id: u32) -> Option<ParamValueReply> {
        let params = self.ext().params;
        if params.is_null() {
            return None;
        }

        let instance = self.instance();
        let ext = instance.get(params);

        let mut arena = self.arena.lock();
        let arena = arena.as_mut()?;
        let mut scope = arena.scoped();

        let value_ptr = scope.array::<f64>(1);
        if !instance.call(ext.get_value, (self.plugin, param_id, value_ptr)) {
            return Some(ParamValueReply::Failure(GET_VALUE_FAILED));
        }
        let value = instance.get(value_ptr);

        let text_buffer = scope.array::<u8>(TEXT_BYTES);
        let text = if instance.call(
            ext.value_to_text,
            (self.plugin, param_id, value, text_buffer, TEXT_BYTES - 1),
        ) {
            util::guest_cstr_to_string(instance, text_buffer, TEXT_BYTES - 1)
                .filter(|text| !text.is_empty())
        } else {
            None
        };

        Some(ParamValueReply::Value { value, text })
    }

    /// Queue a `PARAM_VALUE` event for the next `process()` or `params_flush()`. The cookie is
    /// left null, so plug-ins must look the parameter up by id.
    pub fn set_param(&self, param_id: u32, value: f64) {
        let event = EventParamValue32 {
            header: EventHeader32 {
                size: std::mem::size_of::<EventParamValue32>() as u32,
                time: 0,
                space_id: CLAP_CORE_EVENT_SPACE_ID,
                type_: CLAP_EVENT_PARAM_VALUE,
                flags: CLAP_EVENT_IS_LIVE,
            },
            param_id,
            cookie: GuestPtr::null(),
            note_id: -1,
            port_index: -1,
            channel: -1,
            key: -1,
            _pad: [0; 6],
            value,
        };
        self.add_event(value_bytes(&event));
    }

    /// Queue one raw event. Returns false when the bytes don't parse as an event.
    pub fn add_event(&self, raw: &[u8]) -> bool {
        let Some(header) = EventHeader32::from_bytes(raw) else {
            log::debug!("Rejected an event with a malformed header");
            return false;
        };
        if header.size as usize > raw.len() {
            log::debug!(
                "Rejected an event whose recorded size {} exceeds its {} payload bytes",
                header.size,
                raw.len()
            );
            return false;
        }

        let events = self.events.lock();
        events.borrow_mut().push_raw(&raw[..header.size as usize]);
        true
    }

    /// Queue an event coming from another plug-in, if its type is safe to forward without ABI
    /// translation. Returns true iff the event was accepted.
    pub fn accept_event(&self, raw: &[u8]) -> bool {
        match EventHeader32::from_bytes(raw) {
            Some(header) if header.is_forwardable() => self.add_event(raw),
            _ => false,
        }
    }

    /// Flush queued parameter events through `clap_plugin_params::flush()`. Non-parameter events
    /// stay queued for the next `process()`.
    pub fn params_flush(&self) {
        let params = self.ext().params;
        if params.is_null() {
            return;
        }

        let instance = self.instance();
        let events = self.events.lock();
        let mut arena = self.arena.lock();
        let Some(arena) = arena.as_mut() else {
            return;
        };
        let mut scope = arena.scoped();

        stage_pending(instance, &mut scope, &mut *events.borrow_mut(), true);

        let ext = instance.get(params);
        instance.call(ext.flush, (self.plugin, self.in_events, self.out_events));

        events.borrow_mut().copied.clear();
    }

    // ---- Activation and processing ----

    /// Activate the plug-in, allocate its audio buffers in guest memory and build the process
    /// struct. Returns the guest addresses of the channel buffers, or `None` when the plug-in
    /// refused to activate.
    pub fn start(
        &self,
        sample_rate: f64,
        min_frames: u32,
        max_frames: u32,
    ) -> Option<ProcessPorts> {
        let instance = self.instance();
        let mut arena_slot = self.arena.lock();
        let arena = arena_slot.as_mut()?;

        let plugin = instance.get(self.plugin);
        if !instance.call(
            plugin.activate,
            (self.plugin, sample_rate, min_frames, max_frames),
        ) {
            log::debug!("'clap_plugin::activate()' returned false");
            return None;
        }
        self.status.store(PluginStatus::Activated);

        if !instance.call(plugin.start_processing, (self.plugin,)) {
            log::debug!("'clap_plugin::start_processing()' returned false");
            instance.call(plugin.deactivate, (self.plugin,));
            self.status.store(PluginStatus::Deactivated);
            return None;
        }
        self.status.store(PluginStatus::Processing);

        // Drop the previous generation of buffers, keeping the per-plugin tables committed at
        // creation time
        self.process_struct.store(GuestPtr::null());
        arena.reset_to_commit(CREATION_COMMITS);

        let mut scope = arena.scoped();
        let (inputs, input_buffers, input_count) =
            self.build_port_buffers(&mut scope, true, max_frames);
        let (outputs, output_buffers, output_count) =
            self.build_port_buffers(&mut scope, false, max_frames);

        let process = ClapProcess32 {
            steady_time: -1,
            frames_count: 0,
            transport: GuestPtr::null(),
            audio_inputs: input_buffers,
            audio_outputs: output_buffers,
            audio_inputs_count: input_count,
            audio_outputs_count: output_count,
            in_events: self.in_events,
            out_events: self.out_events,
        };
        let process_ptr = scope.copy_across(&process);
        scope.commit();
        self.process_struct.store(process_ptr);

        Some(ProcessPorts { inputs, outputs })
    }

    /// Allocate one `clap_audio_buffer` per port, each channel backed by a `max_frames` float
    /// array in guest memory. Returns the channel addresses per port, the buffer array and the
    /// port count.
    fn build_port_buffers(
        &self,
        scope: &mut ArenaScope,
        is_input: bool,
        max_frames: u32,
    ) -> (Vec<Vec<u32>>, GuestPtr<AudioBuffer32>, u32) {
        let audio_ports = self.ext().audio_ports;
        if audio_ports.is_null() {
            return (Vec::new(), GuestPtr::null(), 0);
        }

        let instance = self.instance();
        let ext = instance.get(audio_ports);
        let count = instance.call(ext.count, (self.plugin, is_input));

        let buffers = scope.array::<AudioBuffer32>(count);
        let scratch = scope.array::<AudioPortInfo32>(1);

        let mut ports = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut channel_count = 0;
            if instance.call(ext.get, (self.plugin, index, is_input, scratch)) {
                channel_count = instance.get(scratch).channel_count;
            } else {
                log::debug!("Plugin returned false when querying audio port {index}");
            }

            let channels = scope.array::<GuestPtr<f32>>(channel_count);
            let mut addresses = Vec::with_capacity(channel_count as usize);
            for channel in 0..channel_count {
                let data = scope.array::<f32>(max_frames);
                instance.set_at(channels, data, channel);
                addresses.push(data.address());
            }

            instance.set_at(
                buffers,
                AudioBuffer32 {
                    data32: channels,
                    data64: GuestPtr::null(),
                    channel_count,
                    latency: 0,
                    constant_mask: 0,
                },
                index,
            );
            ports.push(addresses);
        }

        (ports, buffers, count)
    }

    /// Process one block: stage every pending event into the audio-thread arena, run the
    /// plug-in, clear the queues. Returns the `clap_process_status`.
    pub fn process(&self, block_length: u32) -> u32 {
        let process_ptr = self.process_struct.load();
        if process_ptr.is_null() {
            log::warn!("'process()' called before a successful 'start()'");
            return CLAP_PROCESS_ERROR as u32;
        }

        let instance = self.instance();
        let events = self.events.lock();
        let mut arena = self.arena.lock();
        let Some(arena) = arena.as_mut() else {
            return CLAP_PROCESS_ERROR as u32;
        };
        let mut scope = arena.scoped();

        stage_pending(instance, &mut scope, &mut *events.borrow_mut(), false);

        instance.set(
            process_ptr.field::<u32>(offset_of!(ClapProcess32, frames_count) as u32),
            block_length,
        );

        let plugin = instance.get(self.plugin);
        let status = instance.call(plugin.process, (self.plugin, process_ptr));

        // Always clear, even if the plug-in left events unconsumed
        events.borrow_mut().clear();

        status as u32
    }

    /// Stop processing and deactivate, in that order, skipping whatever the current state makes
    /// inapplicable.
    pub fn stop(&self) {
        let instance = self.instance();
        let plugin = instance.get(self.plugin);

        if self.status.load() == PluginStatus::Processing {
            instance.call(plugin.stop_processing, (self.plugin,));
            self.status.store(PluginStatus::Activated);
        }
        if self.status.load() == PluginStatus::Activated {
            instance.call(plugin.deactivate, (self.plugin,));
            self.status.store(PluginStatus::Deactivated);
        }
    }

    // ---- State ----

    /// Save the plug-in's state through the `clap_ostream` trampoline. `None` when there is no
    /// state extension or the plug-in refused.
    pub fn save_state(&self) -> Option<Vec<u8>> {
        let state = self.ext().state;
        if state.is_null() {
            return None;
        }

        let instance = self.instance();
        let stream = self.stream.lock();
        stream.borrow_mut().reset();

        let ext = instance.get(state);
        if !instance.call(ext.save, (self.plugin, self.ostream)) {
            return None;
        }

        let data = stream.borrow().data.clone();
        Some(data)
    }

    /// Restore state previously produced by [`save_state()`][Self::save_state()].
    pub fn load_state(&self, bytes: &[u8]) -> bool {
        let state = self.ext().state;
        if state.is_null() {
            return false;
        }

        let instance = self.instance();
        let stream = self.stream.lock();
        {
            let mut stream = stream.borrow_mut();
            stream.reset();
            stream.data.extend_from_slice(bytes);
        }

        let ext = instance.get(state);
        instance.call(ext.load, (self.plugin, self.istream))
    }

    // ---- Webview ----

    /// Deliver a message to the plug-in's webview handler. A no-op when the extension is absent.
    pub fn message(&self, bytes: &[u8]) {
        let webview = self.ext().webview;
        if webview.is_null() {
            return;
        }

        let instance = self.instance();
        let mut arena = self.arena.lock();
        let Some(arena) = arena.as_mut() else {
            return;
        };
        let mut scope = arena.scoped();

        let buffer = scope.write_bytes(bytes);
        let ext = instance.get(webview);
        instance.call(ext.receive, (self.plugin, buffer, bytes.len() as u32));
    }

    /// Fetch a webview resource: `(mime type, body)`. `None` when the extension is absent or the
    /// plug-in refused the path.
    pub fn get_resource(&self, path: &str) -> Option<(String, Vec<u8>)> {
        let webview = self.ext().webview;
        if webview.is_null() {
            return None;
        }

        let instance = self.instance();
        let stream = self.stream.lock();
        stream.borrow_mut().reset();

        let mut arena = self.arena.lock();
        let arena = arena.as_mut()?;
        let mut scope = arena.scoped();

        let path_ptr = scope.write_str(path);
        let mime_ptr = scope.array::<u8>(MIME_BYTES);
        instance.set(mime_ptr, 0u8);

        let ext = instance.get(webview);
        if !instance.call(
            ext.get_resource,
            (self.plugin, path_ptr, mime_ptr, MIME_BYTES - 1, self.ostream),
        ) {
            return None;
        }

        let mime =
            util::guest_cstr_to_string(instance, mime_ptr, MIME_BYTES - 1).unwrap_or_default();
        let data = stream.borrow().data.clone();
        Some((mime, data))
    }

    // ---- Misc host callbacks and queries ----

    /// The plug-in's reported latency in samples, 0 without the extension.
    pub fn latency(&self) -> u32 {
        let latency = self.ext().latency;
        if latency.is_null() {
            return 0;
        }
        let instance = self.instance();
        let ext = instance.get(latency);
        instance.call(ext.get, (self.plugin,))
    }

    /// The plug-in's tail length in samples, 0 without the extension.
    pub fn tail(&self) -> u32 {
        let tail = self.ext().tail;
        if tail.is_null() {
            return 0;
        }
        let instance = self.instance();
        let ext = instance.get(tail);
        instance.call(ext.get, (self.plugin,))
    }

    /// Run the main-thread callback if one is due. Invokes `on_main_thread` exactly once per
    /// `request_callback` the plug-in made.
    pub fn main_thread(&self) {
        if !self.callback_handled.swap(true, Ordering::SeqCst) {
            let instance = self.instance();
            let plugin = instance.get(self.plugin);
            instance.call(plugin.on_main_thread, (self.plugin,));
        }
    }

    /// `clap_host::request_callback()` trampoline body.
    pub(crate) fn request_callback(&self) {
        self.callback_handled.store(false, Ordering::SeqCst);
    }

    // ---- Trampoline servers ----

    pub(crate) fn input_events_size(&self) -> u32 {
        let events = self.events.lock();
        let size = events.borrow().copied.len();
        size as u32
    }

    pub(crate) fn input_events_get(&self, index: u32) -> GuestPtr<EventHeader32> {
        let events = self.events.lock();
        let events = events.borrow();
        match events.copied.get(index as usize) {
            Some(event) => event.ptr,
            None => {
                log::warn!(
                    "The plugin asked for event {index} ({} staged events)",
                    events.copied.len()
                );
                GuestPtr::null()
            }
        }
    }

    pub(crate) fn output_events_try_push(&self, event: GuestPtr<EventHeader32>) -> bool {
        let instance = self.instance();
        let size = instance.get(event.field::<u32>(offset_of!(EventHeader32, size) as u32));
        if size == 0 {
            log::debug!("The plugin pushed an output event with size 0");
            return false;
        }
        ffi::outer::events_out_try_push(self, event.address(), size)
    }

    pub(crate) fn stream_read(&self, buffer: GuestPtr<u8>, size: u64) -> i64 {
        let instance = self.instance();
        let stream = self.stream.lock();
        let mut stream = stream.borrow_mut();

        let available = stream.data.len() - stream.read_cursor;
        let count = available.min(size as usize);
        if count > 0 {
            let from = stream.read_cursor;
            if !instance.set_array(buffer, &stream.data[from..from + count]) {
                return 0;
            }
        }
        stream.read_cursor += count;
        count as i64
    }

    pub(crate) fn stream_write(&self, buffer: GuestPtr<u8>, size: u64) -> i64 {
        let instance = self.instance();
        let mut bytes = vec![0u8; size as usize];
        if !instance.get_array(buffer, &mut bytes) {
            return 0;
        }

        let stream = self.stream.lock();
        stream.borrow_mut().data.extend_from_slice(&bytes);
        size as i64
    }
}

impl std::fmt::Debug for HostedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HostedPlugin")
            .field("plugin", &self.plugin)
            .field("host", &self.host)
            .field("registry_key", &self.registry_key.get())
            .finish_non_exhaustive()
    }
}

/// Move pending events into the audio-thread arena: matching events are copied across and listed
/// in `copied` (sorted stably by time), the rest are compacted in place and stay pending. With
/// `params_only` unset everything matches and the pending queue comes out empty.
fn stage_pending(
    instance: &Arc<GuestInstance>,
    scope: &mut ArenaScope,
    state: &mut EventState,
    params_only: bool,
) {
    let mut write_pos = 0usize;
    let mut kept = 0usize;

    for i in 0..state.starts.len() {
        let start = state.starts[i] as usize;
        let Some(header) = state.pending.get(start..).and_then(EventHeader32::from_bytes) else {
            continue;
        };
        let size = header.size as usize;
        if start + size > state.pending.len() {
            continue;
        }

        if params_only && !header.is_param_event() {
            // Keep it pending, compacted towards the front
            let dest = (write_pos + EVENT_ALIGN - 1) & !(EVENT_ALIGN - 1);
            state.pending.copy_within(start..start + size, dest);
            state.starts[kept] = dest as u32;
            kept += 1;
            write_pos = dest + size;
            continue;
        }

        // Events carry 8-byte fields, so give them full alignment in guest memory
        let ptr = scope.reserve(size as u32, 8).cast::<EventHeader32>();
        if ptr.is_null() {
            continue;
        }
        instance.set_array(ptr.cast::<u8>(), &state.pending[start..start + size]);
        state.copied.push(CopiedEvent {
            time: header.time,
            ptr,
        });
    }

    state.starts.truncate(kept);
    state.pending.truncate(write_pos);

    // Stable: events with equal times keep their insertion order
    state.copied.sort_by_key(|event| event.time);
}
