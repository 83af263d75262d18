//! A mock transport plus a small scripted guest module, so the whole bridge
//! can be exercised without a WebAssembly runtime.
//!
//! The mock keeps one `Vec<u8>` linear memory and one function table per
//! guest. Guest functions are closures; host registrations store the
//! `HostCallback` directly, so "the guest calling back into the host" is a
//! plain function-pointer call with the guest index prepended, exactly the
//! contract the real runtime implements.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use wclap_host::clap32::events::{EventHeader32, EventNote32, EventParamValue32};
use wclap_host::clap32::ext::{
    InputEvents32, OStream32, PluginAudioPorts32, PluginParams32, PluginState32, PluginWebview32,
};
use wclap_host::clap32::{
    AudioPortInfo32, ClapDescriptor32, ClapEntry32, ClapFactory32, ClapHost32, ClapPlugin32,
    ClapProcess32, ClapVersion32, ParamInfo32,
};
use wclap_host::guest::pointer::{value_bytes, GuestFn, GuestPtr, GuestValue};
use wclap_host::guest::transport::{self, HostCallback, TaggedValue, Transport};

pub const CLAP_EVENT_NOTE_ON: u16 = 0;
pub const CLAP_EVENT_PARAM_VALUE: u16 = 5;
pub const CLAP_PROCESS_CONTINUE: i32 = 1;

pub type GuestClosure = Arc<dyn Fn(u32, &[TaggedValue]) -> TaggedValue + Send + Sync>;

enum TableEntry {
    Unused,
    Guest(GuestClosure),
    Host(HostCallback),
}

struct MockGuest {
    memory: Vec<u8>,
    brk: u32,
    table: Vec<TableEntry>,
    entry_address: u32,
    malloc_calls: u32,
}

impl MockGuest {
    fn new() -> Self {
        MockGuest {
            // Address 0 is null; start allocations a little way in
            memory: vec![0; 1 << 20],
            brk: 64,
            table: vec![TableEntry::Unused],
            entry_address: 0,
            malloc_calls: 0,
        }
    }

    fn malloc(&mut self, size: u32) -> u32 {
        self.malloc_calls += 1;
        let address = (self.brk + 7) & !7;
        let end = address as usize + size as usize;
        if end > self.memory.len() {
            self.memory.resize(end.next_power_of_two(), 0);
        }
        self.brk = end as u32;
        address
    }
}

/// The process-wide mock transport. Tests share it; each scripted module gets its own guest
/// index, so tests stay isolated.
pub struct MockTransport {
    guests: ReentrantMutex<RefCell<HashMap<u32, MockGuest>>>,
    next_guest: AtomicU32,
}

impl MockTransport {
    fn new() -> Self {
        MockTransport {
            guests: ReentrantMutex::new(RefCell::new(HashMap::new())),
            next_guest: AtomicU32::new(1),
        }
    }

    pub fn add_guest(&self) -> u32 {
        let index = self.next_guest.fetch_add(1, Ordering::SeqCst);
        let guard = self.guests.lock();
        guard.borrow_mut().insert(index, MockGuest::new());
        index
    }

    pub fn guest_alloc(&self, guest: u32, size: u32) -> u32 {
        let guard = self.guests.lock();
        let mut guests = guard.borrow_mut();
        guests.get_mut(&guest).map(|g| g.malloc(size)).unwrap_or(0)
    }

    pub fn malloc_calls(&self, guest: u32) -> u32 {
        let guard = self.guests.lock();
        let calls = guard.borrow().get(&guest).map(|g| g.malloc_calls);
        calls.unwrap_or(0)
    }

    pub fn add_function(&self, guest: u32, function: GuestClosure) -> u32 {
        let guard = self.guests.lock();
        let mut guests = guard.borrow_mut();
        let guest = guests.get_mut(&guest).expect("unknown guest");
        guest.table.push(TableEntry::Guest(function));
        (guest.table.len() - 1) as u32
    }

    pub fn set_entry_address(&self, guest: u32, address: u32) {
        let guard = self.guests.lock();
        guard
            .borrow_mut()
            .get_mut(&guest)
            .expect("unknown guest")
            .entry_address = address;
    }

    pub fn read_vec(&self, guest: u32, address: u32, length: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; length as usize];
        assert!(self.copy_from_guest(guest, &mut bytes, address));
        bytes
    }

    pub fn read_value<T: GuestValue>(&self, guest: u32, address: u32) -> T {
        let bytes = self.read_vec(guest, address, std::mem::size_of::<T>() as u32);
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
    }

    pub fn write_value<T: GuestValue>(&self, guest: u32, address: u32, value: &T) {
        assert!(self.copy_to_guest(guest, address, value_bytes(value)));
    }

    pub fn read_cstr(&self, guest: u32, address: u32) -> String {
        let length = self.count_until32(guest, address, &[0], 4096);
        String::from_utf8_lossy(&self.read_vec(guest, address, length)).into_owned()
    }

    /// Place a value in fresh guest memory and return its address.
    pub fn store(&self, guest: u32, value: &impl GuestValue) -> u32 {
        let address = self.guest_alloc(guest, std::mem::size_of_val(value) as u32);
        assert!(self.copy_to_guest(guest, address, value_bytes(value)));
        address
    }

    /// Place a NUL-terminated string in fresh guest memory.
    pub fn store_str(&self, guest: u32, string: &str) -> u32 {
        let address = self.guest_alloc(guest, string.len() as u32 + 1);
        let mut bytes = string.as_bytes().to_vec();
        bytes.push(0);
        assert!(self.copy_to_guest(guest, address, &bytes));
        address
    }

    /// Invoke a registered host callback the way the runtime would: the guest-side arguments,
    /// with the guest index prepended.
    pub fn invoke_host(&self, guest: u32, function: u32, args: &[TaggedValue]) -> TaggedValue {
        let callback = {
            let guard = self.guests.lock();
            let guests = guard.borrow();
            let guest = guests.get(&guest).expect("unknown guest");
            match guest.table.get(function as usize) {
                Some(TableEntry::Host(callback)) => *callback,
                _ => panic!("function {function} is not a registered host callback"),
            }
        };

        let arg = |index: usize| args.get(index).copied().unwrap_or_default();
        match callback {
            HostCallback::V2(f) => {
                f(guest, arg(0).as_u32());
                TaggedValue::default()
            }
            HostCallback::V3(f) => {
                f(guest, arg(0).as_u32(), arg(1).as_u32());
                TaggedValue::default()
            }
            HostCallback::V4(f) => {
                f(guest, arg(0).as_u32(), arg(1).as_u32(), arg(2).as_u32());
                TaggedValue::default()
            }
            HostCallback::U2(f) => TaggedValue::from_i32(f(guest, arg(0).as_u32())),
            HostCallback::U3(f) => {
                TaggedValue::from_i32(f(guest, arg(0).as_u32(), arg(1).as_u32()))
            }
            HostCallback::U4(f) => TaggedValue::from_i32(f(
                guest,
                arg(0).as_u32(),
                arg(1).as_u32(),
                arg(2).as_u32(),
            )),
            HostCallback::Stream(f) => TaggedValue::from_i64(f(
                guest,
                arg(0).as_u32(),
                arg(1).as_u32(),
                arg(2).as_u64(),
            ) as u64),
        }
    }
}

impl Transport for MockTransport {
    fn init_thread(&self, _guest: u32, _thread_id: i32, _start_arg: u64) {}

    fn release(&self, guest: u32) {
        let guard = self.guests.lock();
        guard.borrow_mut().remove(&guest);
    }

    fn init32(&self, guest: u32) -> u32 {
        let guard = self.guests.lock();
        let address = guard.borrow().get(&guest).map(|g| g.entry_address);
        address.unwrap_or(0)
    }

    fn malloc32(&self, guest: u32, size: u32) -> u32 {
        self.guest_alloc(guest, size)
    }

    fn copy_to_guest(&self, guest: u32, dest: u32, source: &[u8]) -> bool {
        if dest == 0 {
            return false;
        }
        let guard = self.guests.lock();
        let mut guests = guard.borrow_mut();
        let Some(guest) = guests.get_mut(&guest) else {
            return false;
        };
        let end = dest as usize + source.len();
        if end > guest.memory.len() {
            return false;
        }
        guest.memory[dest as usize..end].copy_from_slice(source);
        true
    }

    fn copy_from_guest(&self, guest: u32, dest: &mut [u8], source: u32) -> bool {
        if source == 0 {
            return false;
        }
        let guard = self.guests.lock();
        let guests = guard.borrow();
        let Some(guest) = guests.get(&guest) else {
            return false;
        };
        let end = source as usize + dest.len();
        if end > guest.memory.len() {
            return false;
        }
        dest.copy_from_slice(&guest.memory[source as usize..end]);
        true
    }

    fn count_until32(&self, guest: u32, start: u32, sentinel: &[u8], max_count: u32) -> u32 {
        let guard = self.guests.lock();
        let guests = guard.borrow();
        let Some(guest) = guests.get(&guest) else {
            return 0;
        };

        let stride = sentinel.len().max(1);
        for index in 0..max_count {
            let offset = start as usize + index as usize * stride;
            match guest.memory.get(offset..offset + stride) {
                Some(element) if element == sentinel => return index,
                Some(_) => {}
                None => return index,
            }
        }
        max_count
    }

    fn call32(&self, guest_index: u32, function: u32, args: &[TaggedValue]) -> Option<TaggedValue> {
        let closure = {
            let guard = self.guests.lock();
            let guests = guard.borrow();
            let guest = guests.get(&guest_index)?;
            match guest.table.get(function as usize) {
                Some(TableEntry::Guest(closure)) => Arc::clone(closure),
                _ => return None,
            }
        };

        // The reentrant lock is still held here, which is exactly what we want: the closure may
        // call back into the transport (and through host trampolines, into the bridge) from this
        // same thread.
        Some(closure(guest_index, args))
    }

    fn register_host32(&self, guest: u32, callback: HostCallback) -> u32 {
        let guard = self.guests.lock();
        let mut guests = guard.borrow_mut();
        let guest = guests.get_mut(&guest).expect("unknown guest");
        guest.table.push(TableEntry::Host(callback));
        (guest.table.len() - 1) as u32
    }
}

static MOCK: OnceLock<MockTransport> = OnceLock::new();

/// The installed mock transport (installing it on first use).
pub fn mock() -> &'static MockTransport {
    let transport_ref = MOCK.get_or_init(MockTransport::new);
    transport::install(transport_ref);
    transport_ref
}

// ---- The scripted gain module ----

/// What the scripted plug-in has seen so far; tests assert against this.
#[derive(Debug, Default)]
pub struct FakePluginState {
    pub entry_init_path: Option<String>,
    pub plugin_inited: bool,
    pub destroyed: bool,
    pub activated: Option<(f64, u32, u32)>,
    pub processing: bool,
    pub on_main_thread_calls: u32,
    pub last_process_frames: u32,
    pub observed_events: Vec<ObservedEvent>,
    pub flushed_events: Vec<ObservedEvent>,
    pub params: BTreeMap<u32, f64>,
    pub received_messages: Vec<Vec<u8>>,
    /// The `clap_host` pointer handed to `create_plugin`, so tests can drive host callbacks the
    /// way the guest would.
    pub host_address: u32,
    /// When set, `process()` pushes one note event through `clap_output_events::try_push`.
    pub push_output_event: bool,
    /// When unset, `webview.get_uri` reports no UI.
    pub webview_uri: Option<String>,
}

/// One event as the scripted plug-in saw it through the input-event list.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEvent {
    pub time: u32,
    pub type_: u16,
    pub param_id: u32,
    pub value: f64,
    pub key: i16,
}

pub struct FakeModule {
    pub guest: u32,
    pub state: Arc<Mutex<FakePluginState>>,
}

/// Read the event list at `list_address` through the host trampolines, the way a plug-in would.
fn drain_event_list(guest: u32, list_address: u32) -> Vec<ObservedEvent> {
    let transport_ref = mock();
    let list: InputEvents32 = transport_ref.read_value(guest, list_address);
    let count = transport_ref
        .invoke_host(
            guest,
            list.size.index(),
            &[TaggedValue::from_i32(list_address)],
        )
        .as_u32();

    let mut events = Vec::new();
    for index in 0..count {
        let event_address = transport_ref
            .invoke_host(
                guest,
                list.get.index(),
                &[
                    TaggedValue::from_i32(list_address),
                    TaggedValue::from_i32(index),
                ],
            )
            .as_u32();
        if event_address == 0 {
            continue;
        }

        let header: EventHeader32 = transport_ref.read_value(guest, event_address);
        let mut observed = ObservedEvent {
            time: header.time,
            type_: header.type_,
            param_id: 0,
            value: 0.0,
            key: -1,
        };
        if header.type_ == CLAP_EVENT_PARAM_VALUE {
            let event: EventParamValue32 = transport_ref.read_value(guest, event_address);
            observed.param_id = event.param_id;
            observed.value = event.value;
        } else if header.type_ == CLAP_EVENT_NOTE_ON {
            let event: EventNote32 = transport_ref.read_value(guest, event_address);
            observed.key = event.key;
            observed.value = event.velocity;
        }
        events.push(observed);
    }
    events
}

/// Serialize the scripted plug-in's parameters: `(id, value)` pairs, sorted by id.
fn encode_state(params: &BTreeMap<u32, f64>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (&id, &value) in params {
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_state(bytes: &[u8]) -> BTreeMap<u32, f64> {
    let mut params = BTreeMap::new();
    for chunk in bytes.chunks_exact(12) {
        let id = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
        let value = f64::from_le_bytes(chunk[4..12].try_into().unwrap());
        params.insert(id, value);
    }
    params
}

fn nul_padded<const N: usize>(text: &str) -> [u8; N] {
    let mut buffer = [0u8; N];
    buffer[..text.len()].copy_from_slice(text.as_bytes());
    buffer
}

/// Build a guest module exposing two plug-ins: `my.gain` (params, state, audio ports, latency,
/// tail and a webview) and `my.noext` (no extensions at all).
pub fn install_gain_module() -> FakeModule {
    let transport_ref = mock();
    let guest = transport_ref.add_guest();
    let state = Arc::new(Mutex::new(FakePluginState {
        params: BTreeMap::from([(17, 0.5), (23, 1.0)]),
        webview_uri: Some("https://plugin.example/ui".to_owned()),
        ..FakePluginState::default()
    }));

    let version = ClapVersion32 {
        major: 1,
        minor: 2,
        revision: 7,
    };

    // Descriptors
    let features = [
        GuestPtr::<u8>::from_address(transport_ref.store_str(guest, "audio-effect")),
        GuestPtr::<u8>::from_address(transport_ref.store_str(guest, "stereo")),
        GuestPtr::null(),
    ];
    let gain_descriptor = ClapDescriptor32 {
        clap_version: version,
        id: GuestPtr::from_address(transport_ref.store_str(guest, "my.gain")),
        name: GuestPtr::from_address(transport_ref.store_str(guest, "Gain")),
        vendor: GuestPtr::from_address(transport_ref.store_str(guest, "Test Audio")),
        url: GuestPtr::null(),
        manual_url: GuestPtr::null(),
        support_url: GuestPtr::null(),
        version: GuestPtr::from_address(transport_ref.store_str(guest, "1.0.0")),
        description: GuestPtr::from_address(transport_ref.store_str(guest, "A test gain")),
        features: GuestPtr::from_address(transport_ref.store(guest, &features)),
    };
    let gain_descriptor_address = transport_ref.store(guest, &gain_descriptor);

    let noext_descriptor = ClapDescriptor32 {
        id: GuestPtr::from_address(transport_ref.store_str(guest, "my.noext")),
        name: GuestPtr::from_address(transport_ref.store_str(guest, "Bare")),
        description: GuestPtr::from_address(transport_ref.store_str(guest, "No extensions")),
        features: GuestPtr::null(),
        ..gain_descriptor
    };
    let noext_descriptor_address = transport_ref.store(guest, &noext_descriptor);

    // ---- clap_plugin_audio_ports: one stereo port each way ----
    let audio_ports_count = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::from_i32(1));
        transport_ref.add_function(guest, closure)
    };
    let audio_ports_get = {
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let index = args[1].as_u32();
            let out = args[3].as_u32();
            if index != 0 || out == 0 {
                return TaggedValue::from_i32(0);
            }
            let info = AudioPortInfo32 {
                id: index,
                name: nul_padded("main"),
                flags: 0,
                channel_count: 2,
                port_type: GuestPtr::null(),
                in_place_pair: u32::MAX,
            };
            mock().write_value(guest, out, &info);
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let audio_ports_ext = PluginAudioPorts32 {
        count: GuestFn::from_index(audio_ports_count),
        get: GuestFn::from_index(audio_ports_get),
    };
    let audio_ports_address = transport_ref.store(guest, &audio_ports_ext);

    // ---- clap_plugin_params: "Gain" (17) and "Mix" (23) ----
    let params_count = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::from_i32(2));
        transport_ref.add_function(guest, closure)
    };
    let params_get_info = {
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let index = args[1].as_u32();
            let out = args[2].as_u32();
            let (id, name) = match index {
                0 => (17, "Gain"),
                1 => (23, "Mix"),
                _ => return TaggedValue::from_i32(0),
            };
            let info = ParamInfo32 {
                id,
                flags: 0,
                cookie: GuestPtr::null(),
                name: nul_padded(name),
                module: nul_padded("main"),
                _pad: [0; 4],
                min_value: 0.0,
                max_value: 1.0,
                default_value: 0.5,
            };
            mock().write_value(guest, out, &info);
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let params_get_value = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let id = args[1].as_u32();
            let out = args[2].as_u32();
            match state.lock().unwrap().params.get(&id) {
                Some(&value) => {
                    mock().write_value(guest, out, &value);
                    TaggedValue::from_i32(1)
                }
                None => TaggedValue::from_i32(0),
            }
        });
        transport_ref.add_function(guest, closure)
    };
    let params_value_to_text = {
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let value = args[2].as_f64();
            let out = args[3].as_u32();
            let capacity = args[4].as_u32();
            let text = format!("{value:.2} dB");
            if text.len() as u32 >= capacity {
                return TaggedValue::from_i32(0);
            }
            let mut bytes = text.into_bytes();
            bytes.push(0);
            mock().copy_to_guest(guest, out, &bytes);
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let params_text_to_value = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::from_i32(0));
        transport_ref.add_function(guest, closure)
    };
    let params_flush = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let events = drain_event_list(guest, args[1].as_u32());
            let mut state = state.lock().unwrap();
            for event in &events {
                if event.type_ == CLAP_EVENT_PARAM_VALUE {
                    state.params.insert(event.param_id, event.value);
                }
            }
            state.flushed_events.extend(events);
            TaggedValue::default()
        });
        transport_ref.add_function(guest, closure)
    };
    let params_ext = PluginParams32 {
        count: GuestFn::from_index(params_count),
        get_info: GuestFn::from_index(params_get_info),
        get_value: GuestFn::from_index(params_get_value),
        value_to_text: GuestFn::from_index(params_value_to_text),
        text_to_value: GuestFn::from_index(params_text_to_value),
        flush: GuestFn::from_index(params_flush),
    };
    let params_address = transport_ref.store(guest, &params_ext);

    // ---- clap_plugin_state: the params, serialized ----
    let state_save = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let ostream_address = args[1].as_u32();
            let blob = encode_state(&state.lock().unwrap().params);

            let scratch = mock().guest_alloc(guest, blob.len() as u32);
            mock().copy_to_guest(guest, scratch, &blob);

            let ostream: OStream32 = mock().read_value(guest, ostream_address);
            let written = mock()
                .invoke_host(
                    guest,
                    ostream.write.index(),
                    &[
                        TaggedValue::from_i32(ostream_address),
                        TaggedValue::from_i32(scratch),
                        TaggedValue::from_i64(blob.len() as u64),
                    ],
                )
                .as_i64();
            TaggedValue::from_i32((written == blob.len() as i64) as u32)
        });
        transport_ref.add_function(guest, closure)
    };
    let state_load = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let istream_address = args[1].as_u32();
            let istream: wclap_host::clap32::IStream32 = mock().read_value(guest, istream_address);

            // Read in deliberately small chunks to exercise the stream cursor
            let scratch = mock().guest_alloc(guest, 8);
            let mut blob = Vec::new();
            loop {
                let count = mock()
                    .invoke_host(
                        guest,
                        istream.read.index(),
                        &[
                            TaggedValue::from_i32(istream_address),
                            TaggedValue::from_i32(scratch),
                            TaggedValue::from_i64(8),
                        ],
                    )
                    .as_i64();
                if count <= 0 {
                    break;
                }
                blob.extend_from_slice(&mock().read_vec(guest, scratch, count as u32));
            }

            state.lock().unwrap().params = decode_state(&blob);
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let state_ext = PluginState32 {
        save: GuestFn::from_index(state_save),
        load: GuestFn::from_index(state_load),
    };
    let state_address = transport_ref.store(guest, &state_ext);

    // ---- clap_plugin_webview ----
    let webview_get_uri = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let out = args[1].as_u32();
            let capacity = args[2].as_u32();
            match &state.lock().unwrap().webview_uri {
                Some(uri) if (uri.len() as u32) < capacity => {
                    mock().copy_to_guest(guest, out, uri.as_bytes());
                    TaggedValue::from_i32(uri.len() as u32)
                }
                _ => TaggedValue::from_i32(0),
            }
        });
        transport_ref.add_function(guest, closure)
    };
    let webview_get_resource = {
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let path = mock().read_cstr(guest, args[1].as_u32());
            let mime_out = args[2].as_u32();
            let ostream_address = args[4].as_u32();
            if path != "index.html" {
                return TaggedValue::from_i32(0);
            }

            let mut mime = b"text/html".to_vec();
            mime.push(0);
            mock().copy_to_guest(guest, mime_out, &mime);

            let body = b"<html>ok</html>";
            let scratch = mock().guest_alloc(guest, body.len() as u32);
            mock().copy_to_guest(guest, scratch, body);
            let ostream: OStream32 = mock().read_value(guest, ostream_address);
            mock().invoke_host(
                guest,
                ostream.write.index(),
                &[
                    TaggedValue::from_i32(ostream_address),
                    TaggedValue::from_i32(scratch),
                    TaggedValue::from_i64(body.len() as u64),
                ],
            );
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let webview_receive = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let bytes = mock().read_vec(guest, args[1].as_u32(), args[2].as_u32());
            state.lock().unwrap().received_messages.push(bytes);
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let webview_ext = PluginWebview32 {
        get_uri: GuestFn::from_index(webview_get_uri),
        get_resource: GuestFn::from_index(webview_get_resource),
        receive: GuestFn::from_index(webview_receive),
    };
    let webview_address = transport_ref.store(guest, &webview_ext);

    // ---- clap_plugin_latency / clap_plugin_tail ----
    let latency_get = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::from_i32(7));
        transport_ref.add_function(guest, closure)
    };
    let latency_address = transport_ref.store(
        guest,
        &wclap_host::clap32::ext::PluginLatency32 {
            get: GuestFn::from_index(latency_get),
        },
    );
    let tail_get = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::from_i32(11));
        transport_ref.add_function(guest, closure)
    };
    let tail_address = transport_ref.store(
        guest,
        &wclap_host::clap32::ext::PluginTail32 {
            get: GuestFn::from_index(tail_get),
        },
    );

    // ---- clap_plugin for "my.gain" ----
    let plugin_init = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |_, _| {
            state.lock().unwrap().plugin_inited = true;
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let plugin_destroy = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |_, _| {
            state.lock().unwrap().destroyed = true;
            TaggedValue::default()
        });
        transport_ref.add_function(guest, closure)
    };
    let plugin_activate = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |_, args| {
            let mut state = state.lock().unwrap();
            state.activated = Some((args[1].as_f64(), args[2].as_u32(), args[3].as_u32()));
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let plugin_deactivate = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |_, _| {
            state.lock().unwrap().activated = None;
            TaggedValue::default()
        });
        transport_ref.add_function(guest, closure)
    };
    let plugin_start_processing = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |_, _| {
            state.lock().unwrap().processing = true;
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let plugin_stop_processing = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |_, _| {
            state.lock().unwrap().processing = false;
            TaggedValue::default()
        });
        transport_ref.add_function(guest, closure)
    };
    let plugin_reset = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::default());
        transport_ref.add_function(guest, closure)
    };
    let plugin_process = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let process_address = args[1].as_u32();
            let process: ClapProcess32 = mock().read_value(guest, process_address);
            let events = drain_event_list(guest, process.in_events.address());

            let push_output = {
                let mut state = state.lock().unwrap();
                state.last_process_frames = process.frames_count;
                for event in &events {
                    if event.type_ == CLAP_EVENT_PARAM_VALUE {
                        state.params.insert(event.param_id, event.value);
                    }
                }
                state.observed_events.extend(events);
                state.push_output_event
            };

            if push_output {
                let note = EventNote32 {
                    header: EventHeader32 {
                        size: std::mem::size_of::<EventNote32>() as u32,
                        time: 3,
                        space_id: 0,
                        type_: CLAP_EVENT_NOTE_ON,
                        flags: 0,
                    },
                    note_id: -1,
                    port_index: 0,
                    channel: 0,
                    key: 64,
                    _pad: [0; 6],
                    velocity: 0.75,
                };
                let scratch = mock().store(guest, &note);
                let out_list: wclap_host::clap32::ext::OutputEvents32 =
                    mock().read_value(guest, process.out_events.address());
                mock().invoke_host(
                    guest,
                    out_list.try_push.index(),
                    &[
                        TaggedValue::from_i32(process.out_events.address()),
                        TaggedValue::from_i32(scratch),
                    ],
                );
            }

            TaggedValue::from_i32(CLAP_PROCESS_CONTINUE as u32)
        });
        transport_ref.add_function(guest, closure)
    };
    let plugin_get_extension = {
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let id = mock().read_cstr(guest, args[1].as_u32());
            let address = match id.as_str() {
                "clap.audio-ports" => audio_ports_address,
                "clap.params" => params_address,
                "clap.state" => state_address,
                "clap.latency" => latency_address,
                "clap.tail" => tail_address,
                "clap.webview/3" => webview_address,
                _ => 0,
            };
            TaggedValue::from_i32(address)
        });
        transport_ref.add_function(guest, closure)
    };
    let plugin_on_main_thread = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |_, _| {
            state.lock().unwrap().on_main_thread_calls += 1;
            TaggedValue::default()
        });
        transport_ref.add_function(guest, closure)
    };

    let gain_plugin = ClapPlugin32 {
        desc: GuestPtr::from_address(gain_descriptor_address),
        plugin_data: GuestPtr::null(),
        init: GuestFn::from_index(plugin_init),
        destroy: GuestFn::from_index(plugin_destroy),
        activate: GuestFn::from_index(plugin_activate),
        deactivate: GuestFn::from_index(plugin_deactivate),
        start_processing: GuestFn::from_index(plugin_start_processing),
        stop_processing: GuestFn::from_index(plugin_stop_processing),
        reset: GuestFn::from_index(plugin_reset),
        process: GuestFn::from_index(plugin_process),
        get_extension: GuestFn::from_index(plugin_get_extension),
        on_main_thread: GuestFn::from_index(plugin_on_main_thread),
    };
    let gain_plugin_address = transport_ref.store(guest, &gain_plugin);

    // "my.noext" reuses the lifecycle functions but exposes no extensions
    let noext_get_extension = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::from_i32(0));
        transport_ref.add_function(guest, closure)
    };
    let noext_plugin = ClapPlugin32 {
        desc: GuestPtr::from_address(noext_descriptor_address),
        get_extension: GuestFn::from_index(noext_get_extension),
        ..gain_plugin
    };
    let noext_plugin_address = transport_ref.store(guest, &noext_plugin);

    // ---- Factory and entry ----
    let factory_get_plugin_count = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::from_i32(2));
        transport_ref.add_function(guest, closure)
    };
    let factory_get_plugin_descriptor = {
        let closure: GuestClosure = Arc::new(move |_, args| {
            TaggedValue::from_i32(match args[1].as_u32() {
                0 => gain_descriptor_address,
                1 => noext_descriptor_address,
                _ => 0,
            })
        });
        transport_ref.add_function(guest, closure)
    };
    let factory_create_plugin = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let host_address = args[1].as_u32();
            let id = mock().read_cstr(guest, args[2].as_u32());
            TaggedValue::from_i32(match id.as_str() {
                "my.gain" => {
                    state.lock().unwrap().host_address = host_address;
                    gain_plugin_address
                }
                "my.noext" => noext_plugin_address,
                _ => 0,
            })
        });
        transport_ref.add_function(guest, closure)
    };
    let factory = ClapFactory32 {
        get_plugin_count: GuestFn::from_index(factory_get_plugin_count),
        get_plugin_descriptor: GuestFn::from_index(factory_get_plugin_descriptor),
        create_plugin: GuestFn::from_index(factory_create_plugin),
    };
    let factory_address = transport_ref.store(guest, &factory);

    let entry_init = {
        let state = state.clone();
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let path = mock().read_cstr(guest, args[0].as_u32());
            state.lock().unwrap().entry_init_path = Some(path);
            TaggedValue::from_i32(1)
        });
        transport_ref.add_function(guest, closure)
    };
    let entry_deinit = {
        let closure: GuestClosure = Arc::new(move |_, _| TaggedValue::default());
        transport_ref.add_function(guest, closure)
    };
    let entry_get_factory = {
        let closure: GuestClosure = Arc::new(move |guest, args| {
            let id = mock().read_cstr(guest, args[0].as_u32());
            TaggedValue::from_i32(if id == "clap.plugin-factory" {
                factory_address
            } else {
                0
            })
        });
        transport_ref.add_function(guest, closure)
    };
    let entry = ClapEntry32 {
        clap_version: version,
        init: GuestFn::from_index(entry_init),
        deinit: GuestFn::from_index(entry_deinit),
        get_factory: GuestFn::from_index(entry_get_factory),
    };
    let entry_address = transport_ref.store(guest, &entry);
    transport_ref.set_entry_address(guest, entry_address);

    FakeModule { guest, state }
}

/// Drive a host callback the way the guest would: read the `clap_host` the plug-in received and
/// invoke one of its function fields by name.
pub fn call_host(module: &FakeModule, which: HostField) -> TaggedValue {
    let host_address = module.state.lock().unwrap().host_address;
    assert_ne!(host_address, 0, "no plugin has been created yet");
    let host: ClapHost32 = mock().read_value(module.guest, host_address);

    let (function, args) = match which {
        HostField::RequestCallback => (
            host.request_callback.index(),
            vec![TaggedValue::from_i32(host_address)],
        ),
        HostField::GetExtension(id) => {
            let id_address = mock().store_str(module.guest, id);
            (
                host.get_extension.index(),
                vec![
                    TaggedValue::from_i32(host_address),
                    TaggedValue::from_i32(id_address),
                ],
            )
        }
    };
    mock().invoke_host(module.guest, function, &args)
}

pub enum HostField {
    RequestCallback,
    GetExtension(&'static str),
}
