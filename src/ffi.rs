//! The C ABI exposed to the outer application, and the imports expected back
//! from it.
//!
//! Structured arguments and replies are CBOR-encoded [`Bytes`] buffers; raw
//! payloads (event headers, plugin state, webview messages) are passed as-is.
//! Handles are opaque: `GuestInstance` and `HostedPlugin` pointers are
//! `Arc::into_raw` allocations, `HostedWclap` pointers are boxed.

use serde::Serialize;
use std::sync::Arc;

use crate::bytes::Bytes;
use crate::guest::GuestInstance;
use crate::hosted::{HostedPlugin, HostedWclap};
use crate::util::check_null_ptr;

fn write_cbor<T: Serialize>(value: &T, out: &mut Bytes) {
    let mut buffer = Vec::new();
    match ciborium::into_writer(value, &mut buffer) {
        Ok(()) => out.assign(&buffer),
        Err(err) => {
            log::error!("Could not encode a CBOR reply: {err}");
            out.assign(&[]);
        }
    }
}

fn write_cbor_null(out: &mut Bytes) {
    // A unit serializes as CBOR null
    write_cbor(&(), out);
}

// ---- Guest instance plumbing ----

/// Wrap a guest module the runtime has loaded under `index`. Returns null when no transport is
/// available.
#[no_mangle]
pub extern "C" fn guest_instance_create(index: u32, is64: bool) -> *mut GuestInstance {
    match GuestInstance::new(index, is64) {
        Some(instance) => Arc::into_raw(instance) as *mut GuestInstance,
        None => {
            log::error!("No guest transport is installed");
            std::ptr::null_mut()
        }
    }
}

/// Resize the instance's resource-path buffer and return a pointer for the runtime to fill with
/// UTF-8. Must happen before `make_hosted`.
#[no_mangle]
pub unsafe extern "C" fn guest_instance_set_path(
    instance: *mut GuestInstance,
    length: u32,
) -> *mut u8 {
    check_null_ptr!(std::ptr::null_mut(), instance);
    (*instance).set_path_buffer(length as usize)
}

/// Relay thread-specific initialization into the guest module.
#[no_mangle]
pub unsafe extern "C" fn guest_instance_init_thread(
    instance: *mut GuestInstance,
    thread_id: i32,
    start_arg: u64,
) {
    check_null_ptr!((), instance);
    (*instance).init_thread(thread_id, start_arg);
}

// ---- Hosted modules ----

/// Host a guest module. Takes ownership of the instance; returns null (and releases it) when the
/// module is 64-bit, has no entry point or factory, or fails its own `init()`.
#[no_mangle]
pub unsafe extern "C" fn make_hosted(instance: *mut GuestInstance) -> *mut HostedWclap {
    check_null_ptr!(std::ptr::null_mut(), instance);

    let instance = Arc::from_raw(instance);
    match HostedWclap::new(instance) {
        Ok(hosted) => Box::into_raw(Box::new(hosted)),
        Err(err) => {
            log::error!("Could not host the module: {err:#}");
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn remove_hosted(hosted: *mut HostedWclap) {
    check_null_ptr!((), hosted);
    drop(Box::from_raw(hosted));
}

/// CBOR out: `{clapVersion, path, plugins}`.
#[no_mangle]
pub unsafe extern "C" fn get_info(hosted: *mut HostedWclap, out: *mut Bytes) {
    check_null_ptr!((), hosted, out);
    write_cbor(&(*hosted).info(), &mut *out);
}

/// CBOR in: the plugin id string. Returns null when the factory rejects the id.
#[no_mangle]
pub unsafe extern "C" fn create_plugin(
    hosted: *mut HostedWclap,
    bytes: *mut Bytes,
) -> *mut HostedPlugin {
    check_null_ptr!(std::ptr::null_mut(), hosted, bytes);

    let id: String = match ciborium::from_reader((*bytes).as_slice()) {
        Ok(id) => id,
        Err(err) => {
            log::debug!("'create_plugin' was passed an invalid CBOR id: {err}");
            return std::ptr::null_mut();
        }
    };

    match (*hosted).create_plugin(&id) {
        Some(plugin) => Arc::into_raw(plugin) as *mut HostedPlugin,
        None => std::ptr::null_mut(),
    }
}

// ---- Hosted plug-ins ----

#[no_mangle]
pub unsafe extern "C" fn destroy_plugin(plugin: *mut HostedPlugin) {
    check_null_ptr!((), plugin);
    let plugin = Arc::from_raw(plugin as *const HostedPlugin);
    plugin.destroy();
}

#[no_mangle]
pub unsafe extern "C" fn plugin_main_thread(plugin: *mut HostedPlugin) {
    check_null_ptr!((), plugin);
    (*plugin).main_thread();
}

/// CBOR out: `{desc, webview}`.
#[no_mangle]
pub unsafe extern "C" fn plugin_get_info(plugin: *mut HostedPlugin, out: *mut Bytes) {
    check_null_ptr!((), plugin, out);
    write_cbor(&(*plugin).info(), &mut *out);
}

/// Raw in: one webview message.
#[no_mangle]
pub unsafe extern "C" fn plugin_message(plugin: *mut HostedPlugin, bytes: *mut Bytes) {
    check_null_ptr!((), plugin, bytes);
    (*plugin).message((*bytes).as_slice());
}

/// Raw in: the resource path. CBOR out: `{type, bytes}` or null.
#[no_mangle]
pub unsafe extern "C" fn plugin_get_resource(plugin: *mut HostedPlugin, bytes: *mut Bytes) -> bool {
    check_null_ptr!(false, plugin, bytes);
    let bytes = &mut *bytes;
    let path = String::from_utf8_lossy(bytes.as_slice()).into_owned();

    match (*plugin).get_resource(&path) {
        Some((mime, data)) => {
            use ciborium::Value;
            let reply = Value::Map(vec![
                (Value::Text("type".into()), Value::Text(mime)),
                (Value::Text("bytes".into()), Value::Bytes(data)),
            ]);
            write_cbor(&reply, bytes);
            true
        }
        None => {
            write_cbor_null(bytes);
            false
        }
    }
}

/// CBOR out: `[{id, flags, name, module, min, max, default}]`.
#[no_mangle]
pub unsafe extern "C" fn plugin_get_params(plugin: *mut HostedPlugin, out: *mut Bytes) {
    check_null_ptr!((), plugin, out);
    write_cbor(&(*plugin).params(), &mut *out);
}

/// CBOR out: `{value, text?}`, a diagnostic string, or null without the params extension.
#[no_mangle]
pub unsafe extern "C" fn plugin_get_param(plugin: *mut HostedPlugin, id: u32, out: *mut Bytes) {
    check_null_ptr!((), plugin, out);
    match (*plugin).param_value(id) {
        Some(reply) => write_cbor(&reply, &mut *out),
        None => write_cbor_null(&mut *out),
    }
}

#[no_mangle]
pub unsafe extern "C" fn plugin_set_param(plugin: *mut HostedPlugin, id: u32, value: f64) {
    check_null_ptr!((), plugin);
    (*plugin).set_param(id, value);
}

#[no_mangle]
pub unsafe extern "C" fn plugin_params_flush(plugin: *mut HostedPlugin) {
    check_null_ptr!((), plugin);
    (*plugin).params_flush();
}

/// CBOR out: `{inputs, outputs}` channel addresses on success, null on failure.
#[no_mangle]
pub unsafe extern "C" fn plugin_start(
    plugin: *mut HostedPlugin,
    sample_rate: f64,
    min_frames: u32,
    max_frames: u32,
    out: *mut Bytes,
) -> bool {
    check_null_ptr!(false, plugin, out);
    match (*plugin).start(sample_rate, min_frames, max_frames) {
        Some(ports) => {
            write_cbor(&ports, &mut *out);
            true
        }
        None => {
            write_cbor_null(&mut *out);
            false
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn plugin_stop(plugin: *mut HostedPlugin) {
    check_null_ptr!((), plugin);
    (*plugin).stop();
}

/// Raw in: one event, starting with its `clap_event_header`. Returns true iff the event type is
/// safe to forward and was queued.
#[no_mangle]
pub unsafe extern "C" fn plugin_accept_event(plugin: *mut HostedPlugin, bytes: *mut Bytes) -> bool {
    check_null_ptr!(false, plugin, bytes);
    (*plugin).accept_event((*bytes).as_slice())
}

/// Raw out: the plug-in's state.
#[no_mangle]
pub unsafe extern "C" fn plugin_save_state(plugin: *mut HostedPlugin, bytes: *mut Bytes) -> bool {
    check_null_ptr!(false, plugin, bytes);
    match (*plugin).save_state() {
        Some(data) => {
            (*bytes).assign(&data);
            true
        }
        None => {
            (*bytes).assign(&[]);
            false
        }
    }
}

/// Raw in: state previously produced by `plugin_save_state`.
#[no_mangle]
pub unsafe extern "C" fn plugin_load_state(plugin: *mut HostedPlugin, bytes: *mut Bytes) -> bool {
    check_null_ptr!(false, plugin, bytes);
    (*plugin).load_state((*bytes).as_slice())
}

/// Returns the `clap_process_status`.
#[no_mangle]
pub unsafe extern "C" fn plugin_process(plugin: *mut HostedPlugin, block_length: u32) -> u32 {
    check_null_ptr!(0, plugin);
    (*plugin).process(block_length)
}

#[no_mangle]
pub unsafe extern "C" fn plugin_get_latency(plugin: *mut HostedPlugin) -> u32 {
    check_null_ptr!(0, plugin);
    (*plugin).latency()
}

#[no_mangle]
pub unsafe extern "C" fn plugin_get_tail(plugin: *mut HostedPlugin) -> u32 {
    check_null_ptr!(0, plugin);
    (*plugin).tail()
}

// ---- Byte buffers ----

#[no_mangle]
pub extern "C" fn bytes_create() -> *mut Bytes {
    Box::into_raw(Box::new(Bytes::new()))
}

#[no_mangle]
pub unsafe extern "C" fn bytes_free(bytes: *mut Bytes) {
    check_null_ptr!((), bytes);
    drop(Box::from_raw(bytes));
}

#[no_mangle]
pub unsafe extern "C" fn bytes_data(bytes: *mut Bytes) -> *mut u8 {
    check_null_ptr!(std::ptr::null_mut(), bytes);
    (*bytes).data_ptr()
}

#[no_mangle]
pub unsafe extern "C" fn bytes_length(bytes: *const Bytes) -> u32 {
    check_null_ptr!(0, bytes);
    (*bytes).len() as u32
}

#[no_mangle]
pub unsafe extern "C" fn bytes_resize(bytes: *mut Bytes, length: u32) -> *mut u8 {
    check_null_ptr!(std::ptr::null_mut(), bytes);
    (*bytes).resize(length as usize)
}

// ---- Logging ----

/// One-time logging setup. `verbosity` 0 keeps it at info, 1 enables debug and 2 enables trace
/// output. On WebAssembly builds log records are forwarded through the runtime's `log` import.
#[no_mangle]
pub extern "C" fn host_init_logging(verbosity: i32) {
    let level = match verbosity {
        i32::MIN..=0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    #[cfg(not(target_family = "wasm"))]
    {
        let config = simplelog::ConfigBuilder::new()
            .set_thread_level(log::LevelFilter::Off)
            .build();
        if simplelog::TermLogger::init(
            level,
            config,
            simplelog::TerminalMode::Stderr,
            simplelog::ColorChoice::Auto,
        )
        .is_ok()
        {
            log_panics::init();
        }
    }

    #[cfg(target_family = "wasm")]
    {
        if log::set_logger(&outer::RuntimeLogger).is_ok() {
            log::set_max_level(level);
        }
    }
}

// ---- Imports from the outer runtime ----

/// The functions the core expects from the outer runtime's `env` module. On native builds (used
/// by the tests and by embedders that install their own transport) the calls are recorded and
/// acknowledged so the bridge behaves identically.
pub mod outer {
    use crate::hosted::HostedPlugin;

    #[cfg(target_family = "wasm")]
    mod env {
        #[link(wasm_import_module = "env")]
        extern "C" {
            #[link_name = "eventsOutTryPush"]
            pub fn events_out_try_push(plugin: *const (), address: u32, length: u32) -> bool;
            #[link_name = "webviewSend"]
            pub fn webview_send(plugin: *const (), address: u32, length: u32) -> bool;
            #[link_name = "stateMarkDirty"]
            pub fn state_mark_dirty(plugin: *const ()) -> bool;
            #[link_name = "paramsRescan"]
            pub fn params_rescan(plugin: *const (), flags: u32) -> bool;
            #[link_name = "log"]
            pub fn log(plugin: *const (), severity: i32, address: u32, length: u32) -> bool;
        }
    }

    /// What the native stand-ins record, so embedders and tests can observe the forwarded calls.
    #[cfg(not(target_family = "wasm"))]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum OuterCall {
        EventsOutTryPush {
            plugin: usize,
            address: u32,
            length: u32,
        },
        WebviewSend {
            plugin: usize,
            address: u32,
            length: u32,
        },
        StateMarkDirty {
            plugin: usize,
        },
        ParamsRescan {
            plugin: usize,
            flags: u32,
        },
    }

    #[cfg(not(target_family = "wasm"))]
    static RECORDED: parking_lot::Mutex<Vec<OuterCall>> = parking_lot::Mutex::new(Vec::new());

    /// Drain the calls recorded by the native stand-ins.
    #[cfg(not(target_family = "wasm"))]
    pub fn take_recorded() -> Vec<OuterCall> {
        std::mem::take(&mut *RECORDED.lock())
    }

    fn plugin_handle(plugin: &HostedPlugin) -> *const () {
        plugin as *const HostedPlugin as *const ()
    }

    pub(crate) fn events_out_try_push(plugin: &HostedPlugin, address: u32, length: u32) -> bool {
        #[cfg(target_family = "wasm")]
        unsafe {
            env::events_out_try_push(plugin_handle(plugin), address, length)
        }
        #[cfg(not(target_family = "wasm"))]
        {
            RECORDED.lock().push(OuterCall::EventsOutTryPush {
                plugin: plugin_handle(plugin) as usize,
                address,
                length,
            });
            true
        }
    }

    pub(crate) fn webview_send(plugin: &HostedPlugin, address: u32, length: u32) -> bool {
        #[cfg(target_family = "wasm")]
        unsafe {
            env::webview_send(plugin_handle(plugin), address, length)
        }
        #[cfg(not(target_family = "wasm"))]
        {
            RECORDED.lock().push(OuterCall::WebviewSend {
                plugin: plugin_handle(plugin) as usize,
                address,
                length,
            });
            true
        }
    }

    pub(crate) fn state_mark_dirty(plugin: &HostedPlugin) -> bool {
        #[cfg(target_family = "wasm")]
        unsafe {
            env::state_mark_dirty(plugin_handle(plugin))
        }
        #[cfg(not(target_family = "wasm"))]
        {
            RECORDED.lock().push(OuterCall::StateMarkDirty {
                plugin: plugin_handle(plugin) as usize,
            });
            true
        }
    }

    pub(crate) fn params_rescan(plugin: &HostedPlugin, flags: u32) -> bool {
        #[cfg(target_family = "wasm")]
        unsafe {
            env::params_rescan(plugin_handle(plugin), flags)
        }
        #[cfg(not(target_family = "wasm"))]
        {
            RECORDED.lock().push(OuterCall::ParamsRescan {
                plugin: plugin_handle(plugin) as usize,
                flags,
            });
            true
        }
    }

    /// Forwards the crate's own log records through the runtime's `log` import, with a null
    /// plugin handle. Only used on WebAssembly builds, where there is no terminal to print to.
    #[cfg(target_family = "wasm")]
    pub struct RuntimeLogger;

    #[cfg(target_family = "wasm")]
    impl log::Log for RuntimeLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            use clap_sys::ext::log::{
                CLAP_LOG_DEBUG, CLAP_LOG_ERROR, CLAP_LOG_INFO, CLAP_LOG_WARNING,
            };

            let severity = match record.level() {
                log::Level::Error => CLAP_LOG_ERROR,
                log::Level::Warn => CLAP_LOG_WARNING,
                log::Level::Info => CLAP_LOG_INFO,
                log::Level::Debug | log::Level::Trace => CLAP_LOG_DEBUG,
            };
            let message = record.args().to_string();
            unsafe {
                env::log(
                    std::ptr::null(),
                    severity,
                    message.as_ptr() as u32,
                    message.len() as u32,
                );
            }
        }

        fn flush(&self) {}
    }
}
