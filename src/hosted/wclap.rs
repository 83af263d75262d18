//! One hosted guest module: builds the host tables in guest memory, registers
//! every trampoline, enumerates the plugin factory and creates plug-ins.

use anyhow::{Context, Result};
use clap_sys::factory::plugin_factory::CLAP_PLUGIN_FACTORY_ID;
use serde::Serialize;
use std::mem::offset_of;
use std::sync::{Arc, OnceLock};

use super::{callbacks, plugin::HostedPlugin, WclapShared};
use crate::clap32::ext::{
    HostAudioPorts32, HostGui32, HostLatency32, HostNotePorts32, HostParams32, HostState32,
    HostTail32, HostWebview32, InputEvents32, OutputEvents32,
};
use crate::clap32::{
    ClapDescriptor32, ClapFactory32, ClapHost32, IStream32, OStream32, CLAP_VERSION_32,
};
use crate::guest::arena::{Arena, ArenaPool, ArenaScope};
use crate::guest::pointer::GuestPtr;
use crate::guest::transport::HostCallback;
use crate::guest::GuestInstance;
use crate::registry::Registry;
use crate::util;

/// The longest descriptor string the bridge will copy out of guest memory.
const MAX_STRING: u32 = 255;
/// Upper bound on the `features` array, in case a plugin forgets the NUL terminator.
const MAX_FEATURES: u32 = 64;

/// The host tables as far as the host side needs to remember them. The extension vtables live in
/// the module's global arena and are shared by every plug-in (their functions receive the
/// per-plugin `clap_host` pointer); the five ctx-bearing objects are kept as host-side templates
/// and copied into each plug-in's own arena so their `ctx`/`host_data` fields can carry that
/// plug-in's registry index.
pub(crate) struct HostTables {
    pub host_template: ClapHost32,
    pub input_events: InputEvents32,
    pub output_events: OutputEvents32,
    pub istream: IStream32,
    pub ostream: OStream32,

    pub audio_ports: GuestPtr<HostAudioPorts32>,
    pub gui: GuestPtr<HostGui32>,
    pub latency: GuestPtr<HostLatency32>,
    pub note_ports: GuestPtr<HostNotePorts32>,
    pub params: GuestPtr<HostParams32>,
    pub state: GuestPtr<HostState32>,
    pub tail: GuestPtr<HostTail32>,
    pub webview: GuestPtr<HostWebview32>,
}

/// Metadata for a hosted module, CBOR-encoded for the outer application.
#[derive(Debug, Serialize)]
pub struct WclapInfo {
    #[serde(rename = "clapVersion")]
    pub clap_version: (u32, u32, u32),
    pub path: String,
    pub plugins: Vec<DescriptorInfo>,
}

/// Metadata for a single plugin descriptor.
#[derive(Debug, Serialize)]
pub struct DescriptorInfo {
    pub id: String,
    pub name: String,
    pub vendor: String,
    pub description: String,
    pub features: Vec<String>,
}

/// A guest module hosted by this side. Takes ownership of the [`GuestInstance`]; `clap_entry` is
/// initialized during construction and deinitialized on drop.
pub struct HostedWclap {
    shared: Arc<WclapShared>,
    factory: GuestPtr<ClapFactory32>,
    /// Keeps the host descriptor and extension tables reserved in guest memory for the module's
    /// lifetime.
    _global_arena: Arena,
}

impl Drop for HostedWclap {
    fn drop(&mut self) {
        let remaining = self.shared.plugins.count();
        if remaining > 0 {
            log::warn!("A hosted module was removed while {remaining} plugin(s) were still alive");
        }

        let instance = &self.shared.instance;
        let entry = instance.get(instance.entry());
        instance.call(entry.deinit, ());

        super::unregister_shared(instance.index());
    }
}

impl HostedWclap {
    /// Host a guest module. Fails for 64-bit guests, for modules without a plugin entry or
    /// factory, and when `clap_entry::init()` returns false.
    pub fn new(instance: Arc<GuestInstance>) -> Result<HostedWclap> {
        if instance.is_64() {
            anyhow::bail!("64-bit guest modules are not supported");
        }

        instance
            .init()
            .context("Could not initialize the guest instance")?;

        let shared = Arc::new(WclapShared {
            instance: instance.clone(),
            plugins: Registry::new(),
            pool: parking_lot::Mutex::new(ArenaPool::new(instance.clone())),
            tables: OnceLock::new(),
        });

        let mut arena = shared.pool.lock().get_or_create();
        let factory = {
            let mut scope = arena.scoped();

            let tables = build_host_tables(&instance, &mut scope);
            let _ = shared.tables.set(tables);

            // Call clap_entry.init() with the module's resource path
            let entry = instance.get(instance.entry());
            let path_ptr = scope.write_str(&instance.path());
            if !instance.call(entry.init, (path_ptr,)) {
                anyhow::bail!("'clap_entry::init()' returned false");
            }

            let factory_id = scope.write_cstr(CLAP_PLUGIN_FACTORY_ID);
            let factory = instance
                .call(entry.get_factory, (factory_id,))
                .cast::<ClapFactory32>();
            if factory.is_null() {
                // We initialized the entry, so deinitialize it before giving up
                instance.call(entry.deinit, ());
                anyhow::bail!("The module does not support the 'clap.plugin-factory'");
            }

            scope.commit();
            factory
        };

        super::register_shared(instance.index(), shared.clone());

        Ok(HostedWclap {
            shared,
            factory,
            _global_arena: arena,
        })
    }

    /// Metadata for the module and every plugin its factory exposes.
    pub fn info(&self) -> WclapInfo {
        let instance = &self.shared.instance;
        let entry = instance.get(instance.entry());

        let mut info = WclapInfo {
            clap_version: (
                entry.clap_version.major,
                entry.clap_version.minor,
                entry.clap_version.revision,
            ),
            path: instance.path(),
            plugins: Vec::new(),
        };

        let factory = instance.get(self.factory);
        let count = instance.call(factory.get_plugin_count, (self.factory,));
        for index in 0..count {
            let descriptor = instance.call(factory.get_plugin_descriptor, (self.factory, index));
            if descriptor.is_null() {
                log::debug!("The factory returned a null descriptor for plugin index {index}");
                continue;
            }
            info.plugins.push(descriptor_info(instance, descriptor));
        }

        info
    }

    /// Create and initialize a plug-in instance by its descriptor id. Returns `None` when the
    /// factory rejects the id or the plug-in fails to initialize.
    pub fn create_plugin(&self, id: &str) -> Option<Arc<HostedPlugin>> {
        let instance = &self.shared.instance;
        let tables = self.shared.tables.get()?;

        let mut arena = self.shared.pool.lock().get_or_create();

        let mut scope = arena.scoped();

        // Each plug-in gets its own copies of the five ctx-bearing objects; the ctx fields are
        // rewritten below once the registry index is known
        let host_ptr = scope.copy_across(&tables.host_template);
        let in_events = scope.copy_across(&tables.input_events);
        let out_events = scope.copy_across(&tables.output_events);
        let istream = scope.copy_across(&tables.istream);
        let ostream = scope.copy_across(&tables.ostream);
        let id_ptr = scope.write_str(id);

        let factory = instance.get(self.factory);
        let plugin_ptr = instance.call(factory.create_plugin, (self.factory, host_ptr, id_ptr));
        if plugin_ptr.is_null() {
            log::debug!("'clap_plugin_factory::create_plugin(\"{id}\")' returned null");
            drop(scope);
            self.shared.pool.lock().reclaim(arena);
            return None;
        }
        scope.commit();

        let plugin = HostedPlugin::create(
            self.shared.clone(),
            plugin_ptr,
            host_ptr,
            in_events,
            out_events,
            istream,
            ostream,
            arena,
        );

        let key = self.shared.plugins.retain(plugin.clone());
        plugin.set_registry_key(key);

        // Point every guest-side context field at the registry entry
        instance.set(plugin.host_ptr().field(offset_of!(ClapHost32, host_data) as u32), key);
        instance.set(plugin.in_events_ptr().field(offset_of!(InputEvents32, ctx) as u32), key);
        instance.set(plugin.out_events_ptr().field(offset_of!(OutputEvents32, ctx) as u32), key);
        instance.set(plugin.istream_ptr().field(offset_of!(IStream32, ctx) as u32), key);
        instance.set(plugin.ostream_ptr().field(offset_of!(OStream32, ctx) as u32), key);

        if !plugin.init() {
            log::debug!("'clap_plugin::init()' returned false for \"{id}\"");
            plugin.destroy();
            return None;
        }

        Some(plugin)
    }
}

/// Read a plugin descriptor out of guest memory. Missing strings come back empty; the features
/// array is bounded in case the plug-in forgot its NUL terminator.
pub(crate) fn descriptor_info(
    instance: &Arc<GuestInstance>,
    ptr: GuestPtr<ClapDescriptor32>,
) -> DescriptorInfo {
    let descriptor = instance.get(ptr);
    let string = |ptr| util::guest_cstr_to_string(instance, ptr, MAX_STRING).unwrap_or_default();

    let mut features = Vec::new();
    if !descriptor.features.is_null() {
        let count = instance.count_until(descriptor.features, GuestPtr::null(), MAX_FEATURES);
        for index in 0..count {
            features.push(string(instance.get_at(descriptor.features, index)));
        }
    }

    DescriptorInfo {
        id: string(descriptor.id),
        name: string(descriptor.name),
        vendor: string(descriptor.vendor),
        description: string(descriptor.description),
        features,
    }
}

/// Build the host descriptor and every host extension table in guest memory, registering the
/// trampolines their function fields point at. The ctx-bearing objects stay host-side as
/// templates; see [`HostTables`].
fn build_host_tables(instance: &Arc<GuestInstance>, scope: &mut ArenaScope) -> HostTables {
    let host_template = ClapHost32 {
        clap_version: CLAP_VERSION_32,
        // Placeholder; per-plugin copies carry the registry index
        host_data: u32::MAX,
        name: scope.write_str("wclap-host"),
        vendor: scope.write_str("free-audio"),
        url: scope.write_str("https://github.com/free-audio/wclap-host"),
        version: scope.write_str(env!("CARGO_PKG_VERSION")),
        get_extension: instance.register_host(HostCallback::U3(callbacks::host_get_extension)),
        request_restart: instance.register_host(HostCallback::V2(callbacks::host_request_restart)),
        request_process: instance.register_host(HostCallback::V2(callbacks::host_request_process)),
        request_callback: instance
            .register_host(HostCallback::V2(callbacks::host_request_callback)),
    };

    let input_events = InputEvents32 {
        ctx: u32::MAX,
        size: instance.register_host(HostCallback::U2(callbacks::input_events_size)),
        get: instance.register_host(HostCallback::U3(callbacks::input_events_get)),
    };
    let output_events = OutputEvents32 {
        ctx: u32::MAX,
        try_push: instance.register_host(HostCallback::U3(callbacks::output_events_try_push)),
    };
    let istream = IStream32 {
        ctx: u32::MAX,
        read: instance.register_host(HostCallback::Stream(callbacks::istream_read)),
    };
    let ostream = OStream32 {
        ctx: u32::MAX,
        write: instance.register_host(HostCallback::Stream(callbacks::ostream_write)),
    };

    let audio_ports = scope.copy_across(&HostAudioPorts32 {
        is_rescan_flag_supported: instance
            .register_host(HostCallback::U3(callbacks::audio_ports_is_rescan_flag_supported)),
        rescan: instance.register_host(HostCallback::V3(callbacks::audio_ports_rescan)),
    });
    let gui = scope.copy_across(&HostGui32 {
        resize_hints_changed: instance
            .register_host(HostCallback::V2(callbacks::gui_resize_hints_changed)),
        request_resize: instance.register_host(HostCallback::U4(callbacks::gui_request_resize)),
        request_show: instance.register_host(HostCallback::U2(callbacks::gui_request_show)),
        request_hide: instance.register_host(HostCallback::U2(callbacks::gui_request_hide)),
        closed: instance.register_host(HostCallback::V3(callbacks::gui_closed)),
    });
    let latency = scope.copy_across(&HostLatency32 {
        changed: instance.register_host(HostCallback::V2(callbacks::latency_changed)),
    });
    let note_ports = scope.copy_across(&HostNotePorts32 {
        supported_dialects: instance
            .register_host(HostCallback::U2(callbacks::note_ports_supported_dialects)),
        rescan: instance.register_host(HostCallback::V3(callbacks::note_ports_rescan)),
    });
    let params = scope.copy_across(&HostParams32 {
        rescan: instance.register_host(HostCallback::V3(callbacks::params_rescan)),
        clear: instance.register_host(HostCallback::V4(callbacks::params_clear)),
        request_flush: instance.register_host(HostCallback::V2(callbacks::params_request_flush)),
    });
    let state = scope.copy_across(&HostState32 {
        mark_dirty: instance.register_host(HostCallback::V2(callbacks::state_mark_dirty)),
    });
    let tail = scope.copy_across(&HostTail32 {
        changed: instance.register_host(HostCallback::V2(callbacks::tail_changed)),
    });
    let webview = scope.copy_across(&HostWebview32 {
        send: instance.register_host(HostCallback::U4(callbacks::webview_send)),
    });

    HostTables {
        host_template,
        input_events,
        output_events,
        istream,
        ostream,
        audio_ports,
        gui,
        latency,
        note_ports,
        params,
        state,
        tail,
        webview,
    }
}
