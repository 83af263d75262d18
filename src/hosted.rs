//! The hosted side of the bridge: one guest module plus the plug-ins created
//! from it.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::guest::arena::ArenaPool;
use crate::guest::GuestInstance;
use crate::registry::Registry;

pub mod callbacks;
pub mod plugin;
pub mod wclap;

pub use plugin::HostedPlugin;
pub use wclap::HostedWclap;

/// State a trampoline must be able to reach from nothing but the guest-instance index the
/// transport hands it: the instance (to read the `ctx` field out of guest memory), the plugin
/// registry (to resolve that index), and the host tables (to answer `get_extension`).
pub(crate) struct WclapShared {
    pub instance: Arc<GuestInstance>,
    pub plugins: Registry<Arc<HostedPlugin>>,
    pub pool: Mutex<ArenaPool>,
    /// Set once module setup has built the guest-side tables; trampolines registered during setup
    /// can fire before this is filled and must tolerate `None`.
    pub tables: OnceLock<wclap::HostTables>,
}

static WCLAPS: RwLock<BTreeMap<u32, Arc<WclapShared>>> = RwLock::new(BTreeMap::new());

pub(crate) fn register_shared(guest: u32, shared: Arc<WclapShared>) {
    if WCLAPS.write().insert(guest, shared).is_some() {
        log::warn!("Guest instance {guest} was hosted twice");
    }
}

pub(crate) fn unregister_shared(guest: u32) {
    WCLAPS.write().remove(&guest);
}

/// Resolve the hosted module a trampoline call came from.
pub(crate) fn shared_for(guest: u32) -> Option<Arc<WclapShared>> {
    WCLAPS.read().get(&guest).cloned()
}
