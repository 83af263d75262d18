//! Host bridge for CLAP plug-ins that live inside a sandboxed, WebAssembly-style
//! guest module.
//!
//! The guest runs in a separate address space: the host can only read and write
//! bytes at guest offsets, invoke guest functions by table index, and register
//! native functions the guest can call back. Everything a CLAP plug-in expects
//! from its host (the `clap_host` struct, extension vtables, event lists and
//! state streams) is materialized *inside guest memory* by this crate, with
//! the function-pointer fields holding registered trampoline indices.
//!
//! The outer application talks to the bridge through the C ABI in [`ffi`],
//! exchanging structured values as CBOR.

pub mod bytes;
pub mod clap32;
pub mod ffi;
pub mod guest;
pub mod hosted;
pub mod registry;

mod util;

pub use guest::GuestInstance;
pub use hosted::{HostedPlugin, HostedWclap};
