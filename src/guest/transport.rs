//! The seam between the bridge and whatever actually owns the guest modules.
//!
//! On a WebAssembly build the transport is the `_wclapInstance` import module
//! provided by the outer runtime; the integration tests install a mock that
//! simulates guest memory and a function table in-process. Either way, every
//! operation is keyed by the guest-instance index that the runtime assigned
//! when it loaded the module.

use std::sync::OnceLock;

/// A scalar crossing the call boundary, tagged with its WebAssembly value type.
///
/// Matches the C layout the runtime expects: one tag byte, then an 8-byte payload slot.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TaggedValue {
    tag: ValueTag,
    bits: u64,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueTag {
    I32 = 0,
    I64 = 1,
    F32 = 2,
    F64 = 3,
}

impl Default for TaggedValue {
    fn default() -> Self {
        Self::from_i32(0)
    }
}

impl TaggedValue {
    pub fn from_i32(bits: u32) -> Self {
        TaggedValue {
            tag: ValueTag::I32,
            bits: bits as u64,
        }
    }

    pub fn from_i64(bits: u64) -> Self {
        TaggedValue {
            tag: ValueTag::I64,
            bits,
        }
    }

    pub fn from_f32(value: f32) -> Self {
        TaggedValue {
            tag: ValueTag::F32,
            bits: value.to_bits() as u64,
        }
    }

    pub fn from_f64(value: f64) -> Self {
        TaggedValue {
            tag: ValueTag::F64,
            bits: value.to_bits(),
        }
    }

    pub fn tag(self) -> ValueTag {
        self.tag
    }

    // The accessors convert numerically when the stored tag doesn't match the requested type,
    // mirroring what an untyped call boundary does anyway.

    pub fn as_u32(self) -> u32 {
        match self.tag {
            ValueTag::I32 | ValueTag::I64 => self.bits as u32,
            ValueTag::F32 => f32::from_bits(self.bits as u32) as u32,
            ValueTag::F64 => f64::from_bits(self.bits) as u32,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self.tag {
            ValueTag::I32 | ValueTag::I64 => self.bits as i32,
            ValueTag::F32 => f32::from_bits(self.bits as u32) as i32,
            ValueTag::F64 => f64::from_bits(self.bits) as i32,
        }
    }

    pub fn as_u64(self) -> u64 {
        match self.tag {
            ValueTag::I32 => self.bits as u32 as u64,
            ValueTag::I64 => self.bits,
            ValueTag::F32 => f32::from_bits(self.bits as u32) as u64,
            ValueTag::F64 => f64::from_bits(self.bits) as u64,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self.tag {
            ValueTag::I32 => self.bits as u32 as i32 as i64,
            ValueTag::I64 => self.bits as i64,
            ValueTag::F32 => f32::from_bits(self.bits as u32) as i64,
            ValueTag::F64 => f64::from_bits(self.bits) as i64,
        }
    }

    pub fn as_f32(self) -> f32 {
        match self.tag {
            ValueTag::I32 => self.bits as u32 as f32,
            ValueTag::I64 => self.bits as f32,
            ValueTag::F32 => f32::from_bits(self.bits as u32),
            ValueTag::F64 => f64::from_bits(self.bits) as f32,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self.tag {
            ValueTag::I32 => self.bits as u32 as f64,
            ValueTag::I64 => self.bits as f64,
            ValueTag::F32 => f32::from_bits(self.bits as u32) as f64,
            ValueTag::F64 => f64::from_bits(self.bits),
        }
    }
}

/// A host-side native function handed to [`Transport::register_host32()`]. The variants cover the
/// signature shapes of every trampoline the bridge registers; the first `u32` parameter is always
/// the guest-instance index, which the transport prepends when the guest invokes the function.
#[derive(Clone, Copy, Debug)]
pub enum HostCallback {
    /// `fn(guest, a)`
    V2(extern "C" fn(u32, u32)),
    /// `fn(guest, a, b)`
    V3(extern "C" fn(u32, u32, u32)),
    /// `fn(guest, a, b, c)`
    V4(extern "C" fn(u32, u32, u32, u32)),
    /// `fn(guest, a) -> r`
    U2(extern "C" fn(u32, u32) -> u32),
    /// `fn(guest, a, b) -> r`
    U3(extern "C" fn(u32, u32, u32) -> u32),
    /// `fn(guest, a, b, c) -> r`
    U4(extern "C" fn(u32, u32, u32, u32) -> u32),
    /// `fn(guest, object, buffer, size) -> count`, the `clap_istream`/`clap_ostream` shape
    Stream(extern "C" fn(u32, u32, u32, u64) -> i64),
}

impl HostCallback {
    /// The raw code address, which on a WebAssembly build is the function's index in the host
    /// module's own table.
    pub fn raw(self) -> usize {
        match self {
            HostCallback::V2(f) => f as usize,
            HostCallback::V3(f) => f as usize,
            HostCallback::V4(f) => f as usize,
            HostCallback::U2(f) => f as usize,
            HostCallback::U3(f) => f as usize,
            HostCallback::U4(f) => f as usize,
            HostCallback::Stream(f) => f as usize,
        }
    }
}

/// Operations the guest runtime must provide. All of them are total: a failure inside the runtime
/// surfaces as `false`/zero, never as an unwind across the boundary.
pub trait Transport: Send + Sync {
    /// Relay thread-specific initialization into the guest (`wasi_thread_start`).
    fn init_thread(&self, guest: u32, thread_id: i32, start_arg: u64);

    /// Drop the runtime's side of the guest instance.
    fn release(&self, guest: u32);

    /// Ask the guest for its plugin entry pointer. Returns 0 when the module exports none.
    fn init32(&self, guest: u32) -> u32;

    /// `malloc` inside the guest. Returns 0 on allocation failure.
    fn malloc32(&self, guest: u32, size: u32) -> u32;

    /// Copy `source` into guest memory at `dest`.
    fn copy_to_guest(&self, guest: u32, dest: u32, source: &[u8]) -> bool;

    /// Copy guest memory at `source` into `dest`.
    fn copy_from_guest(&self, guest: u32, dest: &mut [u8], source: u32) -> bool;

    /// Scan guest memory from `start` for the first element equal to `sentinel` (an element is
    /// `sentinel.len()` bytes), visiting at most `max_count` elements. Returns the number of
    /// elements before the sentinel, or `max_count` when it never occurs.
    fn count_until32(&self, guest: u32, start: u32, sentinel: &[u8], max_count: u32) -> u32;

    /// Invoke a guest function by table index. Returns `None` when the call trapped or the index
    /// was invalid.
    fn call32(&self, guest: u32, function: u32, args: &[TaggedValue]) -> Option<TaggedValue>;

    /// Register a host function and return a guest-callable table index for it.
    fn register_host32(&self, guest: u32, callback: HostCallback) -> u32;
}

static TRANSPORT: OnceLock<&'static dyn Transport> = OnceLock::new();

/// Install the process-wide transport. Returns `false` if one was already installed. The
/// WebAssembly build installs its import-module transport automatically; this exists for the
/// native build, where the embedding (or the test harness) provides the runtime.
pub fn install(transport: &'static dyn Transport) -> bool {
    TRANSPORT.set(transport).is_ok()
}

/// The installed transport, if any.
pub fn current() -> Option<&'static dyn Transport> {
    #[cfg(target_family = "wasm")]
    {
        Some(*TRANSPORT.get_or_init(|| &js::JsTransport))
    }
    #[cfg(not(target_family = "wasm"))]
    {
        TRANSPORT.get().copied()
    }
}

/// The `_wclapInstance` import module provided by the JS-side runtime.
#[cfg(target_family = "wasm")]
mod js {
    use super::{HostCallback, TaggedValue, Transport};

    #[link(wasm_import_module = "_wclapInstance")]
    extern "C" {
        #[link_name = "initThread"]
        fn raw_init_thread(guest: u32, thread_id: i32, start_arg: u64);
        #[link_name = "release"]
        fn raw_release(guest: u32);
        #[link_name = "init32"]
        fn raw_init32(guest: u32) -> u32;
        #[link_name = "malloc32"]
        fn raw_malloc32(guest: u32, size: u32) -> u32;
        #[link_name = "memcpyToOther32"]
        fn raw_memcpy_to_other32(guest: u32, dest: u32, source: *const u8, count: u32) -> bool;
        #[link_name = "memcpyFromOther32"]
        fn raw_memcpy_from_other32(guest: u32, dest: *mut u8, source: u32, count: u32) -> bool;
        #[link_name = "countUntil32"]
        fn raw_count_until32(
            guest: u32,
            start: u32,
            sentinel: *const u8,
            item_size: u32,
            max_count: u32,
        ) -> u32;
        #[link_name = "call32"]
        fn raw_call32(
            guest: u32,
            function: u32,
            result: *mut TaggedValue,
            args: *const TaggedValue,
            count: u32,
        ) -> bool;
        #[link_name = "registerHost32"]
        fn raw_register_host32(guest: u32, function: u32) -> u32;
    }

    pub struct JsTransport;

    impl Transport for JsTransport {
        fn init_thread(&self, guest: u32, thread_id: i32, start_arg: u64) {
            unsafe { raw_init_thread(guest, thread_id, start_arg) }
        }

        fn release(&self, guest: u32) {
            unsafe { raw_release(guest) }
        }

        fn init32(&self, guest: u32) -> u32 {
            unsafe { raw_init32(guest) }
        }

        fn malloc32(&self, guest: u32, size: u32) -> u32 {
            unsafe { raw_malloc32(guest, size) }
        }

        fn copy_to_guest(&self, guest: u32, dest: u32, source: &[u8]) -> bool {
            unsafe { raw_memcpy_to_other32(guest, dest, source.as_ptr(), source.len() as u32) }
        }

        fn copy_from_guest(&self, guest: u32, dest: &mut [u8], source: u32) -> bool {
            unsafe { raw_memcpy_from_other32(guest, dest.as_mut_ptr(), source, dest.len() as u32) }
        }

        fn count_until32(&self, guest: u32, start: u32, sentinel: &[u8], max_count: u32) -> u32 {
            unsafe {
                raw_count_until32(
                    guest,
                    start,
                    sentinel.as_ptr(),
                    sentinel.len() as u32,
                    max_count,
                )
            }
        }

        fn call32(&self, guest: u32, function: u32, args: &[TaggedValue]) -> Option<TaggedValue> {
            let mut result = TaggedValue::default();
            let ok = unsafe {
                raw_call32(
                    guest,
                    function,
                    &mut result,
                    args.as_ptr(),
                    args.len() as u32,
                )
            };
            ok.then_some(result)
        }

        fn register_host32(&self, guest: u32, callback: HostCallback) -> u32 {
            unsafe { raw_register_host32(guest, callback.raw() as u32) }
        }
    }
}
