//! Access to one guest module: memory, calls, allocation and host-function
//! registration.

use anyhow::Result;
use parking_lot::Mutex;
use std::mem;
use std::sync::{Arc, OnceLock};

use crate::clap32::ClapEntry32;

pub mod arena;
pub mod pointer;
pub mod transport;

use pointer::{FromGuestRet, GuestArgs, GuestFn, GuestPtr, GuestValue, MAX_CALL_ARGS};
use transport::{HostCallback, TaggedValue, Transport};

/// One guest module, identified towards the transport layer by the index the runtime assigned
/// when loading it. All memory access, calls and registrations for that module go through here;
/// nothing in the rest of the crate ever touches the transport directly.
pub struct GuestInstance {
    index: u32,
    is64: bool,
    transport: &'static dyn Transport,
    /// The module's resource path. Written by the runtime through
    /// [`set_path_buffer()`][Self::set_path_buffer()] before `init()`.
    path: Mutex<Vec<u8>>,
    /// The guest's `clap_entry` pointer, fetched exactly once by [`init()`][Self::init()].
    entry: OnceLock<GuestPtr<ClapEntry32>>,
}

impl Drop for GuestInstance {
    fn drop(&mut self) {
        self.transport.release(self.index);
    }
}

impl GuestInstance {
    /// Wrap the guest module with the given transport-layer index. Returns `None` when no
    /// transport has been installed.
    pub fn new(index: u32, is64: bool) -> Option<Arc<GuestInstance>> {
        let transport = transport::current()?;
        Some(Arc::new(GuestInstance {
            index,
            is64,
            transport,
            path: Mutex::new(Vec::new()),
            entry: OnceLock::new(),
        }))
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_64(&self) -> bool {
        self.is64
    }

    /// Resize the path storage and hand out a pointer for the runtime to fill in. The buffer
    /// holds exactly `length` bytes of UTF-8, no NUL terminator.
    pub fn set_path_buffer(&self, length: usize) -> *mut u8 {
        let mut path = self.path.lock();
        path.clear();
        path.resize(length, 0);
        path.as_mut_ptr()
    }

    /// The module's resource path as set by the runtime.
    pub fn path(&self) -> String {
        String::from_utf8_lossy(&self.path.lock()).into_owned()
    }

    /// Ask the guest for its plugin entry pointer and record it. May only run once.
    pub fn init(&self) -> Result<()> {
        if self.entry.get().is_some() {
            anyhow::bail!("The guest instance has already been initialized");
        }

        let entry = GuestPtr::from_address(self.transport.init32(self.index));
        if entry.is_null() {
            anyhow::bail!("The guest module does not expose a plugin entry point");
        }

        let _ = self.entry.set(entry);
        Ok(())
    }

    /// The guest's entry pointer, or null before a successful [`init()`][Self::init()].
    pub fn entry(&self) -> GuestPtr<ClapEntry32> {
        self.entry.get().copied().unwrap_or_default()
    }

    /// Relay thread-specific initialization into the guest.
    pub fn init_thread(&self, thread_id: i32, start_arg: u64) {
        self.transport.init_thread(self.index, thread_id, start_arg);
    }

    /// Allocate guest memory. Returns null on failure.
    pub fn malloc(&self, size: u32) -> GuestPtr<()> {
        GuestPtr::from_address(self.transport.malloc32(self.index, size))
    }

    /// Read one `T` from guest memory. Degrades to an all-zero value when the copy fails.
    pub fn get<T: GuestValue>(&self, ptr: GuestPtr<T>) -> T {
        self.get_at(ptr, 0)
    }

    /// Read element `index` of a `T` array in guest memory.
    pub fn get_at<T: GuestValue>(&self, ptr: GuestPtr<T>, index: u32) -> T {
        let mut value = pointer::zeroed::<T>();
        let ok = {
            // SAFETY: `GuestValue` types are plain bytes, and `value` outlives the slice
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(&mut value as *mut T as *mut u8, mem::size_of::<T>())
            };
            self.transport
                .copy_from_guest(self.index, bytes, ptr.index(index).address())
        };

        if !ok {
            log::debug!(
                "Failed to read {} bytes from guest address {:#x}",
                mem::size_of::<T>(),
                ptr.index(index).address()
            );
            return pointer::zeroed();
        }
        value
    }

    /// Write one `T` into guest memory.
    pub fn set<T: GuestValue>(&self, ptr: GuestPtr<T>, value: T) -> bool {
        self.set_at(ptr, value, 0)
    }

    /// Write element `index` of a `T` array in guest memory.
    pub fn set_at<T: GuestValue>(&self, ptr: GuestPtr<T>, value: T, index: u32) -> bool {
        let ok = self.transport.copy_to_guest(
            self.index,
            ptr.index(index).address(),
            pointer::value_bytes(&value),
        );
        if !ok {
            log::debug!(
                "Failed to write {} bytes to guest address {:#x}",
                mem::size_of::<T>(),
                ptr.index(index).address()
            );
        }
        ok
    }

    /// Byte-exact memcpy out of guest memory into `out`.
    pub fn get_array<T: GuestValue>(&self, ptr: GuestPtr<T>, out: &mut [T]) -> bool {
        if out.is_empty() {
            return true;
        }
        // SAFETY: `GuestValue` slices are plain bytes
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, mem::size_of_val(out))
        };
        self.transport
            .copy_from_guest(self.index, bytes, ptr.address())
    }

    /// Byte-exact memcpy of `values` into guest memory.
    pub fn set_array<T: GuestValue>(&self, ptr: GuestPtr<T>, values: &[T]) -> bool {
        if values.is_empty() {
            return true;
        }
        // SAFETY: `GuestValue` slices are plain bytes
        let bytes = unsafe {
            std::slice::from_raw_parts(values.as_ptr() as *const u8, mem::size_of_val(values))
        };
        self.transport.copy_to_guest(self.index, ptr.address(), bytes)
    }

    /// Scan guest memory for the first element equal to `sentinel`, visiting at most `max_count`
    /// elements. Used for C-string lengths and NUL-terminated pointer arrays.
    pub fn count_until<T: GuestValue>(&self, ptr: GuestPtr<T>, sentinel: T, max_count: u32) -> u32 {
        self.transport.count_until32(
            self.index,
            ptr.address(),
            pointer::value_bytes(&sentinel),
            max_count,
        )
    }

    /// Invoke a guest function. Guest-side failures (traps, null or ill-typed function indices)
    /// degrade to a zero return value; they are never fatal on the host side.
    pub fn call<R: FromGuestRet, A: GuestArgs>(&self, function: GuestFn<R, A>, args: A) -> R {
        debug_assert!(A::COUNT <= MAX_CALL_ARGS);

        if function.is_null() {
            log::debug!("Attempted to call a null guest function");
            return R::from_tagged(TaggedValue::default());
        }

        let mut tagged = [TaggedValue::default(); MAX_CALL_ARGS];
        args.write(&mut tagged);

        match self
            .transport
            .call32(self.index, function.index(), &tagged[..A::COUNT])
        {
            Some(result) => R::from_tagged(result),
            None => {
                log::debug!("Guest function #{} failed", function.index());
                R::from_tagged(TaggedValue::default())
            }
        }
    }

    /// Register a host function with the transport layer and get back a guest-callable function
    /// index, typed with the signature the guest will use.
    pub fn register_host<R, A>(&self, callback: HostCallback) -> GuestFn<R, A> {
        GuestFn::from_index(self.transport.register_host32(self.index, callback))
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("index", &self.index)
            .field("is64", &self.is64)
            .field("entry", &self.entry())
            .finish_non_exhaustive()
    }
}
