//! Miscellaneous functions for data conversions.

use crate::guest::pointer::GuestPtr;
use crate::guest::GuestInstance;

/// Early exit out of a function with the specified return value when one of the passed pointers is
/// null.
macro_rules! check_null_ptr {
    ($ret:expr, $ptr:expr $(, $ptrs:expr)* $(, )?) => {
        $crate::util::check_null_ptr_msg!("Null pointer passed to function", $ret, $ptr $(, $ptrs)*)
    };
}

/// The same as [`check_null_ptr!`], but with a custom message.
macro_rules! check_null_ptr_msg {
    ($msg:expr, $ret:expr, $ptr:expr $(, $ptrs:expr)* $(, )?) => {
        // Clippy doesn't understand it when we use a unit in our `check_null_ptr!()` maccro, even
        // if we explicitly pattern match on that unit
        #[allow(clippy::unused_unit)]
        if $ptr.is_null() $(|| $ptrs.is_null())* {
            ::log::debug!($msg);
            return $ret;
        }
    };
}

pub(crate) use check_null_ptr;
pub(crate) use check_null_ptr_msg;

/// Read a NUL-terminated C string out of guest memory, scanning at most `max` bytes for the
/// terminator. Returns `None` for a null pointer or when the bytes could not be copied across the
/// boundary. Invalid UTF-8 is replaced rather than rejected; the guest is not trusted to terminate
/// or encode its strings correctly.
pub fn guest_cstr_to_string(
    instance: &GuestInstance,
    ptr: GuestPtr<u8>,
    max: u32,
) -> Option<String> {
    if ptr.is_null() {
        return None;
    }

    let length = instance.count_until(ptr, 0u8, max);
    let mut bytes = vec![0u8; length as usize];
    if !instance.get_array(ptr, &mut bytes) {
        return None;
    }

    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Convert a fixed-size C string buffer to a `String`, reading up to the first NUL byte. Used for
/// the `name`/`module`-style fields plugins fill out in place.
pub fn fixed_cstr_to_string(buffer: &[u8]) -> String {
    let length = buffer
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(buffer.len());

    String::from_utf8_lossy(&buffer[..length]).into_owned()
}
