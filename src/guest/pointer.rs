//! Typed 32-bit guest offsets and the argument marshalling around them.
//!
//! A [`GuestPtr`] is nothing but a `u32` offset into the guest's linear memory
//! with an element type attached for offset arithmetic; it cannot be
//! dereferenced. All reads and writes go through
//! [`GuestInstance`][crate::guest::GuestInstance]. [`GuestFn`] is the same
//! idea for entries in the guest's function table.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem;

use super::transport::TaggedValue;

/// The maximum number of arguments a single cross-boundary call can carry. Large enough for every
/// CLAP signature the bridge uses; calls are marshalled through a fixed-size stack buffer so the
/// audio thread never allocates.
pub const MAX_CALL_ARGS: usize = 8;

/// A typed offset into guest memory. Offset `0` denotes null.
#[repr(transparent)]
pub struct GuestPtr<T> {
    address: u32,
    _marker: PhantomData<fn() -> T>,
}

/// A typed index into the guest's function table. Index `0` denotes null. The phantom signature
/// drives argument and return-value tagging in
/// [`GuestInstance::call()`][crate::guest::GuestInstance::call()].
#[repr(transparent)]
pub struct GuestFn<R, A> {
    index: u32,
    _marker: PhantomData<fn(A) -> R>,
}

impl<T> GuestPtr<T> {
    pub const fn null() -> Self {
        Self::from_address(0)
    }

    pub const fn from_address(address: u32) -> Self {
        GuestPtr {
            address,
            _marker: PhantomData,
        }
    }

    pub fn address(self) -> u32 {
        self.address
    }

    pub fn is_null(self) -> bool {
        self.address == 0
    }

    /// Reinterpret the pointee type. Bit-preserving; the guest offset is unchanged.
    pub fn cast<U>(self) -> GuestPtr<U> {
        GuestPtr::from_address(self.address)
    }

    /// The address of element `index` in a contiguous array of `T`. Guest and host element sizes
    /// match because the `clap32` layouts spell out their pointers as 4-byte fields.
    pub fn index(self, index: u32) -> Self {
        Self::from_address(
            self.address
                .wrapping_add(index.wrapping_mul(mem::size_of::<T>() as u32)),
        )
    }

    /// Project to a field at `offset` bytes into `T`. Pair this with `mem::offset_of!` so the
    /// offsets stay tied to the layout structs.
    pub fn field<F>(self, offset: u32) -> GuestPtr<F> {
        GuestPtr::from_address(self.address.wrapping_add(offset))
    }
}

impl<R, A> GuestFn<R, A> {
    pub const fn null() -> Self {
        Self::from_index(0)
    }

    pub const fn from_index(index: u32) -> Self {
        GuestFn {
            index,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn is_null(self) -> bool {
        self.index == 0
    }
}

// The derives would put bounds on `T`, so these are spelled out by hand.

impl<T> Clone for GuestPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GuestPtr<T> {}
impl<T> PartialEq for GuestPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}
impl<T> Eq for GuestPtr<T> {}
impl<T> Hash for GuestPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}
impl<T> Default for GuestPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}
impl<T> fmt::Debug for GuestPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GuestPtr({:#010x})", self.address)
    }
}

impl<R, A> Clone for GuestFn<R, A> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<R, A> Copy for GuestFn<R, A> {}
impl<R, A> PartialEq for GuestFn<R, A> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<R, A> Eq for GuestFn<R, A> {}
impl<R, A> Default for GuestFn<R, A> {
    fn default() -> Self {
        Self::null()
    }
}
impl<R, A> fmt::Debug for GuestFn<R, A> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GuestFn(#{})", self.index)
    }
}

/// Marker for plain-old-data types that can be memcpy'd across the address-space boundary.
///
/// # Safety
///
/// Implementors must be `repr(C)` (or primitives) with every byte meaningful: no niches, no
/// padding that isn't spelled out as an explicit field, and a layout that matches the 32-bit guest
/// ABI byte for byte. Any bit pattern must be a valid value.
pub unsafe trait GuestValue: Copy + 'static {}

unsafe impl GuestValue for u8 {}
unsafe impl GuestValue for i8 {}
unsafe impl GuestValue for u16 {}
unsafe impl GuestValue for i16 {}
unsafe impl GuestValue for u32 {}
unsafe impl GuestValue for i32 {}
unsafe impl GuestValue for u64 {}
unsafe impl GuestValue for i64 {}
unsafe impl GuestValue for f32 {}
unsafe impl GuestValue for f64 {}
unsafe impl<T: 'static> GuestValue for GuestPtr<T> {}
unsafe impl<R: 'static, A: 'static> GuestValue for GuestFn<R, A> {}
unsafe impl<T: GuestValue, const N: usize> GuestValue for [T; N] {}

/// An all-zero value; for `GuestValue` types this is always valid, and it's what boundary-copy
/// failures degrade to.
pub fn zeroed<T: GuestValue>() -> T {
    // SAFETY: `GuestValue` guarantees every bit pattern is valid
    unsafe { mem::zeroed() }
}

/// View a `GuestValue` as its raw bytes, ready to be copied into guest memory.
pub fn value_bytes<T: GuestValue>(value: &T) -> &[u8] {
    // SAFETY: `GuestValue` types have no uninitialized padding bytes
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

/// Scalar types that can be passed to a guest function.
pub trait ToGuestArg {
    fn to_tagged(self) -> TaggedValue;
}

/// Scalar types that can be produced from a guest function's tagged return value.
pub trait FromGuestRet {
    fn from_tagged(value: TaggedValue) -> Self;
}

macro_rules! tagged_scalar {
    ($($ty:ty => $ctor:ident / $get:ident),+ $(,)?) => {
        $(
            impl ToGuestArg for $ty {
                fn to_tagged(self) -> TaggedValue {
                    TaggedValue::$ctor(self as _)
                }
            }
            impl FromGuestRet for $ty {
                fn from_tagged(value: TaggedValue) -> Self {
                    value.$get() as _
                }
            }
        )+
    };
}

tagged_scalar! {
    u8 => from_i32 / as_u32,
    i8 => from_i32 / as_i32,
    u16 => from_i32 / as_u32,
    i16 => from_i32 / as_i32,
    u32 => from_i32 / as_u32,
    i32 => from_i32 / as_i32,
    u64 => from_i64 / as_u64,
    i64 => from_i64 / as_i64,
    f32 => from_f32 / as_f32,
    f64 => from_f64 / as_f64,
}

impl ToGuestArg for bool {
    fn to_tagged(self) -> TaggedValue {
        TaggedValue::from_i32(self as u32)
    }
}
impl FromGuestRet for bool {
    fn from_tagged(value: TaggedValue) -> Self {
        value.as_u32() != 0
    }
}

impl<T> ToGuestArg for GuestPtr<T> {
    fn to_tagged(self) -> TaggedValue {
        TaggedValue::from_i32(self.address())
    }
}
impl<T> FromGuestRet for GuestPtr<T> {
    fn from_tagged(value: TaggedValue) -> Self {
        GuestPtr::from_address(value.as_u32())
    }
}

impl<R, A> ToGuestArg for GuestFn<R, A> {
    fn to_tagged(self) -> TaggedValue {
        TaggedValue::from_i32(self.index())
    }
}

impl FromGuestRet for () {
    fn from_tagged(_value: TaggedValue) -> Self {}
}

/// Argument tuples for cross-boundary calls. Implemented for tuples up to [`MAX_CALL_ARGS`]
/// elements.
pub trait GuestArgs {
    const COUNT: usize;

    /// Write the tagged arguments into `out`, which is at least `Self::COUNT` long.
    fn write(self, out: &mut [TaggedValue]);
}

macro_rules! guest_args_tuple {
    ($count:literal; $($name:ident : $idx:tt),*) => {
        impl<$($name: ToGuestArg),*> GuestArgs for ($($name,)*) {
            const COUNT: usize = $count;

            #[allow(unused_variables)]
            fn write(self, out: &mut [TaggedValue]) {
                $(out[$idx] = self.$idx.to_tagged();)*
            }
        }
    };
}

guest_args_tuple!(0;);
guest_args_tuple!(1; A0: 0);
guest_args_tuple!(2; A0: 0, A1: 1);
guest_args_tuple!(3; A0: 0, A1: 1, A2: 2);
guest_args_tuple!(4; A0: 0, A1: 1, A2: 2, A3: 3);
guest_args_tuple!(5; A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
guest_args_tuple!(6; A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);
guest_args_tuple!(7; A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6);
guest_args_tuple!(8; A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6, A7: 7);
