//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates a getter/setter pair for every listed field of a zerocopy
//! struct whose wire representation is a little-endian wrapper type. Each
//! field names its native type and its wrapper type once; both accessors
//! convert at that boundary, so record code never touches the wrapper
//! directly.
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     version_count: U32,
//!     key: U64,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         version_count: u32 as U32,
//!         key: u64 as U64,
//!     }
//! }
//!
//! // Generates:
//! // pub fn version_count(&self) -> u32 { self.version_count.get() }
//! // pub fn set_version_count(&mut self, val: u32) { ... }
//! // pub fn key(&self) -> u64 { self.key.get() }
//! // pub fn set_key(&mut self, val: u64) { ... }
//! ```

/// Generates getter and setter pairs for little-endian wire fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    ($($field:ident : $native:ty as $wire:ty),* $(,)?) => {
        ::paste::paste! {
            $(
                #[inline]
                pub fn $field(&self) -> $native {
                    self.$field.get()
                }

                #[inline]
                pub fn [<set_ $field>](&mut self, val: $native) {
                    self.$field = <$wire>::new(val);
                }
            )*
        }
    };
}
