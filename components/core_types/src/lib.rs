//! Core value types shared by the collector's thread components.
//!
//! This crate provides the small, copyable types that every other component
//! passes around when talking about threads and their stacks.
//!
//! # Overview
//!
//! - [`Address`] - A machine address, with the [`Address::LIMIT`] sentinel
//! - [`ThreadKey`] - Platform thread identifier
//! - [`OsHandle`] - Duplicated OS handle used to control a thread
//! - [`StackBase`] - The cold (high) end of a thread stack
//!
//! # Examples
//!
//! ```
//! use core_types::{Address, StackBase};
//!
//! let base = StackBase::new(Address::new(0x8000));
//! let sp = Address::new(0x7f00);
//! assert!(sp < base.mem_base);
//! assert_eq!(base.mem_base.distance_from(sp), 0x100);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod address;
mod stack;
mod thread;

pub use address::Address;
pub use stack::{approximate_sp, with_stack_base, StackBase};
pub use thread::{OsHandle, ThreadKey};
