//! Squawk: a small-footprint virtual machine for embedded devices.
//!
//! Object memory is one flat address space split into ROM, EEPROM and
//! RAM segments. RAM is managed by a copying or a mark-compact
//! collector, EEPROM by a persistent mark-sweep collector that RAM
//! objects can migrate into.

pub mod associations;
pub mod bitvector;
pub mod class;
pub mod collector;
pub mod config;
pub mod demo;
pub mod error;
pub mod frames;
pub mod header;
pub mod heap;
pub mod image;
pub mod interpreter;
pub mod layout;
pub mod markstack;
pub mod memory;
pub mod romizer;
pub mod vm;

pub use collector::Heap;
pub use config::{CollectorKind, TraceFlags, VmSettings};
pub use error::{ImageError, VmError, VmResult};
pub use vm::Vm;
