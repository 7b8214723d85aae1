//! Building blocks for cycle-approximate virtual platforms.
//!
//! The crate provides the transaction fabric that connects initiators
//! (CPU models) to targets (peripherals, memories): generic payloads with
//! sideband metadata, a DMI fast path with per-initiator caching, register
//! files with callbacks, banking and byte-granular access, and quantum
//! based time decoupling against a cooperative simulation kernel.
//!
//! On top of the fabric sits the debug control plane: a GDB
//! remote-serial-protocol server and a line-oriented session server, both
//! running on their own threads and interposing on the simulation through
//! the suspender registry, plus the property/broker configuration layer
//! and the module registry that session clients browse.

pub use self::dmi::{Access, DmiCache, DmiDescriptor, DmiFanout};
pub use self::host::Host;
pub use self::initiator::InitiatorSocket;
pub use self::memory::Memory;
pub use self::payload::{BusError, Command, Payload, Response};
pub use self::peripheral::{Endian, Peripheral, Register};
pub use self::property::Property;
pub use self::range::Range;
pub use self::sbi::{Sbi, SBI_DEBUG, SBI_EXCL, SBI_INSN, SBI_LOCK, SBI_NODMI, SBI_NONE, SBI_SYNC};
pub use self::session::SessionServer;
pub use self::sim::Kernel;
pub use self::suspend::Suspender;
pub use self::target::TlmTarget;

pub use self::debug::{DebugStub, GdbServer, GdbStatus};

pub mod broker;
pub mod debug;
pub mod dmi;
pub mod host;
pub mod initiator;
pub mod memory;
pub mod module;
pub mod payload;
pub mod peripheral;
pub mod property;
pub mod range;
pub mod sbi;
pub mod session;
pub mod signal;
pub mod sim;
pub mod suspend;
pub mod target;
