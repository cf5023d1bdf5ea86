//! corral - KVM VM lifecycle engine for clustered experiments
//!
//! corral launches and supervises QEMU/KVM virtual machines with a
//! deterministic device topology, a demultiplexed QMP control channel,
//! and a VNC shim that routes client input events to observers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Host (VM table, id allocator, settings)         │
//! ├──────────────────────────────────────────────────┤
//! │  KvmVm supervisor (state machine, hotplug, CD)   │
//! ├───────────────┬────────────────┬─────────────────┤
//! │  arg builder  │  QMP client    │  VNC shim       │
//! ├───────────────┴────────────────┴─────────────────┤
//! │  QEMU process (UNIX sockets in instance dir)     │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use corral::{Host, HostSettings, VmConfig};
//! # use corral::bridge::Bridge;
//! # fn bridge() -> Arc<dyn Bridge> { unimplemented!() }
//!
//! let host = Host::new(HostSettings::default(), bridge());
//!
//! let mut config = VmConfig::default();
//! config.base.memory = 1024;
//! config.kvm.disks.push("/images/disk.qcow2".into());
//!
//! let vm = host.new_kvm("web", "exp1", &config).unwrap();
//! vm.launch().unwrap();
//! vm.start().unwrap();
//! println!("vnc on :{}", vm.vnc_port());
//! ```
//!
//! The human-facing CLI, HTTP front-end, mesh transport, and bridge
//! management are external collaborators; this crate exposes the
//! traits they plug into ([`bridge::Bridge`], [`bridge::CcConnector`],
//! [`vnc::VncHandler`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod error;
pub mod host;
pub mod process;
pub mod qmp;
pub mod util;
pub mod vm;
pub mod vnc;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use host::{is_network_driver, Host, HostSettings};
pub use vm::{BaseConfig, KvmConfig, KvmVm, NicConfig, QemuOverride, Vm, VmConfig, VmState};
pub use vnc::ClientMessage;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
