//! In-process IPC primitives with edge-triggered signal notifications.
//!
//! Tether hands out three kinds of endpoints from an explicit [`Runtime`]:
//! message pipes, byte-stream data pipes and shared buffers. Every endpoint
//! exposes a [`SignalState`], and a [`Trap`] turns changes in those states
//! into callbacks that fire exactly once per arm and never run concurrently.
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use tether::{Runtime, RuntimeOptions, Signals, TriggerCondition};
//!
//! let runtime = Runtime::new(RuntimeOptions::default());
//! let (a, b) = runtime.create_message_pipe();
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let trap = runtime.create_trap({
//!     let seen = seen.clone();
//!     move |event| seen.lock().unwrap().push(event.context)
//! });
//! trap.add_trigger(&b, Signals::READABLE, TriggerCondition::Satisfied, 7).unwrap();
//! trap.arm(4).unwrap();
//!
//! a.write("hello").unwrap();
//! assert_eq!(*seen.lock().unwrap(), vec![7]);
//! assert_eq!(b.read().unwrap().payload, b"hello");
//! ```
//!
//! # Cargo features
//!
//! | Feature | Effect |
//! |---------|--------|
//! | `wire` *(default)* | Re-exports `tether-wire` as [`wire`], the frame codec for carrying pipes between processes. |

pub use tether_core::*;
pub use tether_types::*;

#[cfg(feature = "wire")]
pub use tether_wire as wire;
