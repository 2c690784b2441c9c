// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod cdma;
pub mod channel;
pub mod host;
pub mod hw;
pub mod hwctx;
pub mod intr;
pub mod mem;
pub mod opcodes;
pub mod push_buffer;
pub mod semaphore;
pub mod sync_queue;
pub mod syncpt;
pub mod timeout;

#[cfg(test)]
mod fake;

pub use cdma::{Cdma, CdmaRunState, CdmaSubmit};
pub use channel::{Channel, Gather, Job};
pub use host::Host;
pub use hw::{DmaCtrl, Host1xHw};
pub use hwctx::{CtxProgram, HwContext};
pub use intr::{Action, IrqThread, WaitEvent, Waiter};
pub use mem::{MemClient, MemHandle};
pub use syncpt::SyncptTable;
pub use timeout::TimeoutContext;
