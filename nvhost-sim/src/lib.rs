// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software host1x for driving `nvhost-core` without hardware.

pub mod bench;
pub mod cmdbuf;
pub mod fetch;
pub mod host;
pub mod memory;

pub use bench::{gather_job, SimBench};
pub use cmdbuf::CmdBuf;
pub use host::{DmaThread, SimHost};
pub use memory::{SimClient, SimMemory};
