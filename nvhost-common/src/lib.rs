// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod error;
pub mod settings;
pub mod types;

pub use error::{Error, HwError, MemError, NvResult};
pub use types::*;
