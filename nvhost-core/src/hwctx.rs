// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware contexts of time-shared units.
//!
//! A context carries prebuilt command buffers that save the unit's register
//! state to memory and restore it again. When a channel switches from one
//! context to another it gathers the outgoing context's save program and,
//! if the incoming one was saved before, its restore program.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use nvhost_common::{NvResult, PhysAddr};

use crate::mem::{MemClient, MemHandle};
use crate::timeout::TimeoutContext;

/// A command buffer gathered on a context switch.
#[derive(Debug, Clone)]
pub struct CtxProgram {
    pub handle: Arc<MemHandle>,
    pub words: u32,
    /// Sync point increments the program performs.
    pub incrs: u32,
}

#[derive(Debug)]
pub struct PinnedProgram {
    pub program: CtxProgram,
    pub phys: PhysAddr,
}

/// Runs after a save completed, e.g. to post-process the saved state.
pub type SaveService = Box<dyn Fn(&HwContext) + Send + Sync>;

pub struct HwContext {
    client: Arc<dyn MemClient>,
    timeout: Arc<TimeoutContext>,
    save: Option<PinnedProgram>,
    restore: Option<PinnedProgram>,
    /// State was saved and must be restored before the next use.
    valid: AtomicBool,
    save_service: Option<SaveService>,
    saves_completed: AtomicU32,
    restores_completed: AtomicU32,
}

impl HwContext {
    /// Pin the programs with `client` for the lifetime of the context.
    pub fn new(
        client: Arc<dyn MemClient>,
        timeout: Arc<TimeoutContext>,
        save: Option<CtxProgram>,
        restore: Option<CtxProgram>,
        save_service: Option<SaveService>,
    ) -> NvResult<Arc<Self>> {
        let save = pin_program(&*client, save)?;
        let restore = match pin_program(&*client, restore) {
            Ok(restore) => restore,
            Err(err) => {
                if let Some(save) = &save {
                    client.unpin(std::slice::from_ref(&save.program.handle));
                }
                return Err(err);
            }
        };
        Ok(Arc::new(Self {
            client,
            timeout,
            save,
            restore,
            valid: AtomicBool::new(false),
            save_service,
            saves_completed: AtomicU32::new(0),
            restores_completed: AtomicU32::new(0),
        }))
    }

    pub fn client(&self) -> &Arc<dyn MemClient> {
        &self.client
    }

    pub fn timeout(&self) -> &Arc<TimeoutContext> {
        &self.timeout
    }

    pub fn save_program(&self) -> Option<&PinnedProgram> {
        self.save.as_ref()
    }

    pub fn restore_program(&self) -> Option<&PinnedProgram> {
        self.restore.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    pub fn saves_completed(&self) -> u32 {
        self.saves_completed.load(Ordering::Acquire)
    }

    pub fn restores_completed(&self) -> u32 {
        self.restores_completed.load(Ordering::Acquire)
    }

    /// The save program of this context has executed.
    pub(crate) fn save_done(&self) {
        if self.timeout.has_timed_out() {
            log::debug!("hwctx: skip save service of timed out context");
        } else if let Some(service) = &self.save_service {
            service(self);
        }
        self.saves_completed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn restore_done(&self) {
        self.restores_completed.fetch_add(1, Ordering::AcqRel);
    }
}

fn pin_program(
    client: &dyn MemClient,
    program: Option<CtxProgram>,
) -> NvResult<Option<PinnedProgram>> {
    match program {
        Some(program) => {
            let phys = client.pin(&program.handle)?;
            Ok(Some(PinnedProgram { program, phys }))
        }
        None => Ok(None),
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        let handles: Vec<_> = self
            .save
            .iter()
            .chain(self.restore.iter())
            .map(|p| p.program.handle.clone())
            .collect();
        self.client.unpin(&handles);
    }
}

impl fmt::Debug for HwContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwContext")
            .field("valid", &self.is_valid())
            .field("save", &self.save)
            .field("restore", &self.restore)
            .field("timed_out", &self.timeout.has_timed_out())
            .finish()
    }
}
