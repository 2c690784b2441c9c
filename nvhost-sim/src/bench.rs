// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! A running simulated host: engine, register file and both worker threads.

use std::sync::Arc;
use std::time::Duration;

use nvhost_common::settings::HostConfig;
use nvhost_common::{MemError, NvResult, SyncptId};
use nvhost_core::channel::Job;
use nvhost_core::host::Host;
use nvhost_core::intr::IrqThread;
use nvhost_core::timeout::TimeoutContext;

use crate::cmdbuf::CmdBuf;
use crate::host::{DmaThread, SimHost};
use crate::memory::{SimClient, SimMemory};

/// Words of simulated memory behind a bench.
pub const MEM_WORDS: usize = 1 << 20;

pub struct SimBench {
    mem: Arc<SimMemory>,
    sim: Arc<SimHost>,
    host: Arc<Host>,
    irq: Option<IrqThread>,
    dma: Option<DmaThread>,
}

impl SimBench {
    pub fn start(config: HostConfig) -> NvResult<Self> {
        let mem = SimMemory::new(MEM_WORDS);
        let sim = SimHost::new(&config, mem.clone());
        let period = Duration::from_millis(config.irq_poll_period_ms.max(1));
        let host = Host::new(config, sim.clone(), mem.client("host"))?;
        let irq = IrqThread::spawn(host.intr().clone(), period)?;
        let dma = DmaThread::spawn(sim.clone(), period)?;
        Ok(Self {
            mem,
            sim,
            host,
            irq: Some(irq),
            dma: Some(dma),
        })
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn sim(&self) -> &Arc<SimHost> {
        &self.sim
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.mem
    }

    pub fn client(&self, name: &str) -> Arc<SimClient> {
        self.mem.client(name)
    }

    /// Stop both workers. Channels are left as they are.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if let Some(dma) = self.dma.take() {
            dma.stop();
        }
        if let Some(irq) = self.irq.take() {
            irq.stop();
        }
    }
}

impl Drop for SimBench {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

/// A job that gathers `buf` once, counting its increments of `syncpt`.
pub fn gather_job(
    client: &Arc<SimClient>,
    timeout: &Arc<TimeoutContext>,
    buf: &CmdBuf,
    syncpt: SyncptId,
) -> Result<Job, MemError> {
    let handle = client.alloc_with(buf.words())?;
    Ok(Job::new(client.clone(), timeout.clone()).gather(handle, buf.len(), buf.incrs(syncpt)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvhost_common::{Error, SLOT_BYTES};
    use nvhost_core::hw::Host1xHw;
    use nvhost_core::mem::MemHandle;
    use std::time::Instant;

    const GR3D: u32 = 1;
    const SP: SyncptId = 22;
    const WAIT: Duration = Duration::from_secs(5);

    fn incr(n: u32) -> CmdBuf {
        (0..n).fold(CmdBuf::new().setclass(0x60), |buf, _| buf.incr_syncpt(SP))
    }

    fn open_gr3d(bench: &SimBench) -> Arc<nvhost_core::Channel> {
        let ch = bench.host().channel(GR3D).unwrap().clone();
        ch.open().unwrap();
        ch
    }

    fn handle_of(job: &Job) -> Arc<MemHandle> {
        job.gathers[0].handle.clone()
    }

    #[test]
    fn test_submit_runs_to_completion() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let ch = open_gr3d(&bench);
        let client = bench.client("app");
        let ctx = TimeoutContext::new(0);

        let job = gather_job(&client, &ctx, &incr(3), SP).unwrap();
        let handle = handle_of(&job);
        let fence = ch.submit(job).unwrap();
        assert_eq!(fence, 3);
        assert_eq!(bench.host().wait_syncpt(SP, fence, Some(WAIT)).unwrap(), 3);
        ch.flush(WAIT).unwrap();
        assert_eq!(bench.memory().pin_count(&handle), 0);
        assert_eq!(ch.busy(), 0);
        ch.close();
    }

    #[test]
    fn test_timeout_isolates_hung_context() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let ch = open_gr3d(&bench);
        let client = bench.client("app");
        let ctx_a = TimeoutContext::new(100);
        let ctx_b = TimeoutContext::new(0);

        // a1 never gets past its wait on sync point 5.
        let hang = CmdBuf::new()
            .wait_syncpt(5, 1)
            .setclass(0x60)
            .incr_syncpt(SP);
        let a1 = gather_job(&client, &ctx_a, &hang, SP).unwrap();
        let b1 = gather_job(&client, &ctx_b, &incr(1), SP).unwrap();
        let a2 = gather_job(&client, &ctx_a, &incr(1).incr_syncpt(6), SP).unwrap();
        let handles = [handle_of(&a1), handle_of(&b1), handle_of(&a2)];

        assert_eq!(ch.submit(a1).unwrap(), 1);
        assert_eq!(ch.submit(b1).unwrap(), 2);
        let fence = ch.submit(a2).unwrap();
        assert_eq!(fence, 3);

        let start = Instant::now();
        assert_eq!(bench.host().wait_syncpt(SP, fence, Some(WAIT)).unwrap(), 3);
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert!(ctx_a.has_timed_out());
        assert!(!ctx_b.has_timed_out());
        ch.flush(WAIT).unwrap();

        assert_eq!(bench.sim().syncpt_value(SP), 3);
        // a2 was not executed, only its increments of the channel sync
        // point were replayed.
        assert_eq!(bench.sim().syncpt_read(6), 0);
        assert!(bench.sim().resets(GR3D) >= 1);
        for handle in &handles {
            assert_eq!(bench.memory().pin_count(handle), 0);
        }

        let again = gather_job(&client, &ctx_a, &incr(1), SP).unwrap();
        let again_handle = handle_of(&again);
        assert!(matches!(ch.submit(again), Err(Error::TimedOut)));
        assert_eq!(bench.memory().pin_count(&again_handle), 0);

        let ctx_c = TimeoutContext::new(100);
        let c1 = gather_job(&client, &ctx_c, &incr(1), SP).unwrap();
        let fence = ch.submit(c1).unwrap();
        assert_eq!(fence, 4);
        bench.host().wait_syncpt(SP, fence, Some(WAIT)).unwrap();
        assert!(!ctx_c.has_timed_out());
        ch.close();
    }

    #[test]
    fn test_small_push_buffer_blocks_until_drained() {
        let config = HostConfig {
            push_buffer_size: 8 * SLOT_BYTES,
            ..HostConfig::default()
        };
        let bench = SimBench::start(config).unwrap();
        let ch = open_gr3d(&bench);
        let client = bench.client("app");
        let ctx = TimeoutContext::new(0);

        let mut fence = 0;
        for _ in 0..40 {
            let job = gather_job(&client, &ctx, &incr(1), SP).unwrap();
            fence = ch.submit(job).unwrap();
        }
        assert_eq!(fence, 40);
        bench.host().wait_syncpt(SP, fence, Some(WAIT)).unwrap();
        ch.flush(WAIT).unwrap();
        let cdma = ch.cdma().unwrap();
        assert_eq!(cdma.push_buffer_space(), 7);
        assert!(cdma.is_idle());
        ch.close();
    }

    #[test]
    fn test_concurrent_submitters_share_channel() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let ch = open_gr3d(&bench);
        let threads: Vec<_> = (0..4)
            .map(|i| {
                let ch = ch.clone();
                let client = bench.client(&format!("app{i}"));
                std::thread::spawn(move || {
                    let ctx = TimeoutContext::new(0);
                    for _ in 0..10 {
                        let job = gather_job(&client, &ctx, &incr(2), SP).unwrap();
                        ch.submit(job).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        bench.host().wait_syncpt(SP, 80, Some(WAIT)).unwrap();
        ch.flush(WAIT).unwrap();
        assert_eq!(bench.sim().syncpt_value(SP), 80);
        assert_eq!(bench.host().syncpt().read_max(SP), 80);
        ch.close();
    }

    #[test]
    fn test_read_fifo_returns_echoed_words() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let ch = bench.host().channel(2).unwrap().clone();
        ch.open().unwrap();
        let sp = ch.desc().syncpt;
        let client = bench.client("app");
        let ctx = TimeoutContext::new(0);

        let buf = CmdBuf::new().echo(&[0xA, 0xB, 0xC]).incr_syncpt(sp);
        let fence = ch.submit(gather_job(&client, &ctx, &buf, sp).unwrap()).unwrap();
        bench.host().wait_syncpt(sp, fence, Some(WAIT)).unwrap();
        assert_eq!(ch.read_fifo(3).unwrap(), vec![0xA, 0xB, 0xC]);
        assert!(matches!(
            ch.read_fifo(1),
            Err(Error::FifoTimeout { remaining: 1 })
        ));
        ch.close();
    }

    #[test]
    fn test_suspend_resume_restores_syncpts() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let ch = open_gr3d(&bench);
        let client = bench.client("app");
        let ctx = TimeoutContext::new(0);

        let fence = ch.submit(gather_job(&client, &ctx, &incr(2), SP).unwrap()).unwrap();
        bench.host().suspend(WAIT).unwrap();
        assert_eq!(bench.host().read_syncpt(SP).unwrap(), fence);

        // Power loss.
        bench.sim().syncpt_write(SP, 0);
        bench.host().resume();
        assert_eq!(bench.sim().syncpt_value(SP), fence);

        let fence = ch.submit(gather_job(&client, &ctx, &incr(1), SP).unwrap()).unwrap();
        assert_eq!(bench.host().wait_syncpt(SP, fence, Some(WAIT)).unwrap(), 3);
        ch.close();
    }
}
