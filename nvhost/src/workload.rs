// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Multi-context submission workload.
//!
//! Each context runs on its own thread and submits batches of sync point
//! increments to one channel. With `hang` set, the first batch of context 0
//! waits on a sync point nothing ever increments, so the channel watchdog
//! has to tear it down while the other contexts keep running.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nvhost_common::{Error, SyncptId};
use nvhost_core::hwctx::{CtxProgram, HwContext};
use nvhost_core::mem::MemClient;
use nvhost_core::timeout::TimeoutContext;
use nvhost_core::Channel;
use nvhost_sim::{gather_job, CmdBuf, SimBench, SimClient};

#[derive(Debug, Clone)]
pub struct Workload {
    pub channel: String,
    pub contexts: u32,
    pub batches: u32,
    pub incrs: u32,
    pub hang: bool,
    pub hwctx: bool,
    pub submit_timeout_ms: u32,
    pub wait_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ContextReport {
    pub submitted: u32,
    /// Batches not submitted because the context had timed out.
    pub rejected: u32,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub channel: String,
    pub syncpt: SyncptId,
    pub contexts: Vec<ContextReport>,
    pub fence: u32,
    pub value: u32,
    pub module_resets: u32,
    pub elapsed: Duration,
}

impl Report {
    pub fn log(&self) {
        info!(
            "Channel {} (sync point {}): fence {} value {}, {} module resets, {:.1} ms",
            self.channel,
            self.syncpt,
            self.fence,
            self.value,
            self.module_resets,
            self.elapsed.as_secs_f64() * 1000.0
        );
        for (i, ctx) in self.contexts.iter().enumerate() {
            info!(
                "  context {}: {} submitted, {} rejected{}",
                i,
                ctx.submitted,
                ctx.rejected,
                if ctx.timed_out { ", timed out" } else { "" }
            );
        }
    }
}

pub fn run(bench: &SimBench, load: &Workload) -> Result<Report> {
    let host = bench.host();
    let channel = host
        .channel_by_name(&load.channel)
        .with_context(|| format!("No channel named {}", load.channel))?
        .clone();
    let sp = channel.desc().syncpt;
    let class_id = channel.desc().class_id;
    let hang_syncpt = if load.hang {
        Some(idle_syncpt(bench).context("No spare sync point to hang on")?)
    } else {
        None
    };

    channel.open().context("Failed to open channel")?;
    info!(
        "Running {} contexts x {} batches on {}",
        load.contexts, load.batches, load.channel
    );

    let start = Instant::now();
    let workers: Vec<_> = (0..load.contexts)
        .map(|i| {
            let channel = channel.clone();
            let client = bench.client(&format!("ctx{i}"));
            let load = load.clone();
            let hang = hang_syncpt.filter(|_| i == 0);
            thread::Builder::new()
                .name(format!("ctx{i}"))
                .spawn(move || submit_batches(&channel, &client, &load, class_id, hang))
                .context("Failed to spawn submitter")
        })
        .collect::<Result<_>>()?;

    let mut submitted = Vec::with_capacity(workers.len());
    for worker in workers {
        match worker.join() {
            Ok(result) => submitted.push(result?),
            Err(_) => bail!("Submitter thread panicked"),
        }
    }

    let fence = host.syncpt().read_max(sp);
    host.wait_syncpt(sp, fence, Some(load.wait_timeout))
        .with_context(|| format!("Sync point {} never reached {}", sp, fence))?;
    channel
        .flush(load.wait_timeout)
        .context("Channel did not drain")?;
    let elapsed = start.elapsed();

    let contexts = submitted
        .into_iter()
        .map(|(report, timeout)| ContextReport {
            timed_out: timeout.has_timed_out(),
            ..report
        })
        .collect();
    let report = Report {
        channel: load.channel.clone(),
        syncpt: sp,
        contexts,
        fence,
        value: host.read_syncpt(sp)?,
        module_resets: bench.sim().resets(channel.id()),
        elapsed,
    };
    channel.close();
    Ok(report)
}

fn submit_batches(
    channel: &Arc<Channel>,
    client: &Arc<SimClient>,
    load: &Workload,
    class_id: u32,
    hang: Option<SyncptId>,
) -> Result<(ContextReport, Arc<TimeoutContext>)> {
    let sp = channel.desc().syncpt;
    let timeout = TimeoutContext::new(load.submit_timeout_ms);
    let hwctx = if load.hwctx {
        Some(context(client, &timeout, class_id, sp)?)
    } else {
        None
    };
    let mut report = ContextReport::default();

    for batch in 0..load.batches {
        let mut buf = CmdBuf::new();
        if let (Some(id), 0) = (hang, batch) {
            warn!("Injecting a hung batch waiting on sync point {}", id);
            buf = buf.wait_syncpt(id, 1);
        }
        let buf = (0..load.incrs).fold(buf.setclass(class_id), |buf, _| buf.incr_syncpt(sp));
        let mut job = gather_job(client, &timeout, &buf, sp)?;
        if let Some(ctx) = &hwctx {
            job = job.with_hwctx(ctx.clone());
        }
        match channel.submit(job) {
            Ok(fence) => {
                debug!("{}: batch {} fence {}", client.name(), batch, fence);
                report.submitted += 1;
            }
            Err(Error::TimedOut) => {
                report.rejected += load.batches - batch;
                break;
            }
            Err(e) => return Err(e).context("Submission failed"),
        }
    }
    Ok((report, timeout))
}

/// A context whose save and restore programs each increment the channel
/// sync point once.
fn context(
    client: &Arc<SimClient>,
    timeout: &Arc<TimeoutContext>,
    class_id: u32,
    sp: SyncptId,
) -> Result<Arc<HwContext>> {
    let program = |buf: CmdBuf| -> Result<CtxProgram> {
        let handle = client.alloc_with(buf.words())?;
        Ok(CtxProgram {
            handle,
            words: buf.len(),
            incrs: buf.incrs(sp),
        })
    };
    let save = program(CmdBuf::new().setclass(class_id).incr_syncpt(sp))?;
    let restore = program(CmdBuf::new().setclass(class_id).incr_syncpt(sp))?;
    let ctx = HwContext::new(client.clone(), timeout.clone(), Some(save), Some(restore), None)
        .context("Failed to create hardware context")?;
    Ok(ctx)
}

/// A host-managed sync point no channel uses.
fn idle_syncpt(bench: &SimBench) -> Option<SyncptId> {
    let config = bench.host().config();
    (0..config.num_syncpts).find(|&id| {
        !config.is_client_managed(id) && config.channels.iter().all(|ch| ch.syncpt != id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvhost_common::settings::HostConfig;

    fn workload() -> Workload {
        Workload {
            channel: "gr3d".into(),
            contexts: 3,
            batches: 4,
            incrs: 2,
            hang: false,
            hwctx: false,
            submit_timeout_ms: 100,
            wait_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_all_batches_complete() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let report = run(&bench, &workload()).unwrap();
        assert_eq!(report.fence, 24);
        assert_eq!(report.value, 24);
        assert_eq!(report.module_resets, 0);
        assert!(report.contexts.iter().all(|c| c.submitted == 4 && !c.timed_out));
    }

    #[test]
    fn test_hung_context_is_isolated() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let load = Workload {
            contexts: 2,
            batches: 1,
            hang: true,
            ..workload()
        };
        let report = run(&bench, &load).unwrap();
        assert!(report.contexts[0].timed_out);
        assert!(!report.contexts[1].timed_out);
        assert_eq!(report.value, report.fence);
        assert!(report.module_resets >= 1);
    }

    #[test]
    fn test_context_switches_add_increments() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let load = Workload {
            contexts: 2,
            batches: 3,
            hwctx: true,
            ..workload()
        };
        let report = run(&bench, &load).unwrap();
        // Each batch increments twice; switches add save and restore
        // increments on top.
        assert!(report.fence >= 12);
        assert_eq!(report.value, report.fence);
    }

    #[test]
    fn test_unknown_channel() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let load = Workload {
            channel: "vic".into(),
            ..workload()
        };
        assert!(run(&bench, &load).is_err());
    }

    #[test]
    fn test_idle_syncpt_skips_channel_and_client_ids() {
        let bench = SimBench::start(HostConfig::default()).unwrap();
        let id = idle_syncpt(&bench).unwrap();
        let config = bench.host().config();
        assert!(!config.is_client_managed(id));
        assert!(config.channels.iter().all(|ch| ch.syncpt != id));
    }
}
