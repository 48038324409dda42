//! Pump a synthetic pipeline and report what happened.

use std::sync::Arc;
use std::time::Instant;

use framepump_common::config::EngineConfig;
use framepump_engine::{
    ClockSource, Deadline, FrameTap, MediaTarget, Program, SourceHandle, StageHandle, TargetStats,
    TaskPool,
};
use serde::Serialize;

#[derive(Serialize)]
struct RunReport {
    #[serde(flatten)]
    target: TargetStats,
    frames_seen: u64,
    wall_secs: f64,
}

pub async fn run(
    config: EngineConfig,
    frames: u64,
    fps: f64,
    offline: bool,
    plays: u64,
) -> anyhow::Result<()> {
    let source = if frames == 0 {
        ClockSource::infinite(fps)?
    } else {
        ClockSource::new(fps, frames)?.with_plays(plays)
    };

    let pool = Arc::new(TaskPool::from_config(&config.pool, "framepump-pool")?);
    let tap = Arc::new(FrameTap::counting());
    let program = Arc::new(Program::with_pool(
        SourceHandle::new(source),
        vec![StageHandle::from_arc(tap.clone())],
        pool,
    ));

    let target = MediaTarget::builder("cli")
        .config(config.pump.clone())
        .real_time(!offline)
        .on_failure(|e| eprintln!("Rendering failed: {e}"))
        .build();
    target.use_program(program.clone())?;

    tracing::info!(frames, fps, plays, offline, "Starting pipeline");
    if frames == 0 {
        eprintln!("Press Ctrl+C to stop...");
    }

    let started = Instant::now();
    target.start()?;

    let waiter = {
        let target = target.clone();
        tokio::task::spawn_blocking(move || target.sleep_until(Deadline::NotRendering))
    };
    tokio::select! {
        joined = waiter => joined?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Interrupted, stopping pump");
            target.stop();
        }
    }

    {
        let target = target.clone();
        let program = program.clone();
        tokio::task::spawn_blocking(move || {
            target.join_pump();
            program.quiesce();
        })
        .await?;
    }

    let report = RunReport {
        target: target.stats(),
        frames_seen: tap.seen(),
        wall_secs: started.elapsed().as_secs_f64(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(failure) = target.last_failure() {
        anyhow::bail!("Pipeline failed: {failure}");
    }
    Ok(())
}
