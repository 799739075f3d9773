use std::{sync::Arc, time::Instant};

use anyhow::{bail, Context};
use env_logger::Env;
use log::{debug, info, warn};
use motion_power_controller::{
    cec_client::CecClient,
    config::Config,
    motion::{score, FrameReader, Sampler},
    notifier::Notifier,
    power::PowerController,
};
use tokio::{signal::ctrl_c, task::JoinHandle};

/// Reads motion vectors from stdin, e.g. `raspivid -x - -o /dev/null | motion_power`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let config = Config::load().context("Error loading config")?;
    info!("Config: {config:#?}");

    let notifier = Notifier::bind(&config.remote).await?;
    let bus = CecClient::new(&config.cec_client, &config.device_name, config.verbose);
    let scheduler = config.scheduler();
    let controller = Arc::new(
        tokio::task::spawn_blocking(move || PowerController::new(scheduler, bus))
            .await?
            .context("Error setting up display power control")?,
    );

    let mut frames = FrameReader::new(tokio::io::stdin(), config.geometry());
    let mut sampler = Sampler::new(config.sampling_interval());
    // Turning on takes seconds, so it happens beside the frame loop
    let mut power_on_task: Option<JoinHandle<()>> = None;

    let result = async {
        loop {
            let frame = tokio::select! {
                frame = frames.next_frame() => frame.context("Error reading motion vectors")?,
                _ = ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            };
            let Some(frame) = frame else {
                info!("End of motion vectors");
                break;
            };
            if controller.is_failed() {
                bail!("Lost the CEC adapter");
            }
            if !sampler.should_score(Instant::now()) {
                continue;
            }
            let result = score(&frame, config.magnitude_threshold, config.total_threshold);
            debug!("Motion count: {}", result.count);
            if result.triggered {
                info!("Detected motion: {}", result.count);
                notifier.notify(result.count).await;
                if power_on_task.as_ref().map_or(true, |task| task.is_finished()) {
                    let controller = controller.clone();
                    power_on_task = Some(tokio::task::spawn_blocking(move || {
                        controller.power_on();
                    }));
                }
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Some(task) = power_on_task {
        if let Err(e) = task.await {
            warn!("Power on task failed: {e}");
        }
    }
    // Joins the scheduler thread, so not on the runtime
    tokio::task::spawn_blocking(move || drop(controller)).await?;
    result
}
