// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use calloop::{
    EventLoop,
    timer::{TimeoutAction, Timer},
};
use tracing::{error, info};
use xpresent::config::PresentConfig;

mod state;
use state::State;

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occurred in main(): {:#}", err);
        std::process::exit(1);
    }
}

fn main_inner() -> Result<()> {
    // setup logger
    init_logger()?;
    info!("xpresent simulation starting up!");

    let config = PresentConfig::from_env();
    let frame = config.fake_interval;

    // init event loop
    let mut event_loop: EventLoop<'static, State> =
        EventLoop::try_new().context("Failed to initialize event loop")?;

    let mut state = State::new(event_loop.handle(), event_loop.get_signal(), config);

    // the client renders once per frame
    event_loop
        .handle()
        .insert_source(Timer::from_duration(frame), move |_, _, state| {
            state.client_tick();
            TimeoutAction::ToDuration(frame)
        })
        .map_err(|err| err.error)
        .context("Failed to insert client timer")?;

    // the compositor repaints at the same rate, half a frame later
    event_loop
        .handle()
        .insert_source(Timer::from_duration(frame + frame / 2), move |_, _, state| {
            state.compositor_tick();
            TimeoutAction::ToDuration(frame)
        })
        .map_err(|err| err.error)
        .context("Failed to insert compositor timer")?;

    info!("Starting event loop");

    event_loop.run(None, &mut state, |state| {
        // shall we shut down?
        if state.should_stop {
            info!("Shutting down");
            state.loop_signal.stop();
            state.loop_signal.wakeup();
        }
    })?;

    state.shutdown();
    info!("Event loop exited");
    Ok(())
}

fn init_logger() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xpresent=info"));

    fmt().with_env_filter(filter).init();

    Ok(())
}
