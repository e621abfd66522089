use color_eyre::{eyre::eyre, Result};
use remote_kiosk::screens::ScreenFlow;
use remote_kiosk::{worker, DeviceSupervisor, KioskConfig, ProcessLauncher};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    setup()?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("worker") => {
            let settings = args
                .next()
                .ok_or_else(|| eyre!("worker mode needs its settings as an argument"))?;
            run_worker(&settings)
        }
        Some("kiosk") | None => {
            let config = KioskConfig::load()?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_kiosk(config))
        }
        Some(other) => Err(eyre!("unknown mode {:?}, expected `kiosk` or `worker`", other)),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

// Logs go to stderr: in worker mode stdout carries the message channel
fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn run_worker(settings: &str) -> Result<()> {
    match worker::run_process(settings) {
        Ok(exit) => {
            info!("Worker exiting: {:?}", exit);
            std::process::exit(exit.exit_code());
        }
        Err(e) => {
            error!("Worker failed: {}", e);
            std::process::exit(2);
        }
    }
}

async fn run_kiosk(config: KioskConfig) -> Result<()> {
    info!("Starting kiosk with config: {:?}", config);

    let launcher = ProcessLauncher::current_exe(&config.worker)?;
    let supervisor = DeviceSupervisor::start(config.supervisor.clone(), Arc::new(launcher))?;
    let reader = supervisor.state_reader();

    let mut flow = ScreenFlow::new(config.ui.screens.clone());
    let mut ticker = tokio::time::interval(config.ui.frame_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "Entering frame loop at {} fps on screen {}",
        config.ui.frame_rate,
        flow.screen()
    );
    let mut last_frame = Instant::now();
    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let dt = (now - last_frame).as_secs_f64();
                last_frame = now;

                let state = reader.read();
                if let Some(transition) = flow.update(dt, &state) {
                    debug!("Frame state at transition: {}", state);
                    info!("Requesting screen {} (from {})", transition.to, transition.from);
                }
            }
        }
    }

    // Joining the supervisor thread blocks, keep it off the async workers
    tokio::task::spawn_blocking(move || supervisor.stop()).await??;
    info!("Kiosk stopped");
    Ok(())
}
