use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use log::{error, info, warn};
use reborn::{Coordinator, Handoff, HookResult, Listener, Signal, Strategy};
use sd_notify::NotifyState;
use tokio::sync::watch;

mod config;
mod serve;

use config::Config;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or("usage: greeter <config.json>")?;
    let config = Config::load(&config_path)?;
    let strategy = config.restart.strategy;
    info!(
        "greeter {} starting as pid {} ({strategy} strategy)",
        uuid::Uuid::new_v4(),
        process::id()
    );

    let handoff = Handoff::from_env(strategy)?;
    let (greeting_tx, greeting_rx) = watch::channel(config.greeting.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Until `build` registers them, restart and reload signals keep their
    // default dispositions and terminate the process. A re-executed image is
    // exposed to this between exec and here, so registration comes before
    // taking over the listener.
    let reload_path = config_path.clone();
    let listen = config.listen.clone();
    let mut coordinator = Coordinator::builder(handoff)
        .handshake_timeout(config.restart.handshake_timeout())
        .on_reload(move |listener| {
            notify(&[NotifyState::Reloading]);
            let reloaded = reload(&reload_path, &listen, listener, &greeting_tx);
            notify(&[NotifyState::Ready]);
            reloaded
        })
        .on_reopen_logs(|| {
            info!("log reopen requested; logs go to stderr, nothing to reopen");
            Ok(())
        })
        .build()?;

    let listener = coordinator.spawner().listener_or_bind(&config.listen)?;
    info!("serving {}", listener.name()?);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let server = runtime.spawn(serve::serve(
        listener.try_clone()?,
        greeting_rx,
        shutdown_rx,
        config.grace_period(),
    ));

    if let Some(pid_file) = &config.pid_file {
        fs::write(pid_file, process::id().to_string())?;
    }
    if coordinator.spawner().is_successor() {
        // Tell the other generation we are serving.
        if let Err(e) = coordinator.spawner().kill() {
            warn!("handshake failed, serving alone: {e}");
        }
    }
    notify(&[NotifyState::MainPid(process::id()), NotifyState::Ready]);

    let signal = loop {
        match coordinator.wait(&listener) {
            Ok(signal) => break signal,
            Err(e) => error!("restart failed, still serving: {e}"),
        }
    };

    notify(&[NotifyState::Stopping]);
    let _ = shutdown_tx.send(true);
    match runtime.block_on(server) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("server stopped with error: {e}"),
        Err(e) => error!("server task failed: {e}"),
    }
    runtime.shutdown_timeout(Duration::from_secs(1));

    match signal {
        Signal::SIGUSR2 if strategy == Strategy::Double => {
            // The interim successor is serving; come back as a fresh image
            // under this pid and retire it. Signals sent to this pid before
            // the new image registers its handlers are fatal.
            let reexec = coordinator.spawner().exec_in_place(&listener)?;
            Err(reexec.exec().into())
        }
        Signal::SIGINT | Signal::SIGTERM => {
            if let Some(pid_file) = &config.pid_file {
                remove_own_pid_file(pid_file);
            }
            if matches!(listener, Listener::Unix(_)) {
                let path = listener.addr()?;
                if !path.is_empty() {
                    fs::remove_file(&path)?;
                }
            }
            info!("stopped on {signal}");
            Ok(())
        }
        _ => {
            info!("handed off, exiting on {signal}");
            Ok(())
        }
    }
}

fn reload(
    path: &Path,
    listen: &str,
    listener: &Listener,
    greeting: &watch::Sender<String>,
) -> HookResult {
    let fresh = Config::load(path)?;
    if fresh.listen != listen {
        warn!(
            "still serving {}; listen address changes need a fresh start",
            listener.name()?
        );
    }
    greeting.send_replace(fresh.greeting);
    info!("reloaded {}", path.display());
    Ok(())
}

fn notify(state: &[NotifyState]) {
    if let Err(e) = sd_notify::notify(false, state) {
        warn!("sd_notify failed: {e}");
    }
}

fn remove_own_pid_file(path: &Path) {
    match fs::read_to_string(path) {
        Ok(pid) if pid.trim() == process::id().to_string() => {
            if let Err(e) = fs::remove_file(path) {
                warn!("removing {}: {e}", path.display());
            }
        }
        _ => {}
    }
}
