//! echolog: a TCP record-logging server
//!
//! Each newline-terminated chunk of a client's byte stream is one record.
//! Records are appended to a single shared log file and the full log is
//! echoed back after every commit. A heartbeat task injects a timestamp
//! record at a fixed interval. SIGINT/SIGTERM trigger an orderly teardown:
//! connections closed, tasks joined, log file deleted.

mod config;
mod heartbeat;
mod registry;
mod server;
mod shutdown;
mod store;

use config::Config;
use shutdown::Shutdown;
use store::RecordLog;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        data_file = %config.data_file.display(),
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        daemon = config.daemon,
        "Starting echolog server"
    );

    // Bind before daemonizing so an address-in-use error fails in the
    // foreground with a non-zero status.
    let listener = server::bind(&config.listen)?;

    if config.daemon {
        daemonize()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let shutdown = Shutdown::new();
        let log = RecordLog::create(&config.data_file).await?;

        // Signal-handler installation failure is fatal before any
        // connection is accepted.
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let sig_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            info!("Caught signal, exiting");
            sig_shutdown.trigger();
        });

        let server = server::Server::new(config, log, shutdown);
        server.run(listener).await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Detach into the background: fork, exit the parent, start a new session.
///
/// Runs before the tokio runtime is created, while the process is still
/// single-threaded.
fn daemonize() -> std::io::Result<()> {
    // SAFETY: no threads exist yet and no locks are held across the fork.
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }
        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
