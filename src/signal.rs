use std::{
    io,
    os::raw::c_int,
    sync::mpsc::Sender,
    thread::{self, JoinHandle},
};

use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::{info, warn};

/// Spawn a thread that fires `stop` on the first SIGINT or SIGTERM.
pub fn spawn_shutdown_handler(stop: Sender<()>) -> io::Result<JoinHandle<()>> {
    spawn_for(&[SIGINT, SIGTERM], stop)
}

fn spawn_for(signals: &[c_int], stop: Sender<()>) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::new(signals)?;
    thread::Builder::new()
        .name("shutdown".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!(signal = sig, "received signal, shutting down");
                if stop.send(()).is_err() {
                    warn!("nothing left to stop");
                }
            }
        })
}
