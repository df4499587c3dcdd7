//! Periodic Router Advertisements on the downstream links.

use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::{
    context::Context,
    distributor::Assignment,
    error::Error,
    wire::{frame, ra::RouterAdvertisement},
};

/// Ethernet frame advertising `assignment.prefix` from the link's own MAC and
/// link-local address to all nodes.
pub fn announcement_frame(assignment: &Assignment) -> Vec<u8> {
    let link = &assignment.link;
    let ra = RouterAdvertisement::announcement(link.mac, assignment.prefix);
    frame::icmpv6_frame(link.mac, link.link_local(), frame::ALL_NODES, &ra.to_vec())
}

/// Running announcer thread.
pub struct AnnouncerHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl AnnouncerHandle {
    /// A sender that stops the announcer, for signal handlers and the like
    pub fn stopper(&self) -> Sender<()> {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stop the thread and wait for it to release its links.
    pub fn stop(self) {
        // already gone if the receiver hung up
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            error!("announcer thread panicked");
        }
    }

    /// Wait until something else stops the announcer
    pub fn join(self) {
        if self.thread.join().is_err() {
            error!("announcer thread panicked");
        }
    }
}

pub fn spawn(ctx: Arc<Context>, assignments: Vec<Assignment>) -> Result<AnnouncerHandle, Error> {
    let (stop, stopped) = mpsc::channel();
    let thread = thread::Builder::new()
        .name("ra-announcer".to_string())
        .spawn(move || run(&ctx, assignments, stopped))
        .map_err(Error::Spawn)?;
    Ok(AnnouncerHandle { stop, thread })
}

fn run(ctx: &Context, assignments: Vec<Assignment>, stopped: Receiver<()>) {
    let links: Vec<Assignment> = assignments
        .into_iter()
        .filter(|a| match ctx.platform.set_link_up(&a.link.name) {
            Ok(()) => true,
            Err(e) => {
                error!(link = %a.link.name, %e, "failed to open link for announcements");
                false
            }
        })
        .collect();

    let interval = ctx.config.ra_interval();
    info!(
        links = links.len(),
        interval_secs = interval.as_secs(),
        "router advertisements started"
    );

    loop {
        match stopped.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => break,
        }
        announce_once(ctx, &links);
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for a in &links {
        ctx.platform.release_link(&a.link.name);
    }
    info!("router advertisements stopped");
}

fn announce_once(ctx: &Context, links: &[Assignment]) {
    for a in links {
        match ctx.platform.transmit(&a.link.name, &announcement_frame(a)) {
            Ok(()) => debug!(link = %a.link.name, prefix = %a.prefix, "sent router advertisement"),
            Err(e) => warn!(link = %a.link.name, %e, "failed to send router advertisement"),
        }
    }
}
