//! Background collector thread
//!
//! Drives [`Volume::run_background_step`] from a dedicated thread so unit
//! transfers and erases happen between foreground operations:
//!
//! - one step per lock acquisition, so writers are never blocked for more
//!   than a single sector copy or block erase
//! - commands arrive over a crossbeam channel; idle wakeups pick up jobs
//!   scheduled by the volume itself at the low-water mark
//! - the thread is joined on drop

use crate::media::FlashMedia;
use crate::volume::Volume;
use crossbeam::channel::{self, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

enum Command {
    Collect,
    Shutdown,
}

/// Background collection thread for a shared volume
pub struct Collector {
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    steps: Arc<AtomicU64>,
}

impl Collector {
    /// Start the collector
    ///
    /// # Arguments
    /// * `volume` - Volume shared with foreground callers
    /// * `idle` - How long to sleep between checks for scheduled work
    pub fn spawn<M>(volume: Arc<Mutex<Volume<M>>>, idle: Duration) -> Self
    where
        M: FlashMedia + Send + 'static,
    {
        let (commands, receiver) = channel::unbounded();
        let steps = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&steps);

        let thread = thread::spawn(move || loop {
            match receiver.recv_timeout(idle) {
                Ok(Command::Collect) => {
                    volume.lock().schedule_background_collect();
                }
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            loop {
                match receiver.try_recv() {
                    Ok(Command::Collect) => {
                        volume.lock().schedule_background_collect();
                    }
                    Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => return,
                    Err(TryRecvError::Empty) => {}
                }

                let mut guard = volume.lock();
                if guard.is_suspended() {
                    break;
                }
                match guard.run_background_step() {
                    Ok(more) => {
                        counter.fetch_add(1, Ordering::Relaxed);
                        if !more {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Background collection step failed: {}", e);
                        break;
                    }
                }
            }
        });

        debug!("Background collector started");
        Collector {
            commands,
            thread: Some(thread),
            steps,
        }
    }

    /// Ask for a collection. Ignored while a job is already queued.
    pub fn request_collect(&self) {
        let _ = self.commands.send(Command::Collect);
    }

    /// Steps run so far, including idle polls that found nothing to do
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it. A job in progress stays queued on
    /// the volume and finishes at the next collection or dismount.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Background collector panicked");
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}
