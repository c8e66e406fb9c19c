// Copyright 2026 The rfbsession Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Signal-driven periodic worker for framebuffer updates.
//!
//! The scheduler caps how often the update action runs without busy
//! idling: while there is work, each cycle waits on the signal with a
//! timeout of `1 / rate` seconds; once the action reports nothing to do,
//! the worker parks on the signal alone until the next
//! [`signal`](UpdateScheduler::signal).

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// A single worker task that runs an update action at most `rate` times
/// per second while signaled.
pub struct UpdateScheduler {
    signal: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateScheduler {
    /// Creates a stopped scheduler.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            signal: Arc::new(Notify::new()),
            shutdown,
            shutdown_rx,
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker.
    ///
    /// `action` runs once per wakeup and returns whether it produced
    /// output; a `false` parks the worker until the next signal.
    /// `rate_source` is sampled each armed cycle, so the cap can change
    /// while the worker runs. `initial_fire` pre-signals so the first
    /// cycle fires immediately.
    ///
    /// Must be called within a tokio runtime.
    pub fn start<A, F, R>(&self, mut action: A, rate_source: R, initial_fire: bool)
    where
        A: FnMut() -> F + Send + 'static,
        F: Future<Output = bool> + Send,
        R: Fn() -> f64 + Send + Sync + 'static,
    {
        let signal = Arc::clone(&self.signal);
        let mut shutdown = self.shutdown_rx.clone();
        if initial_fire {
            signal.notify_one();
        }

        let handle = tokio::spawn(async move {
            let mut armed = true;
            loop {
                let wait = async {
                    if armed {
                        let period = Duration::from_secs_f64(1.0 / rate_source());
                        let _ = tokio::time::timeout(period, signal.notified()).await;
                    } else {
                        signal.notified().await;
                    }
                };
                tokio::select! {
                    _ = shutdown.changed() => break,
                    () = wait => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                armed = action().await;
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    /// Requests a work cycle.
    ///
    /// Edge-triggered and idempotent: any number of signals between
    /// wakeups collapse into a single cycle.
    pub fn signal(&self) {
        self.signal.notify_one();
    }

    /// Stops the worker and waits for it to exit. Idempotent.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}
