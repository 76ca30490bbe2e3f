use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use segvm_core::{GuestMemory, Hex, Linear};

/// Offset of the timer tick counter in the BIOS data area.
pub const BIOS_TICK_OFFSET: u32 = 0x6c;

/// Periodic source of BIOS timer ticks.
///
/// Started the first time guest code loads the BIOS data selector.
pub trait TickSource: Send + Sync {
    /// Starts ticking. Called at most once.
    fn start(&self);
}

impl<T> TickSource for Arc<T>
where
    T: TickSource + ?Sized,
{
    fn start(&self) {
        (**self).start()
    }
}

/// A tick source that never ticks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTicks;

impl TickSource for NoTicks {
    fn start(&self) {}
}

/// Increments the BIOS tick counter from a background thread.
///
/// The thread stops when the timer is dropped.
pub struct BiosTickTimer {
    memory: Arc<dyn GuestMemory + Send + Sync>,
    counter: Linear,
    interval: Duration,
    started: AtomicBool,
    stop: Arc<AtomicBool>,
}

impl BiosTickTimer {
    /// Creates a timer for the BIOS data area at `bios_data_base`.
    pub fn new(
        memory: Arc<dyn GuestMemory + Send + Sync>,
        bios_data_base: u32,
        interval: Duration,
    ) -> Self {
        Self {
            memory,
            counter: Linear(bios_data_base) + BIOS_TICK_OFFSET,
            interval,
            started: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Checks whether the timer thread was started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl TickSource for BiosTickTimer {
    fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let memory = self.memory.clone();
        let counter = self.counter;
        let interval = self.interval;
        let stop = self.stop.clone();

        let result = std::thread::Builder::new()
            .name("bios-tick".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);

                    let ticks = match memory.read_u32(counter) {
                        Ok(ticks) => ticks,
                        Err(err) => {
                            tracing::warn!(%err, "BIOS tick counter unreadable");
                            break;
                        }
                    };

                    if let Err(err) = memory.write_u32(counter, ticks.wrapping_add(1)) {
                        tracing::warn!(%err, "BIOS tick counter unwritable");
                        break;
                    }
                }
            });

        match result {
            Ok(_) => tracing::debug!(counter = %Hex(counter.0), ?interval, "BIOS tick timer started"),
            Err(err) => tracing::error!(%err, "failed to start BIOS tick timer"),
        }
    }
}

impl Drop for BiosTickTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for BiosTickTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BiosTickTimer")
            .field("counter", &self.counter)
            .field("interval", &self.interval)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}
