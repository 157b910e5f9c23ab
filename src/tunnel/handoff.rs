//! Unbuffered hand-off between one producer and any number of takers.
//!
//! A value only changes hands when a taker is waiting for it: takers park a
//! oneshot reply slot in a queue and the giver fills the first slot that is
//! still alive. Nothing is ever stored on the producer side.

use tokio::sync::{mpsc, oneshot, Mutex};

type Slot<T> = oneshot::Sender<T>;

/// Parked takers beyond this make `take` wait before registering.
const WAITING_TAKERS: usize = 16;

pub fn handoff<T>() -> (Giver<T>, Taker<T>) {
    let (tx, rx) = mpsc::channel(WAITING_TAKERS);
    (
        Giver {
            slots: Mutex::new(rx),
        },
        Taker { slots: tx },
    )
}

pub struct Giver<T> {
    slots: Mutex<mpsc::Receiver<Slot<T>>>,
}

impl<T> Giver<T> {
    /// Waits for a taker and hands `value` over.
    ///
    /// Gives the value back once every [`Taker`] is gone. Dropping the
    /// returned future before it completes drops `value` as well.
    pub async fn give(&self, mut value: T) -> Result<(), T> {
        let mut slots = self.slots.lock().await;
        loop {
            let Some(slot) = slots.recv().await else {
                return Err(value);
            };
            // A taker whose future was dropped leaves a dead slot behind.
            match slot.send(value) {
                Ok(()) => return Ok(()),
                Err(back) => value = back,
            }
        }
    }
}

pub struct Taker<T> {
    slots: mpsc::Sender<Slot<T>>,
}

impl<T> Clone for Taker<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Taker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Taker").finish_non_exhaustive()
    }
}

impl<T> Taker<T> {
    /// Waits for the giver to hand over a value, or returns None once the
    /// giver is gone.
    pub async fn take(&self) -> Option<T> {
        loop {
            let (slot, value) = oneshot::channel();
            self.slots.send(slot).await.ok()?;
            // A dropped slot means the giver went away; the next send says so.
            if let Ok(value) = value.await {
                return Some(value);
            }
        }
    }
}
