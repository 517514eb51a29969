//! Host event queues
//!
//! Three independent FIFO queues, each behind its own lock. Producers on
//! any thread push; the manager loop swaps a whole queue out at once and
//! processes it with the lock released.

use crate::events::{KeyboardEvent, LaunchRequest, MessageEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{trace, warn};

#[derive(Debug, Default)]
pub struct Dispatcher {
    launches: Mutex<VecDeque<LaunchRequest>>,
    keyboard: Mutex<VecDeque<KeyboardEvent>>,
    messages: Mutex<VecDeque<MessageEvent>>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn accepting(&self, what: &str) -> bool {
        if self.closed.load(Ordering::Acquire) {
            warn!("Dispatcher closed, dropping {}", what);
            return false;
        }
        true
    }

    /// Queue a package for launch
    pub fn add_app_for_launch(&self, path: impl Into<PathBuf>, local: bool) -> bool {
        let path = path.into();
        if !self.accepting("launch request") {
            return false;
        }
        trace!("Queued launch of {} (local={})", path.display(), local);
        self.launches.lock().push_back(LaunchRequest { path, local });
        true
    }

    pub fn add_keyboard_event(&self, event: i32, keycode: i32) -> bool {
        if !self.accepting("keyboard event") {
            return false;
        }
        self.keyboard.lock().push_back(KeyboardEvent { event, keycode });
        true
    }

    pub fn add_message_event(
        &self,
        target: i32,
        msg_id: u32,
        wparam: i32,
        lparam: i32,
        sender: i32,
    ) -> bool {
        if !self.accepting("message event") {
            return false;
        }
        self.messages.lock().push_back(MessageEvent {
            target,
            msg_id,
            wparam,
            lparam,
            sender,
        });
        true
    }

    /// Take every queued launch request
    pub fn take_launches(&self) -> VecDeque<LaunchRequest> {
        std::mem::take(&mut *self.launches.lock())
    }

    pub fn take_keyboard_events(&self) -> VecDeque<KeyboardEvent> {
        std::mem::take(&mut *self.keyboard.lock())
    }

    pub fn take_message_events(&self) -> VecDeque<MessageEvent> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Queue lengths as (launches, keyboard, messages)
    pub fn pending(&self) -> (usize, usize, usize) {
        (
            self.launches.lock().len(),
            self.keyboard.lock().len(),
            self.messages.lock().len(),
        )
    }

    /// Refuse further events; already queued ones can still be drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
