use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type CancelFn = Box<dyn FnOnce() + Send>;

/// Cancel handle for a live stream. Cancelling twice is a no-op.
#[derive(Clone)]
pub struct SubscriptionHandle {
    cancelled: Arc<AtomicBool>,
    on_cancel: Arc<Mutex<Option<CancelFn>>>,
}

impl SubscriptionHandle {
    pub fn new(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            on_cancel: Arc::new(Mutex::new(Some(Box::new(on_cancel)))),
        }
    }

    pub fn noop() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            on_cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let on_cancel = match self.on_cancel.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Push stream of updates paired with the handle that stops it.
#[derive(Debug)]
pub struct Subscription<T> {
    pub handle: SubscriptionHandle,
    pub updates: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    pub fn new(handle: SubscriptionHandle, updates: mpsc::UnboundedReceiver<T>) -> Self {
        Self { handle, updates }
    }

    pub fn into_parts(self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<T>) {
        (self.handle, self.updates)
    }
}
