/// Deferred-completion callbacks handed to the event scheduler.
pub type Event = Box<dyn FnOnce() + Send + 'static>;

/// Callback submission queue, consumed but not implemented by the core.
/// Flush completions are enqueued here rather than run on the I/O thread.
pub trait EventScheduler: Send + Sync {
    fn enqueue(&self, event: Event);
}

/// Runs events inline on the submitting thread.  Suitable for tests and for
/// callers that do their own deferral.
pub struct InlineScheduler;

impl EventScheduler for InlineScheduler {
    fn enqueue(&self, event: Event) {
        event();
    }
}
