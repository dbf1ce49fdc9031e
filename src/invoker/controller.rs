//! Lifecycle and hot configuration shared by consumers and providers.
//!
//! [`Lifecycle`] enforces the open/close state machine:
//!
//! ```text
//! CLOSED --open--> OPENING --ok--> OPENED --close--> CLOSING --> CLOSED
//! OPENING --failure--> CLOSED
//! OPENING --close--> CLOSING   (the open completes with an error)
//! ```
//!
//! [`ConfigController`] receives versioned configuration events, satisfies
//! the initial wait with the first one and applies later ones through a
//! single debounced task that always uses the newest payload.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::config::{keys, GlobalContext, Params};
use crate::discovery::ConfigEvent;
use crate::error::{Result, RpcError};
use crate::promise::Promise;
use crate::status::{AtomicStatus, Status};
use crate::transport::BoxFuture;
use crate::url::Url;

/// What a caller of [`Lifecycle::begin_open`]/[`Lifecycle::begin_close`]
/// should do next.
pub(crate) enum Transition {
    /// The caller won the transition and must drive it to completion.
    Drive(Promise<()>),
    /// Another caller is driving (or drove) it; wait on this.
    Join(Promise<()>),
}

/// Status plus the in-flight open and close promises.
pub(crate) struct Lifecycle {
    role: &'static str,
    status: AtomicStatus,
    open_future: Mutex<Option<Promise<()>>>,
    close_future: Mutex<Option<Promise<()>>>,
}

impl Lifecycle {
    pub fn new(role: &'static str) -> Self {
        Self {
            role,
            status: AtomicStatus::new(Status::Closed),
            open_future: Mutex::new(None),
            close_future: Mutex::new(None),
        }
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn begin_open(&self) -> Transition {
        if self.status.transition(Status::Closed, Status::Opening) {
            let promise = Promise::new();
            *self.open_future.lock() = Some(promise.clone());
            return Transition::Drive(promise);
        }
        match self.status.get() {
            Status::Opening | Status::Opened => match self.open_future.lock().clone() {
                Some(p) => Transition::Join(p),
                None => Transition::Join(Promise::completed(Err(self.state_error()))),
            },
            _ => Transition::Join(Promise::completed(Err(self.state_error()))),
        }
    }

    /// Finish an open driven by this caller. Fails if a close intervened.
    pub fn finish_open(&self, promise: &Promise<()>, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => {
                if self.status.transition(Status::Opening, Status::Opened) {
                    promise.complete(Ok(()));
                    Ok(())
                } else {
                    let err = self.closed_while_opening();
                    promise.complete(Err(err.clone()));
                    Err(err)
                }
            }
            Err(e) => {
                self.status.transition(Status::Opening, Status::Closed);
                promise.complete(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Fails once a close has taken over an open still in progress.
    pub fn ensure_opening(&self) -> Result<()> {
        match self.status.get() {
            Status::Opening => Ok(()),
            _ => Err(self.closed_while_opening()),
        }
    }

    fn closed_while_opening(&self) -> RpcError {
        RpcError::init(format!("{} was closed while opening.", self.role))
    }

    pub fn begin_close(&self) -> Transition {
        let mut close_future = self.close_future.lock();
        if self.status.transition(Status::Opened, Status::Closing) {
            let promise = Promise::new();
            *close_future = Some(promise.clone());
            return Transition::Drive(promise);
        }
        if self.status.transition(Status::Opening, Status::Closing) {
            if let Some(open) = self.open_future.lock().as_ref() {
                open.complete(Err(self.closed_while_opening()));
            }
            let promise = Promise::new();
            *close_future = Some(promise.clone());
            return Transition::Drive(promise);
        }
        // Closing joins the running close; closed returns the cached result.
        let promise = close_future
            .get_or_insert_with(|| Promise::completed(Ok(())))
            .clone();
        Transition::Join(promise)
    }

    pub fn finish_close(&self, promise: &Promise<()>) {
        self.status.set(Status::Closed);
        promise.complete(Ok(()));
    }

    /// Error for calls made outside `OPENED`.
    pub fn state_error(&self) -> RpcError {
        let state = match self.status.get() {
            Status::Opening => "opening",
            Status::Opened => "opened",
            Status::Closing => "closing",
            Status::Closed => "closed",
        };
        RpcError::IllegalState(format!("{} config is {}.", self.role, state))
    }
}

/// Applies an effective url produced by a configuration update.
pub(crate) type ApplyFn = Box<dyn Fn(Url) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Versioned, debounced configuration updates of one controller.
pub(crate) struct ConfigController {
    name: String,
    base_url: Url,
    context: Arc<GlobalContext>,
    delay: Duration,
    waiting: Promise<Url>,
    version: AtomicI64,
    last_data: Mutex<Option<Params>>,
    pending: Mutex<Option<ConfigEvent>>,
    update_owner: AtomicBool,
    broken: AtomicBool,
    effective: RwLock<Url>,
    applied: AtomicUsize,
    apply: RwLock<Option<ApplyFn>>,
}

impl ConfigController {
    pub fn new(name: &str, base_url: Url, context: Arc<GlobalContext>, delay: Duration) -> Self {
        let effective = context.configure(&base_url, None);
        Self {
            name: name.to_string(),
            base_url,
            context,
            delay,
            waiting: Promise::new(),
            version: AtomicI64::new(i64::MIN),
            last_data: Mutex::new(None),
            pending: Mutex::new(None),
            update_owner: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            effective: RwLock::new(effective),
            applied: AtomicUsize::new(0),
            apply: RwLock::new(None),
        }
    }

    /// Set the hook run after each applied update.
    pub fn on_apply(&self, apply: ApplyFn) {
        *self.apply.write() = Some(apply);
    }

    /// The url with every configuration layer merged in.
    pub fn effective(&self) -> Url {
        self.effective.read().clone()
    }

    /// Recompute the effective url without a subscription update.
    pub fn refresh(&self) -> Url {
        let url = self.context.configure(&self.base_url, self.last_data.lock().as_ref());
        *self.effective.write() = url.clone();
        url
    }

    /// Updates applied after the initial configuration.
    #[cfg(test)]
    pub fn applied_count(&self) -> usize {
        self.applied.load(Ordering::Acquire)
    }

    /// Wait for the first configuration event.
    pub async fn wait_config(&self) -> Result<Url> {
        self.waiting.wait().await
    }

    /// Fail a pending [`wait_config`](Self::wait_config) and stop applying
    /// updates.
    pub fn broken(&self) {
        self.broken.store(true, Ordering::Release);
        self.waiting.complete(Err(RpcError::init(
            "Unexport interrupted waiting config.",
        )));
    }

    /// Accept an event from the subscription.
    pub fn on_event(self: &Arc<Self>, event: ConfigEvent) {
        if self.broken.load(Ordering::Acquire) {
            return;
        }
        if !self.waiting.is_done() {
            // The first snapshot becomes the initial configuration.
            match self.accept(event) {
                Some(data) => {
                    let url = self.context.configure(&self.base_url, Some(&data));
                    *self.effective.write() = url.clone();
                    self.waiting.complete(Ok(url));
                }
                None => {
                    self.waiting.complete(Ok(self.effective()));
                }
            }
            return;
        }

        *self.pending.lock() = Some(event);
        if !self.update_owner.swap(true, Ordering::AcqRel) {
            tokio::spawn(self.clone().run_updates());
        }
    }

    /// Version and change check. Returns the data to apply, stamped with its
    /// version as the counter.
    fn accept(&self, event: ConfigEvent) -> Option<Params> {
        let seen = self.version.load(Ordering::Acquire);
        if event.version <= seen {
            tracing::debug!(
                "Ignoring config version {} for {}, already at {}",
                event.version,
                self.name,
                seen
            );
            return None;
        }
        self.version.store(event.version, Ordering::Release);

        let mut last = self.last_data.lock();
        if last.as_ref() == Some(&event.data) {
            return None;
        }
        *last = Some(event.data.clone());
        let mut data = event.data;
        data.insert(keys::COUNTER.to_string(), event.version.to_string());
        Some(data)
    }

    async fn run_updates(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.delay).await;
            let event = self.pending.lock().take();
            if let Some(event) = event {
                self.apply_event(event).await;
            }
            self.update_owner.store(false, Ordering::Release);
            // Re-chain if an event arrived after the take and nobody else took over.
            if self.pending.lock().is_none() || self.update_owner.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }

    async fn apply_event(&self, event: ConfigEvent) {
        if self.broken.load(Ordering::Acquire) {
            return;
        }
        let Some(data) = self.accept(event) else {
            return;
        };
        let url = self.context.configure(&self.base_url, Some(&data));
        if url == self.effective() {
            return;
        }
        *self.effective.write() = url.clone();
        self.applied.fetch_add(1, Ordering::AcqRel);
        tracing::info!("Applying config update to {}: {}", self.name, url);

        let fut = self.apply.read().as_ref().map(|apply| apply(url));
        if let Some(fut) = fut {
            if let Err(e) = fut.await {
                tracing::error!("Error applying config update to {}: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn controller() -> Arc<ConfigController> {
        Arc::new(ConfigController::new(
            "demo",
            Url::new("joy", None, 0, "demo.Echo"),
            Arc::new(GlobalContext::new()),
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn test_open_close_transitions() {
        let lc = Lifecycle::new("Consumer");
        let Transition::Drive(open) = lc.begin_open() else {
            panic!("first open must drive");
        };
        let Transition::Join(joined) = lc.begin_open() else {
            panic!("second open must join");
        };
        assert!(open.ptr_eq(&joined));
        lc.finish_open(&open, Ok(())).unwrap();
        assert_eq!(lc.status(), Status::Opened);

        let Transition::Drive(close) = lc.begin_close() else {
            panic!("first close must drive");
        };
        lc.finish_close(&close);
        let Transition::Join(again) = lc.begin_close() else {
            panic!("closed must join");
        };
        assert!(close.ptr_eq(&again));
        assert!(again.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_during_open_fails_open() {
        let lc = Lifecycle::new("Provider");
        let Transition::Drive(open) = lc.begin_open() else {
            panic!();
        };
        assert!(lc.ensure_opening().is_ok());
        let Transition::Drive(close) = lc.begin_close() else {
            panic!();
        };
        assert!(matches!(
            lc.ensure_opening(),
            Err(RpcError::Initialization { ref message, .. }) if message == "Provider was closed while opening."
        ));
        assert!(matches!(
            open.wait().await,
            Err(RpcError::Initialization { .. })
        ));
        assert!(lc.finish_open(&open, Ok(())).is_err());
        lc.finish_close(&close);
        assert_eq!(lc.status(), Status::Closed);
    }

    #[test]
    fn test_state_errors() {
        let lc = Lifecycle::new("Consumer");
        assert_eq!(
            lc.state_error().to_string(),
            RpcError::IllegalState("Consumer config is closed.".into()).to_string()
        );
    }

    #[tokio::test]
    async fn test_broken_interrupts_wait() {
        let c = controller();
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_config().await })
        };
        c.broken();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Unexport interrupted waiting config."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_applies_latest_once() {
        let c = controller();
        let hits: Arc<Mutex<Vec<Url>>> = Arc::default();
        let sink = hits.clone();
        c.on_apply(Box::new(move |url| -> BoxFuture<'static, Result<()>> {
            sink.lock().push(url);
            Box::pin(async { Ok(()) })
        }));

        c.on_event(ConfigEvent {
            version: 1,
            data: Params::new(),
        });
        assert!(c.wait_config().await.is_ok());

        for v in 2..=10 {
            c.on_event(ConfigEvent {
                version: v,
                data: params(&[(keys::TIMEOUT, &(v * 100).to_string())]),
            });
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let hits = hits.lock();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].param(keys::TIMEOUT), Some("1000"));
        assert_eq!(hits[0].param(keys::COUNTER), Some("10"));
        assert_eq!(c.applied_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_unchanged_events_ignored() {
        let c = controller();
        c.on_event(ConfigEvent {
            version: 5,
            data: params(&[(keys::TIMEOUT, "100")]),
        });
        assert_eq!(
            c.wait_config().await.unwrap().param(keys::TIMEOUT),
            Some("100")
        );

        c.on_event(ConfigEvent {
            version: 4,
            data: params(&[(keys::TIMEOUT, "999")]),
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        c.on_event(ConfigEvent {
            version: 6,
            data: params(&[(keys::TIMEOUT, "100")]),
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(c.applied_count(), 0);
        assert_eq!(c.effective().param(keys::TIMEOUT), Some("100"));
    }
}
