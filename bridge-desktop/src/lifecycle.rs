//! Desktop lifecycle observer.
//!
//! Desktop apps have no OS-driven suspend cycle; the host window layer reports
//! focus changes through [`DesktopLifecycleObserver::set_state`].

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    lifecycle::{LifecycleChangeStream, LifecycleObserver, LifecycleState},
};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle observer fed by window focus events. Starts in the foreground.
pub struct DesktopLifecycleObserver {
    sender: watch::Sender<LifecycleState>,
}

impl DesktopLifecycleObserver {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(LifecycleState::Foreground);
        Self { sender }
    }

    /// Report a lifecycle transition. Repeating the current state is a no-op.
    pub fn set_state(&self, state: LifecycleState) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(?state, "Desktop lifecycle state changed");
        }
    }
}

impl Default for DesktopLifecycleObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LifecycleObserver for DesktopLifecycleObserver {
    async fn get_state(&self) -> Result<LifecycleState> {
        Ok(*self.sender.borrow())
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn LifecycleChangeStream>> {
        Ok(Box::new(DesktopLifecycleChangeStream {
            receiver: self.sender.subscribe(),
        }))
    }
}

struct DesktopLifecycleChangeStream {
    receiver: watch::Receiver<LifecycleState>,
}

#[async_trait]
impl LifecycleChangeStream for DesktopLifecycleChangeStream {
    async fn next(&mut self) -> Option<LifecycleState> {
        self.receiver.changed().await.ok()?;
        Some(*self.receiver.borrow_and_update())
    }
}
