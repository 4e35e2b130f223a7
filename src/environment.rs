/**
Signals supplied by the embedding environment

`Environment` is the driving side: the host application flips network and
window state on it. `Notifiers` is the cheap, cloneable receiving side handed
to every query.
*/
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Notifiers {
    pub online: watch::Receiver<bool>,
    pub window_active: watch::Receiver<bool>,
    /// Receives the key of every destroyed query
    pub destroyed: mpsc::UnboundedSender<String>,
}

impl Notifiers {
    /// Offline or window hidden
    #[must_use]
    pub fn is_background(&self) -> bool {
        !*self.online.borrow() || !*self.window_active.borrow()
    }

    pub fn announce_destroyed(&self, key: &str) {
        // Nobody listening is fine
        let _ = self.destroyed.send(key.to_string());
    }
}

#[derive(Debug)]
pub struct Environment {
    online: watch::Sender<bool>,
    window_active: watch::Sender<bool>,
    destroyed_tx: mpsc::UnboundedSender<String>,
    destroyed_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Online with an active window
    #[must_use]
    pub fn new() -> Self {
        let (online, _) = watch::channel(true);
        let (window_active, _) = watch::channel(true);
        let (destroyed_tx, destroyed_rx) = mpsc::unbounded_channel();
        Self {
            online,
            window_active,
            destroyed_tx,
            destroyed_rx: Some(destroyed_rx),
        }
    }

    #[must_use]
    pub fn notifiers(&self) -> Notifiers {
        Notifiers {
            online: self.online.subscribe(),
            window_active: self.window_active.subscribe(),
            destroyed: self.destroyed_tx.clone(),
        }
    }

    pub fn set_online(&self, online: bool) {
        if self.online.send_if_modified(|current| replace(current, online)) {
            debug!("📡 Network {}", if online { "online" } else { "offline" });
        }
    }

    pub fn set_window_active(&self, active: bool) {
        if self.window_active.send_if_modified(|current| replace(current, active)) {
            debug!("🪟 Window {}", if active { "active" } else { "hidden" });
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    #[must_use]
    pub fn is_window_active(&self) -> bool {
        *self.window_active.borrow()
    }

    /// Receiver of destroy announcements; only the first caller gets it
    pub fn take_destroyed(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.destroyed_rx.take()
    }
}

fn replace(current: &mut bool, next: bool) -> bool {
    if *current == next {
        return false;
    }
    *current = next;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_mode_follows_signals() {
        let env = Environment::new();
        let notifiers = env.notifiers();
        assert!(!notifiers.is_background());

        env.set_online(false);
        assert!(notifiers.is_background());
        env.set_online(true);
        env.set_window_active(false);
        assert!(notifiers.is_background());
    }

    #[tokio::test]
    async fn test_unchanged_value_does_not_notify() {
        let env = Environment::new();
        let mut notifiers = env.notifiers();
        env.set_online(true);
        assert!(!notifiers.online.has_changed().unwrap());
        env.set_online(false);
        assert!(notifiers.online.has_changed().unwrap());
        assert!(!*notifiers.online.borrow_and_update());
    }

    #[tokio::test]
    async fn test_destroy_announcements() {
        let mut env = Environment::new();
        let mut rx = env.take_destroyed().unwrap();
        assert!(env.take_destroyed().is_none());
        env.notifiers().announce_destroyed("todos");
        assert_eq!(rx.recv().await.as_deref(), Some("todos"));
    }
}
