use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    items: Vec<Notification>,
}

impl Inner {
    fn remove(&mut self, id: u64) {
        self.items.retain(|n| n.id != id);
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // A panicked holder cannot leave the list half-edited
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// FIFO notification list. Clones share one list; each timed notification
/// gets its own tokio timer, which holds only a weak reference so timers
/// stop mattering once the last handle is dropped.
#[derive(Debug, Clone, Default)]
pub struct NotificationCenter {
    inner: Arc<Mutex<Inner>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notification and return its id. A zero duration never
    /// expires.
    pub fn push(&self, kind: NotificationKind, message: impl Into<String>, duration: Duration) -> u64 {
        let id = {
            let mut inner = lock(&self.inner);
            inner.next_id += 1;
            let id = inner.next_id;
            inner.items.push(Notification {
                id,
                kind,
                message: message.into(),
                duration_ms: duration.as_millis() as u64,
            });
            id
        };

        if !duration.is_zero() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
                    handle.spawn(async move {
                        tokio::time::sleep(duration).await;
                        if let Some(inner) = weak.upgrade() {
                            lock(&inner).remove(id);
                        }
                    });
                }
                Err(_) => log::warn!("No async runtime; notification {} will not auto-dismiss", id),
            }
        }
        id
    }

    /// Remove a notification now. Unknown ids are ignored.
    pub fn dismiss(&self, id: u64) {
        lock(&self.inner).remove(id);
    }

    pub fn list(&self) -> Vec<Notification> {
        lock(&self.inner).items.clone()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_never_expires() {
        let center = NotificationCenter::new();
        center.push(NotificationKind::Info, "sticky", Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(center.list().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_duration() {
        let center = NotificationCenter::new();
        let id = center.push(NotificationKind::Success, "done", Duration::from_millis(5000));

        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert_eq!(center.list()[0].id, id);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(center.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_are_independent() {
        let center = NotificationCenter::new();
        center.push(NotificationKind::Info, "short", Duration::from_millis(100));
        let long = center.push(NotificationKind::Warning, "long", Duration::from_millis(1000));
        center.push(NotificationKind::Error, "sticky", Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let messages: Vec<String> = center.list().into_iter().map(|n| n.message).collect();
        assert_eq!(messages, vec!["long", "sticky"]);

        center.dismiss(long);
        center.dismiss(long);
        center.dismiss(999);
        assert_eq!(center.list().len(), 1);
    }

    #[test]
    fn test_insertion_order_and_ids() {
        let center = NotificationCenter::new();
        let a = center.push(NotificationKind::Info, "a", Duration::ZERO);
        let b = center.push(NotificationKind::Info, "b", Duration::ZERO);
        assert!(b > a);
        let ids: Vec<u64> = center.list().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_serializes_kind_as_type() {
        let n = Notification {
            id: 1,
            kind: NotificationKind::Warning,
            message: "m".to_string(),
            duration_ms: 0,
        };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "warning");
    }
}
