//! Translation of storage scanner events into logical events.

use std::path::PathBuf;
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;

use crate::event::ScanEvent;
use crate::logical;
use crate::propagator::ChangeSet;

/// Sits between one mount's storage scanner and the rest of the world.
///
/// Every event is rewritten from a storage-relative path to a logical path,
/// handed to the progress channel (if anyone listens), and cache changes are
/// staged for propagation. Progress events that do not fit in the channel
/// are dropped; staging never is. The staged changes only reach the propagator once
/// the mount's scan has been committed.
#[derive(Debug)]
pub struct EventBridge {
    mount_point: PathBuf,
    progress: Option<Sender<ScanEvent>>,
    staged: ChangeSet,
    dropped: usize,
}

impl EventBridge {
    pub fn new(mount_point: impl Into<PathBuf>, progress: Option<Sender<ScanEvent>>) -> Self {
        Self { mount_point: mount_point.into(), progress, staged: ChangeSet::default(), dropped: 0 }
    }

    /// Translate and dispatch one event, returning its logical form.
    pub fn forward(&mut self, event: ScanEvent) -> ScanEvent {
        let event = event.map_path(|path| logical::join(&self.mount_point, &path));
        tracing::trace!(%event, "Scan event");
        if event.is_change() {
            self.staged.add_change(event.path());
        }
        if let Some(progress) = &self.progress {
            match progress.try_send(event.clone()) {
                Ok(()) => {},
                Err(TrySendError::Full(_)) => {
                    if self.dropped == 0 {
                        tracing::debug!(mount = %self.mount_point.display(), "Progress channel full; dropping events");
                    }
                    self.dropped += 1;
                },
                // Nobody listening any more is not a reason to stop scanning.
                Err(TrySendError::Closed(_)) => {},
            }
        }
        event
    }

    /// Number of progress events the listener was too slow to receive.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// The changes staged so far.
    pub fn staged(&self) -> &ChangeSet {
        &self.staged
    }

    pub fn into_changes(self) -> ChangeSet {
        self.staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::sync::mpsc;

    #[test]
    fn test_forward_translates_and_stages() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut bridge = EventBridge::new("/foo", Some(tx));
        bridge.forward(ScanEvent::ScanFolder(PathBuf::new()));
        bridge.forward(ScanEvent::AddToCache(PathBuf::new()));
        bridge.forward(ScanEvent::AddToCache(PathBuf::from("folder/bar.txt")));
        bridge.forward(ScanEvent::RemoveFromCache(PathBuf::from("gone")));

        assert_eq!(rx.try_recv().unwrap(), ScanEvent::ScanFolder(PathBuf::from("/foo")));
        assert_eq!(rx.try_recv().unwrap(), ScanEvent::AddToCache(PathBuf::from("/foo")));
        assert_eq!(rx.try_recv().unwrap(), ScanEvent::AddToCache(PathBuf::from("/foo/folder/bar.txt")));
        assert_eq!(rx.try_recv().unwrap(), ScanEvent::RemoveFromCache(PathBuf::from("/foo/gone")));

        let changes = bridge.into_changes();
        assert_eq!(changes.len(), 3);
        assert!(changes.contains(Path::new("/foo")));
        assert!(changes.contains(Path::new("/foo/gone")));
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let mut bridge = EventBridge::new("/", Some(tx));
        let event = bridge.forward(ScanEvent::AddToCache(PathBuf::from("foo.txt")));
        assert_eq!(event.path(), Path::new("/foo.txt"));
        assert_eq!(bridge.staged().len(), 1);
        assert_eq!(bridge.dropped(), 0);
    }

    #[test]
    fn test_slow_listener_loses_progress_not_changes() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut bridge = EventBridge::new("/foo", Some(tx));
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            bridge.forward(ScanEvent::AddToCache(PathBuf::from(name)));
        }
        assert_eq!(bridge.dropped(), 2);
        assert_eq!(rx.try_recv().unwrap(), ScanEvent::AddToCache(PathBuf::from("/foo/a.txt")));
        assert_eq!(rx.try_recv().unwrap(), ScanEvent::AddToCache(PathBuf::from("/foo/b.txt")));
        assert!(rx.try_recv().is_err());

        // Room again: later events get through.
        bridge.forward(ScanEvent::AddToCache(PathBuf::from("e.txt")));
        assert_eq!(rx.try_recv().unwrap(), ScanEvent::AddToCache(PathBuf::from("/foo/e.txt")));
        assert_eq!(bridge.staged().len(), 5);
    }

    #[test]
    fn test_no_progress_channel() {
        let mut bridge = EventBridge::new("/foo", None);
        bridge.forward(ScanEvent::ScanFile(PathBuf::from("foo.txt")));
        assert!(bridge.staged().is_empty());
    }
}
