//! Shared slot owning the open capture device.

use parking_lot::Mutex;
use rollcall_core::Frame;
use rollcall_hw::{CameraError, CaptureDevice};
use std::sync::Arc;
use std::time::Duration;

struct Installed {
    session: u64,
    device: Box<dyn CaptureDevice>,
}

/// Holds the device so both the capture thread and `stop()` can release it.
///
/// The device is tagged with the session that opened it; reads and releases
/// from any other session leave it alone. The lock is held for the duration
/// of each read.
#[derive(Clone, Default)]
pub struct DeviceSlot {
    inner: Arc<Mutex<Option<Installed>>>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a freshly opened device for `session`, releasing any leftover one.
    pub fn install(&self, session: u64, device: Box<dyn CaptureDevice>) {
        let previous = self.inner.lock().replace(Installed { session, device });
        if let Some(mut old) = previous {
            tracing::warn!(
                device = %old.device.describe(),
                session = old.session,
                "releasing device left in slot"
            );
            old.device.release();
        }
    }

    pub fn read(&self, session: u64) -> Result<Frame, CameraError> {
        match self.inner.lock().as_mut() {
            Some(installed) if installed.session == session => installed.device.read(),
            Some(_) => Err(CameraError::Disconnected("device owned by a newer session".into())),
            None => Err(CameraError::Disconnected("device released".into())),
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Session that owns the installed device, if any.
    pub fn owner(&self) -> Option<u64> {
        self.inner.lock().as_ref().map(|installed| installed.session)
    }

    /// Release `session`'s device if present. Safe to call repeatedly.
    pub fn release(&self, session: u64) -> bool {
        let mut guard = self.inner.lock();
        let taken = Self::take_for(&mut guard, session);
        drop(guard);
        Self::release_taken(taken)
    }

    /// Release, giving up if a read holds the slot longer than `wait`.
    pub fn force_release(&self, session: u64, wait: Duration) -> bool {
        match self.inner.try_lock_for(wait) {
            Some(mut guard) => {
                let taken = Self::take_for(&mut guard, session);
                drop(guard);
                Self::release_taken(taken)
            }
            None => {
                tracing::warn!(?wait, session, "device still busy in a read; could not force release");
                false
            }
        }
    }

    fn take_for(slot: &mut Option<Installed>, session: u64) -> Option<Installed> {
        match slot {
            Some(installed) if installed.session == session => slot.take(),
            _ => None,
        }
    }

    fn release_taken(taken: Option<Installed>) -> bool {
        match taken {
            Some(mut installed) => {
                installed.device.release();
                tracing::info!(
                    device = %installed.device.describe(),
                    session = installed.session,
                    "capture device released"
                );
                true
            }
            None => false,
        }
    }
}

/// One session's hold on the slot. Releases that session's device when
/// dropped, on every exit path of the capture thread.
pub struct DeviceLease {
    slot: DeviceSlot,
    session: u64,
}

impl DeviceLease {
    pub fn new(slot: DeviceSlot, session: u64) -> Self {
        Self { slot, session }
    }

    pub fn read(&self) -> Result<Frame, CameraError> {
        self.slot.read(self.session)
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.slot.release(self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDevice {
        releases: Arc<AtomicUsize>,
    }

    impl CaptureDevice for CountingDevice {
        fn read(&mut self) -> Result<Frame, CameraError> {
            Err(CameraError::Transient("no frame".into()))
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    fn slot_with_device() -> (DeviceSlot, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let slot = DeviceSlot::new();
        slot.install(
            1,
            Box::new(CountingDevice {
                releases: Arc::clone(&releases),
            }),
        );
        (slot, releases)
    }

    #[test]
    fn test_release_is_idempotent() {
        let (slot, releases) = slot_with_device();
        assert!(slot.release(1));
        assert!(!slot.release(1));
        assert!(!slot.force_release(1, Duration::from_millis(10)));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(matches!(slot.read(1), Err(CameraError::Disconnected(_))));
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let (slot, releases) = slot_with_device();
        {
            let lease = DeviceLease::new(slot.clone(), 1);
            assert!(lease.read().unwrap_err().is_transient());
        }
        assert!(!slot.is_occupied());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_release_times_out_while_held() {
        let (slot, releases) = slot_with_device();
        let guard = slot.inner.lock();
        let other = slot.clone();
        let released = std::thread::spawn(move || other.force_release(1, Duration::from_millis(20)))
            .join()
            .unwrap();
        drop(guard);
        assert!(!released);
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        assert!(slot.force_release(1, Duration::from_millis(20)));
    }

    #[test]
    fn test_stale_session_leaves_newer_device_alone() {
        let (slot, first) = slot_with_device();
        let stale = DeviceLease::new(slot.clone(), 1);
        assert!(slot.force_release(1, Duration::from_millis(10)));

        let second = Arc::new(AtomicUsize::new(0));
        slot.install(
            2,
            Box::new(CountingDevice {
                releases: Arc::clone(&second),
            }),
        );
        assert!(matches!(stale.read(), Err(CameraError::Disconnected(_))));
        drop(stale);
        assert!(!slot.release(1));

        assert_eq!(slot.owner(), Some(2));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert!(slot.read(2).unwrap_err().is_transient());
    }
}
