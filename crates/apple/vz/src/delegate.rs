//! Receives the framework's asynchronous stop notifications.

use objc2::rc::Retained;
use objc2::{DefinedClass, MainThreadMarker, MainThreadOnly, define_class};
use objc2_foundation::{NSError, NSObject, NSObjectProtocol};
use objc2_virtualization::{VZVirtualMachine, VZVirtualMachineDelegate};
use std::cell::Cell;
use std::sync::mpsc::{Receiver, SyncSender};

use burrow_core::ExitStatus;

pub type StopSender = SyncSender<StopReason>;
pub type StopReceiver = Receiver<StopReason>;

/// Why a booted VM went away. Only the first reason sent is ever observed;
/// the channel holds one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    GuestStopped,
    Error(String),
    Killed,
}

impl From<StopReason> for ExitStatus {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::GuestStopped => ExitStatus::Clean,
            StopReason::Error(msg) => ExitStatus::Failed(msg),
            StopReason::Killed => ExitStatus::Failed("killed".to_string()),
        }
    }
}

pub struct VmStateDelegateIvars {
    stop_sender: Cell<Option<StopSender>>,
}

define_class!(
    // SAFETY:
    // - NSObject has no subclassing requirements
    // - We don't implement Drop
    #[unsafe(super(NSObject))]
    #[thread_kind = MainThreadOnly]
    #[ivars = VmStateDelegateIvars]
    pub struct VmStateDelegate;

    unsafe impl NSObjectProtocol for VmStateDelegate {}

    unsafe impl VZVirtualMachineDelegate for VmStateDelegate {
        #[unsafe(method(guestDidStopVirtualMachine:))]
        fn guest_did_stop(&self, _vm: &VZVirtualMachine) {
            self.report(StopReason::GuestStopped);
        }

        #[unsafe(method(virtualMachine:didStopWithError:))]
        fn vm_did_stop_with_error(&self, _vm: &VZVirtualMachine, error: &NSError) {
            self.report(StopReason::Error(error.localizedDescription().to_string()));
        }
    }
);

impl VmStateDelegate {
    pub fn new(mtm: MainThreadMarker, stop_sender: StopSender) -> Retained<Self> {
        let this = Self::alloc(mtm);
        let this = this.set_ivars(VmStateDelegateIvars {
            stop_sender: Cell::new(Some(stop_sender)),
        });
        // SAFETY: Calling init on a freshly allocated NSObject subclass
        unsafe { objc2::msg_send![super(this), init] }
    }

    fn report(&self, reason: StopReason) {
        if let Some(sender) = self.ivars().stop_sender.take() {
            tracing::debug!("VZ delegate: {:?}", reason);
            let _ = sender.try_send(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reason_wins() {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        tx.try_send(StopReason::GuestStopped).unwrap();
        assert!(tx.try_send(StopReason::Killed).is_err());
        assert_eq!(rx.recv().unwrap(), StopReason::GuestStopped);
    }

    #[test]
    fn reasons_map_to_exit_status() {
        assert_eq!(ExitStatus::from(StopReason::GuestStopped), ExitStatus::Clean);
        assert_eq!(
            ExitStatus::from(StopReason::Error("internal error".to_string())),
            ExitStatus::Failed("internal error".to_string())
        );
        assert!(!ExitStatus::from(StopReason::Killed).is_clean());
    }

    #[test]
    fn disconnected_channel_is_detected() {
        let (tx, rx) = std::sync::mpsc::sync_channel::<StopReason>(1);
        drop(tx);
        assert!(rx.recv().is_err());
    }
}
