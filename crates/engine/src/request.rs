//! Request base: the init/destroy/normal response state machine shared by
//! every data operation (spec.md §4.7).

use parking_lot::Mutex;

use crate::error::{ErrorKind, Status};
use crate::ids::Ioid;

/// `pendingRequest`: either nothing scheduled, a pure-cancel frame, or a
/// QoS bitmask describing the next command byte (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
    Null,
    PureDestroy,
    Qos(codec::QosFlags),
}

impl PendingRequest {
    pub fn is_null(self) -> bool {
        matches!(self, PendingRequest::Null)
    }
}

#[derive(Default)]
struct RequestFlags {
    initialized: bool,
    destroyed: bool,
    subscribed: bool,
}

/// Shared request-lifecycle state (spec.md §3 Operation invariants, §4.7).
///
/// Owned by composition inside each concrete operation (`Get`, `Put`, ...).
/// All mutation goes through the per-operation mutex, matching lock domain
/// 1 of spec.md §5.
pub struct RequestCore {
    pub ioid: Ioid,
    flags: Mutex<RequestFlags>,
    pending: Mutex<PendingRequest>,
}

impl RequestCore {
    pub fn new(ioid: Ioid) -> Self {
        Self {
            ioid,
            flags: Mutex::new(RequestFlags::default()),
            pending: Mutex::new(PendingRequest::Null),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.flags.lock().initialized
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags.lock().destroyed
    }

    pub fn is_subscribed(&self) -> bool {
        self.flags.lock().subscribed
    }

    pub fn set_subscribed(&self, value: bool) {
        self.flags.lock().subscribed = value;
    }

    /// `start-request(qos)`: sets pending iff currently NULL or the new qos
    /// is PURE_DESTROY; otherwise rejects with `other-request-pending`
    /// (spec.md §3 invariants, §4.7).
    pub fn start_request(&self, next: PendingRequest) -> Result<(), ErrorKind> {
        let mut pending = self.pending.lock();
        if pending.is_null() || matches!(next, PendingRequest::PureDestroy) {
            *pending = next;
            Ok(())
        } else {
            Err(ErrorKind::OtherRequestPending)
        }
    }

    /// Consume the scheduled request, returning it and resetting to NULL.
    /// Called by the transport's sender just before serializing.
    pub fn take_pending(&self) -> PendingRequest {
        std::mem::replace(&mut *self.pending.lock(), PendingRequest::Null)
    }

    pub fn peek_pending(&self) -> PendingRequest {
        *self.pending.lock()
    }

    /// Classify an inbound response's QoS byte per spec.md §4.7: INIT,
    /// DESTROY, or a normal response, updating `initialized` as a side
    /// effect of a successful init/destroy.
    pub fn classify_response(&self, qos: codec::QosFlags, ok: bool) -> ResponseKind {
        if qos.contains(codec::QosFlags::INIT) {
            if ok {
                self.flags.lock().initialized = true;
            }
            ResponseKind::Init
        } else if qos.contains(codec::QosFlags::DESTROY) {
            self.flags.lock().initialized = false;
            ResponseKind::Destroy
        } else {
            ResponseKind::Normal
        }
    }

    /// `destroy(create-failed?)`: idempotent. Returns true the first time
    /// it transitions to destroyed (the caller should then, if
    /// `initialized` and not a create-failure, schedule a PURE_DESTROY
    /// send) (spec.md §4.7).
    pub fn begin_destroy(&self, create_failed: bool) -> bool {
        let mut flags = self.flags.lock();
        if flags.destroyed {
            return false;
        }

        let should_send_cancel = flags.initialized && !create_failed;
        flags.destroyed = true;
        flags.initialized = false;
        drop(flags);

        if should_send_cancel {
            *self.pending.lock() = PendingRequest::PureDestroy;
        }

        true
    }

    /// `report-status(s)`: channel-disconnected clears subscribed and
    /// resets pending to NULL; channel-destroyed is handled by the caller
    /// invoking `begin_destroy` (spec.md §4.7).
    pub fn on_disconnected(&self) {
        let mut flags = self.flags.lock();
        flags.subscribed = false;
        drop(flags);
        *self.pending.lock() = PendingRequest::Null;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Init,
    Normal,
    Destroy,
}

/// Helper used by operations to turn a wire status byte into `Status`.
/// Real status decoding (message text, sub-codes) is the introspection
/// library's concern upstream of this; operations call this once they've
/// read the status flag off the payload.
pub fn status_from_ok(ok: bool, fail_kind: ErrorKind) -> Status {
    if ok {
        Status::ok()
    } else {
        Status::from_kind(fail_kind)
    }
}
