/// Severity attached to every `ErrorKind`, surfaced to application callbacks
/// alongside the kind (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

/// Error kinds surfaced to application callbacks (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RequestNotInitialized,
    RequestDestroyed,
    ChannelNotConnected,
    ChannelDestroyed,
    ChannelDisconnected,
    OtherRequestPending,
    PvRequestNull,
    StrideNotSupported,
    NotImplemented,
}

impl ErrorKind {
    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::ChannelDestroyed | ErrorKind::ChannelDisconnected => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ErrorKind::RequestNotInitialized => "request not initialized",
            ErrorKind::RequestDestroyed => "request destroyed",
            ErrorKind::ChannelNotConnected => "channel not connected",
            ErrorKind::ChannelDestroyed => "channel destroyed",
            ErrorKind::ChannelDisconnected => "channel disconnected",
            ErrorKind::OtherRequestPending => "other request pending",
            ErrorKind::PvRequestNull => "pvRequest is null",
            ErrorKind::StrideNotSupported => "stride not supported",
            ErrorKind::NotImplemented => "not implemented",
        };

        write!(f, "{msg}")
    }
}

impl std::error::Error for ErrorKind {}

/// A status reported to a requester callback: either success, or a failure
/// carrying an `ErrorKind` and a free-form server/local message.
#[derive(Debug, Clone)]
pub struct Status {
    pub severity: Severity,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            severity: Severity::Ok,
            message: String::new(),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            severity: kind.severity(),
            message: kind.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    /// Wire layout: one severity byte (0=ok, 1=warning, 2=error) followed by
    /// a length-prefixed message, present only for non-ok severities. Real
    /// status codes (sub-codes, call stacks) are the introspection
    /// library's concern (spec.md §1); this is the minimal shape needed to
    /// drive the client engine's own dispatch.
    pub fn serialize(&self, w: &mut codec::PayloadWriter) {
        let tag = match self.severity {
            Severity::Ok => 0u8,
            Severity::Warning => 1,
            Severity::Error => 2,
        };
        w.write_u8(tag);
        if tag != 0 {
            w.write_string(&self.message);
        }
    }

    pub fn deserialize(r: &mut codec::PayloadReader) -> Result<Self, codec::Error> {
        let severity = match r.read_u8()? {
            0 => Severity::Ok,
            1 => Severity::Warning,
            _ => Severity::Error,
        };
        let message = if severity == Severity::Ok {
            String::new()
        } else {
            r.read_string()?.to_string()
        };
        Ok(Self { severity, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_destroyed_is_a_warning() {
        assert_eq!(ErrorKind::ChannelDestroyed.severity(), Severity::Warning);
        assert_eq!(ErrorKind::OtherRequestPending.severity(), Severity::Error);
    }

    #[test]
    fn status_round_trips_through_wire() {
        let status = Status::from_kind(ErrorKind::ChannelNotConnected);
        let mut w = codec::PayloadWriter::new(codec::header::ByteOrder::Big);
        status.serialize(&mut w);
        let bytes = w.into_inner();
        let mut r = codec::PayloadReader::new(&bytes, codec::header::ByteOrder::Big);
        let decoded = Status::deserialize(&mut r).unwrap();
        assert_eq!(decoded.severity, status.severity);
        assert_eq!(decoded.message, status.message);
    }

    #[test]
    fn ok_status_round_trips_without_a_message() {
        let status = Status::ok();
        let mut w = codec::PayloadWriter::new(codec::header::ByteOrder::Big);
        status.serialize(&mut w);
        let bytes = w.into_inner();
        let mut r = codec::PayloadReader::new(&bytes, codec::header::ByteOrder::Big);
        let decoded = Status::deserialize(&mut r).unwrap();
        assert!(decoded.is_ok());
    }
}
