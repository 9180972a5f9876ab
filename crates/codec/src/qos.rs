use bitflags::bitflags;

bitflags! {
    /// QoS bits carried in the per-request byte of GET/PUT/PUT_GET/MONITOR/
    /// ARRAY/PROCESS/RPC frames (spec.md §4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QosFlags: u8 {
        /// Establish the IOID binding; first request of an operation's life.
        const INIT     = 0b0000_0001;
        /// Tear down after this request; last request of an operation's life.
        const DESTROY  = 0b0000_0010;
        /// Read direction (Get semantics).
        const GET      = 0b0000_0100;
        /// In PutGet: request the put-side structure. In Array: set-length.
        const GET_PUT  = 0b0000_1000;
        /// Couple the request with server-side record processing.
        const PROCESS  = 0b0001_0000;
    }
}

impl QosFlags {
    /// Plain GET/PUT with no init/destroy/process coupling.
    pub const DEFAULT: QosFlags = QosFlags::empty();

    /// Monitor start: `PROCESS|GET`.
    pub const MONITOR_START: QosFlags = QosFlags::PROCESS.union(QosFlags::GET);

    /// Monitor stop: `PROCESS` alone.
    pub const MONITOR_STOP: QosFlags = QosFlags::PROCESS;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinations_match_spec() {
        assert_eq!(QosFlags::MONITOR_START.bits(), 0b0001_0100);
        assert_eq!(QosFlags::MONITOR_STOP.bits(), 0b0001_0000);
        assert!((QosFlags::INIT | QosFlags::GET).contains(QosFlags::INIT));
    }

    #[test]
    fn round_trips_through_a_byte() {
        let flags = QosFlags::DESTROY | QosFlags::GET;
        let byte = flags.bits();
        assert_eq!(QosFlags::from_bits_truncate(byte), flags);
    }
}
