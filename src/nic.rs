//! Per-process RDMA device handle.

use rrddmma::prelude::*;

/// The opened device, its first active port, and the process-wide protection
/// domain.
///
/// Memory and compute roles of one process share this PD. Sharing is what
/// lets a co-located compute node drive loopback QPs against segments the
/// memory role registered: an rkey is only valid against the PD that
/// registered the memory.
pub struct Rnic {
    nic: Nic,
    pd: Pd,
}

impl Rnic {
    /// Open a device by name. Fatal when the device or an active port is
    /// missing.
    pub fn open(dev: &str) -> Self {
        let nic = Nic::finder()
            .dev_name(dev)
            .probe()
            .expect("cannot find or open device");
        assert!(!nic.ports.is_empty(), "device {dev} has no active port");
        let pd = Pd::new(&nic.context).expect("cannot create PD");
        Self { nic, pd }
    }

    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    pub fn port(&self) -> &Port {
        &self.nic.ports[0]
    }
}
