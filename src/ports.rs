use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// PortArena — UDP port allocator for plain-RTP forks
// ---------------------------------------------------------------------------

/// A finite pool of UDP ports for one fork sink kind.
///
/// The recording and transcription arenas are constructed over disjoint
/// ranges and each carries its own mutex, so a recording burst can never
/// starve transcription forks (or vice versa).
pub struct PortArena {
    range: (u16, u16),
    free: Mutex<BTreeSet<u16>>,
}

/// A port (or rtcp pair) leased from an arena.
///
/// Leases are returned explicitly via [`PortArena::release`]; the fork
/// teardown path owns that call so release stays idempotent alongside the
/// rest of the teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub rtp: u16,
    /// `Some(rtp + 1)` when the fork was allocated with rtcp-mux disabled.
    pub rtcp: Option<u16>,
}

impl PortArena {
    pub fn new(min: u16, max: u16) -> Self {
        assert!(min <= max, "invalid port range {min}-{max}");
        Self {
            range: (min, max),
            free: Mutex::new((min..=max).collect()),
        }
    }

    /// Lease the first free port. With `rtcp_mux = false` the next port up
    /// is reserved too (RTP on even, RTCP on odd is the converter's
    /// expectation), and both must be free.
    pub fn allocate(&self, rtcp_mux: bool) -> CoreResult<PortLease> {
        let mut free = self.free.lock().unwrap();

        if rtcp_mux {
            if let Some(&port) = free.iter().next() {
                free.remove(&port);
                return Ok(PortLease { rtp: port, rtcp: None });
            }
        } else {
            let candidates: Vec<u16> = free.iter().copied().collect();
            for port in candidates {
                if port < self.range.1 && free.contains(&(port + 1)) {
                    free.remove(&port);
                    free.remove(&(port + 1));
                    return Ok(PortLease {
                        rtp: port,
                        rtcp: Some(port + 1),
                    });
                }
            }
        }

        Err(CoreError::ports_exhausted(self.range))
    }

    /// Return a lease to the pool. Ports outside the configured range are
    /// ignored; double-release is a no-op.
    pub fn release(&self, lease: PortLease) {
        let mut free = self.free.lock().unwrap();
        for port in std::iter::once(lease.rtp).chain(lease.rtcp) {
            if port >= self.range.0 && port <= self.range.1 {
                free.insert(port);
            }
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn range(&self) -> (u16, u16) {
        self.range
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
