//! Mapping between the local ticker domain and the leader's

use std::sync::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no clock offset has been negotiated yet")]
    Unsynced,
}

/// A signed correction mapping local ticker nanoseconds into the leader's
/// domain, `leader_ns ~= local_ns + offset_ns`, along with an upper bound on
/// how wrong that mapping can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    pub offset_ns: i64,
    pub error_bound_ns: u64,
}

impl Offset {
    /// The leader maps into its own domain, so its offset is always identity
    pub const IDENTITY: Self = Self {
        offset_ns: 0,
        error_bound_ns: 0,
    };
}

/// Holds the currently installed [`Offset`] and performs domain conversion.
///
/// Installs are total-ordered, latest wins, and readers always observe the
/// `(offset, error_bound)` pair from a single install. No interpolation
/// happens across installs, a new offset applies immediately.
#[derive(Debug)]
pub struct ClockMap {
    current: Mutex<Option<Offset>>,
}

impl ClockMap {
    /// A client map, starts with no offset until the leader negotiates one
    pub fn unset() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// The leader's map, permanently the identity
    pub fn identity() -> Self {
        Self {
            current: Mutex::new(Some(Offset::IDENTITY)),
        }
    }

    pub fn install(&self, offset: Offset) {
        *self.current.lock().unwrap() = Some(offset);
    }

    pub fn current(&self) -> Option<Offset> {
        *self.current.lock().unwrap()
    }

    pub fn is_synced(&self) -> bool {
        self.current().is_some()
    }

    /// Translate a local ticker timestamp into the leader's domain
    pub fn leader_of(&self, local_ns: u64) -> Result<u64, Error> {
        let offset = self.current().ok_or(Error::Unsynced)?;
        Ok((local_ns as i128 + offset.offset_ns as i128) as u64)
    }

    /// Translate a leader-domain timestamp into the local ticker domain
    pub fn local_of(&self, leader_ns: u64) -> Result<u64, Error> {
        let offset = self.current().ok_or(Error::Unsynced)?;
        Ok((leader_ns as i128 - offset.offset_ns as i128) as u64)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn conversion_requires_an_install() {
        let map = ClockMap::unset();
        assert!(map.leader_of(100).is_err());
        assert!(map.local_of(100).is_err());
        assert!(!map.is_synced());
    }

    #[test]
    fn identity_is_synced() {
        let map = ClockMap::identity();
        assert_eq!(map.leader_of(12345).unwrap(), 12345);
        assert_eq!(map.current().unwrap().error_bound_ns, 0);
    }

    #[test]
    fn round_trip_is_exact() {
        // local_of(leader_of(x)) == x for positive and negative offsets
        for offset_ns in [999_950i64, -999_950, 0, i64::from(i32::MAX)] {
            let map = ClockMap::unset();
            map.install(Offset {
                offset_ns,
                error_bound_ns: 50,
            });
            for x in [0u64, 1_000_000, u64::from(u32::MAX)] {
                assert_eq!(map.local_of(map.leader_of(x).unwrap()).unwrap(), x);
            }
        }
    }

    #[test]
    fn latest_install_wins() {
        let map = ClockMap::unset();
        map.install(Offset {
            offset_ns: 10,
            error_bound_ns: 5,
        });
        map.install(Offset {
            offset_ns: -20,
            error_bound_ns: 80,
        });
        assert_eq!(
            map.current().unwrap(),
            Offset {
                offset_ns: -20,
                error_bound_ns: 80
            }
        );
    }
}
