use crate::freshness::Freshness;

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    Fresh(V),
    /// Served from cache; a background refresh was requested.
    Stale {
        value: V,
        /// `false` when a refresh for the key was already outstanding, the scheduler is
        /// shutting down, or no refresh source is configured.
        refresh_enqueued: bool,
    },
    /// Absent, unreadable or EXPIRED.
    Miss,
}

impl<V> CacheLookup<V> {
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheLookup::Miss)
    }

    pub fn freshness(&self) -> Option<Freshness> {
        match self {
            CacheLookup::Fresh(_) => Some(Freshness::Fresh),
            CacheLookup::Stale { .. } => Some(Freshness::Stale),
            CacheLookup::Miss => None,
        }
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            CacheLookup::Fresh(v) | CacheLookup::Stale { value: v, .. } => Some(v),
            CacheLookup::Miss => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            CacheLookup::Fresh(v) | CacheLookup::Stale { value: v, .. } => Some(v),
            CacheLookup::Miss => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let stale = CacheLookup::Stale {
            value: 7,
            refresh_enqueued: true,
        };
        assert!(stale.is_hit());
        assert_eq!(stale.freshness(), Some(Freshness::Stale));
        assert_eq!(stale.value(), Some(&7));
        assert_eq!(CacheLookup::Fresh(1).into_value(), Some(1));
        assert_eq!(CacheLookup::<u8>::Miss.into_value(), None);
        assert!(!CacheLookup::<u8>::Miss.is_hit());
    }
}
