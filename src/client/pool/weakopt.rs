use std::fmt;
use std::sync::{Arc, Weak};

use crate::DebugLiteral;

/// A weak back-reference to a pool.
///
/// Call relays point back at their pool through one of these, so a
/// connection never keeps its pool alive.
pub(crate) struct WeakOpt<T>(Weak<T>);

impl<T> WeakOpt<T> {
    pub(crate) fn downgrade(arc: &Arc<T>) -> Self {
        Self(Arc::downgrade(arc))
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        self.0.upgrade()
    }
}

impl<T> Clone for WeakOpt<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for WeakOpt<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.strong_count() > 0 {
            "live"
        } else {
            "dropped"
        };
        f.debug_tuple("WeakOpt").field(&DebugLiteral(state)).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn weak_opt() {
        let arc = Arc::new(());
        let weak = WeakOpt::downgrade(&arc);
        assert!(weak.upgrade().is_some());
        assert_eq!(format!("{weak:?}"), "WeakOpt(live)");

        drop(arc);
        assert!(weak.upgrade().is_none());
        assert_eq!(format!("{weak:?}"), "WeakOpt(dropped)");
    }
}
