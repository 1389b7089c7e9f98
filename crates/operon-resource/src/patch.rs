//! The unit of work produced by comparing current and desired state.

/// Up to three independent changes computed for one reconciliation pass.
///
/// An unset change means the corresponding `apply_*` call is skipped, so
/// `Patch::default()` performs no side effects at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch<C> {
    create: Option<C>,
    delete: Option<C>,
    update: Option<C>,
}

// Derived Default would require `C: Default`.
impl<C> Default for Patch<C> {
    fn default() -> Self {
        Self {
            create: None,
            delete: None,
            update: None,
        }
    }
}

impl<C> Patch<C> {
    /// Set the change applied through `apply_create_change`
    pub fn with_create_change(mut self, change: C) -> Self {
        self.create = Some(change);
        self
    }

    /// Set the change applied through `apply_delete_change`
    pub fn with_delete_change(mut self, change: C) -> Self {
        self.delete = Some(change);
        self
    }

    /// Set the change applied through `apply_update_change`
    pub fn with_update_change(mut self, change: C) -> Self {
        self.update = Some(change);
        self
    }

    /// Pending create change
    pub fn create_change(&self) -> Option<&C> {
        self.create.as_ref()
    }

    /// Pending delete change
    pub fn delete_change(&self) -> Option<&C> {
        self.delete.as_ref()
    }

    /// Pending update change
    pub fn update_change(&self) -> Option<&C> {
        self.update.as_ref()
    }

    /// True when no change is set
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.delete.is_none() && self.update.is_none()
    }

    /// Convert every set change, keeping unset ones unset
    pub fn map<D>(self, mut f: impl FnMut(C) -> D) -> Patch<D> {
        Patch {
            create: self.create.map(&mut f),
            delete: self.delete.map(&mut f),
            update: self.update.map(&mut f),
        }
    }

    pub(crate) fn into_parts(self) -> (Option<C>, Option<C>, Option<C>) {
        (self.create, self.delete, self.update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_patch_is_empty() {
        let patch: Patch<u32> = Patch::default();
        assert!(patch.is_empty());
        assert_eq!(patch.create_change(), None);
        assert_eq!(patch.delete_change(), None);
        assert_eq!(patch.update_change(), None);
    }

    #[test]
    fn test_changes_are_independent() {
        let patch = Patch::default().with_delete_change("detach");
        assert!(!patch.is_empty());
        assert_eq!(patch.create_change(), None);
        assert_eq!(patch.delete_change(), Some(&"detach"));
        assert_eq!(patch.update_change(), None);
    }

    #[test]
    fn test_map_keeps_unset_changes_unset() {
        let patch = Patch::default()
            .with_create_change(1)
            .with_update_change(3)
            .map(|n| n * 10);
        assert_eq!(patch.create_change(), Some(&10));
        assert_eq!(patch.delete_change(), None);
        assert_eq!(patch.update_change(), Some(&30));
    }
}
