//! Names of the calls decorators observe.

use std::fmt;

/// A decorated call, used as the `operation` metric label and log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `CrudResourceOps::get_current_state`
    GetCurrentState,
    /// `CrudResourceOps::get_desired_state`
    GetDesiredState,
    /// `CrudResourceOps::new_update_patch`
    NewUpdatePatch,
    /// `CrudResourceOps::new_delete_patch`
    NewDeletePatch,
    /// `CrudResourceOps::apply_create_change`
    ApplyCreateChange,
    /// `CrudResourceOps::apply_delete_change`
    ApplyDeleteChange,
    /// `CrudResourceOps::apply_update_change`
    ApplyUpdateChange,
    /// `BasicResource::ensure_created`
    EnsureCreated,
    /// `BasicResource::ensure_deleted`
    EnsureDeleted,
}

impl Operation {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetCurrentState => "get_current_state",
            Self::GetDesiredState => "get_desired_state",
            Self::NewUpdatePatch => "new_update_patch",
            Self::NewDeletePatch => "new_delete_patch",
            Self::ApplyCreateChange => "apply_create_change",
            Self::ApplyDeleteChange => "apply_delete_change",
            Self::ApplyUpdateChange => "apply_update_change",
            Self::EnsureCreated => "ensure_created",
            Self::EnsureDeleted => "ensure_deleted",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
