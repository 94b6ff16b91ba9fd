//! Type definitions for the cidc ledger.

mod files;
mod ids;
mod permissions;
mod roles;
mod users;

// Re-export all types from submodules
pub use files::*;
pub use ids::*;
pub use permissions::*;
pub use roles::*;
pub use users::*;
