pub mod error_behavior;
pub mod resolvable;
pub mod shape;

pub use error_behavior::ErrorBehavior;
pub use resolvable::{render_object, resolve, ResolveOptions, ResolvedResponse};
