pub mod barrier;
pub mod op;
pub mod reconcile;
pub mod render_pass;
pub mod stream;
pub mod transfer;

pub use op::*;
pub use reconcile::{forget_states, reconcile, transition_for_present};
pub use render_pass::MAX_COLOR_TARGETS;
pub use stream::{CommandStream, StreamState, TimestampMark, Touch};
