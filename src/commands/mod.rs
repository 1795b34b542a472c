pub mod bypass;
pub mod debug;
pub mod general;
pub mod guard;
pub mod verification;

pub use bypass::{bypass_add, bypass_list, bypass_remove};
pub use debug::debug_logs;
pub use general::{help, ping};
pub use verification::{
    check_pending, check_stored_roles, cleanup_tracking, force_verify, start_verification, verify,
    verification_stats,
};
