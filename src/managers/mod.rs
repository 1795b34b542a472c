pub mod booking;
pub mod permission_checker;
pub mod reconciler;
pub mod role_manager;
pub mod ticket_manager;
pub mod verification;

pub use booking::BookingChecker;
pub use role_manager::{RoleChangeActor, RoleManager};
pub use ticket_manager::TicketManager;
pub use verification::VerificationManager;
