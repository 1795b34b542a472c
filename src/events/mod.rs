pub mod member;

pub use member::{handle_member_add, handle_member_remove, handle_member_update};
