pub mod bypass_registry;
pub mod pending_store;
pub mod ticket_store;

pub use bypass_registry::{create_shared_bypass_registry, BypassRegistry, SharedBypassRegistry};
pub use pending_store::{create_shared_pending_store, PendingStore, PendingUser, SharedPendingStore};
pub use ticket_store::{create_shared_ticket_store, SharedTicketStore, TicketRecord, TicketStore};
