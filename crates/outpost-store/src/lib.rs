pub mod error;
pub mod events;
pub mod persist;
pub mod store;

pub use error::StoreError;
pub use events::{StoreEvent, Subscriber};
pub use persist::PersistedState;
pub use store::Store;
