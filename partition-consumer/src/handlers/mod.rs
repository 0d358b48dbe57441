pub mod users;

pub use users::UserEventHandler;
