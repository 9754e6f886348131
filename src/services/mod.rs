pub mod fanout;
pub mod membership;
pub mod store;

pub use fanout::FanoutCoordinator;
pub use membership::MembershipResolver;
pub use store::DeliveryStore;
