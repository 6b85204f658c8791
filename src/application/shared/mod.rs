pub(crate) mod mappers;
pub mod subscriptions;

pub use subscriptions::SubscriptionRegistry;
