pub mod channel;
pub mod gateway;
pub mod guild;
pub mod intents;
pub mod member;
pub mod message;
pub mod permissions;
pub mod presence;
pub mod role;
pub mod user;
