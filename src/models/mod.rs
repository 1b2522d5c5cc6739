pub mod audit;
pub mod bkash;
pub mod chats;
pub mod documents;
pub mod messages;
pub mod referrals;
pub mod schema;
pub mod users;
