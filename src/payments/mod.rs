pub mod bkash;
pub mod exchange;
pub mod stripe;
