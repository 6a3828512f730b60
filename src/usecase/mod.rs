pub mod feed;
pub mod identity;
