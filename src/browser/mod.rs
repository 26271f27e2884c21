pub mod adapter;
pub mod auth;
pub mod behavior;
pub mod company;
pub mod profile;
pub mod session;
