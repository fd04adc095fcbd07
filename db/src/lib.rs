#[macro_use]
extern crate diesel;

pub mod api;
pub mod message;
pub mod models;
pub mod schema;
