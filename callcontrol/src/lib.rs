pub mod address;
pub mod channel;
pub mod event;
pub mod external_media;
pub mod groupcall;
#[cfg(test)]
mod mock;
pub mod recording;
pub mod server;
