pub mod player;
pub mod protocol;
pub mod session;
