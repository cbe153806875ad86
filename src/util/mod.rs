pub mod logging;
pub mod mailer;
pub mod render;
pub mod state_store;
