pub mod catalog;
pub mod promotions;
