pub mod decoder;
pub mod models;
pub mod registry;
pub mod settings;
