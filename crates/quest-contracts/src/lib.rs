pub mod events;
pub mod migration;
pub mod paths;
pub mod results;
pub mod settings;
