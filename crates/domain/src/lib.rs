pub mod entities;
pub mod errors;
pub mod protocol;
pub mod repositories;
pub mod services;
pub mod settings;

pub use entities::*;
pub use errors::*;
pub use repositories::*;
pub use services::*;
pub use settings::EngineSettings;
