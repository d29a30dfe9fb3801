pub mod types;
pub mod loader;
pub mod validator;
pub mod resolved;
pub mod settings;
pub mod topology;

pub use types::*;
pub use loader::*;
pub use validator::*;
pub use resolved::*;
pub use settings::Settings;
pub use topology::TableTopology;
