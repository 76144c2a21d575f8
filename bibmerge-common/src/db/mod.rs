//! Database initialization, migrations and row models

pub mod init;
pub mod migrations;
pub mod models;
pub mod properties;
pub mod schema_contract;

pub use init::*;
pub use migrations::*;
pub use models::*;
pub use properties::*;
pub use schema_contract::*;
