pub mod engine;
pub mod fields;
pub mod lease;
pub mod load_sql;
pub mod records;
pub mod session;
pub mod settings;
