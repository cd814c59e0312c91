pub mod duckdb_engine;
