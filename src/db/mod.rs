pub mod backend;
pub mod db_pool;
pub mod schema_manager;
