pub mod partitioned_table;
pub mod table_lock;
pub mod layout;
pub mod sqlite_store;
pub mod save_queue;
