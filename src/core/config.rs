use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,                     // <db>.db files are discovered and written here

    // Table defaults
    pub default_primary_key: String,
    pub default_partitions: usize,

    // Persistence
    pub save_batch_size: usize,                // Rows per INSERT batch on save
    pub load_page_size: usize,                 // Rows per SELECT page on load
    pub autosave: bool,                        // Queue a save after every mutation
    pub load_on_open: bool,                    // Replay every *.db in data_dir on open

    // Indexing / querying
    pub auto_index_dimensions: bool,           // Inserted fields get an inverted index
    pub query_cache_size: usize,               // 0 disables the result cache
}

impl Config {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Config {
            data_dir: data_dir.into(),
            ..Config::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),

            default_primary_key: "id".to_string(),
            default_partitions: 10,

            save_batch_size: 1000,
            load_page_size: 1000,
            autosave: true,
            load_on_open: true,

            auto_index_dimensions: true,
            query_cache_size: 5000,
        }
    }
}
