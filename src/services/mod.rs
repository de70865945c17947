pub mod cdn;
pub mod chunks;
pub mod dbwriter;
pub mod deleter;
pub mod idstore;
pub mod ingest;
pub mod query;
pub mod retention;
pub mod scanner;
pub mod stats;
pub mod sweeper;
pub mod thumbs;
pub mod url_fetch;
pub mod zipper;
