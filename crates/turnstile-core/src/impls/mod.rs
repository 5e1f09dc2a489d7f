//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: プロセス内のみ（デフォルト）
//! - **JsonFileTaskStore**: JSON ドキュメント 1 つ、再起動・複数プロセスで共有可

pub mod file_store;
pub mod inmem_store;

pub use self::file_store::JsonFileTaskStore;
pub use self::inmem_store::InMemoryTaskStore;
