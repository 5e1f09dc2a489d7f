//! Ports - 抽象化レイヤー
//!
//! 外部の永続化・時刻・ID 生成へのインターフェース。実装は `impls` に置く。

pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::TaskStore;
