//! App - アプリケーション層
//!
//! ports を組み合わせて、受付から task 完了までを実装します。
//!
//! # 主要コンポーネント
//! - **AdmissionRegistry**: ルートごとのポリシー・カウンタと drain フラグ
//! - **Dispatcher**: sync / async の実行と task のライフサイクル
//! - **ApiServiceBuilder / ApiService**: ルート登録と axum ルーター
//! - **shutdown**: シグナル → drain → in-flight ゼロ待ち

pub mod admission;
pub mod builder;
pub mod counter;
pub mod dispatcher;
pub mod handler;
pub mod service;
pub mod shutdown;

// 主要な型を再エクスポート
pub use self::admission::{Admission, AdmissionRegistry, DrainFlag};
pub use self::builder::{ApiServiceBuilder, BuildError};
pub use self::counter::{InFlightCounter, InFlightPermit};
pub use self::dispatcher::{DispatchError, DispatchOutcome, Dispatcher, Job, TaskContext};
pub use self::handler::{
    AsyncHandler, Extract, InboundRequest, JsonBody, PathParams, RawBody, Reply, RouteHandler,
    SyncHandler,
};
pub use self::service::{ApiError, ApiService};
