pub mod batch_applier;
pub mod changelog;
pub mod config;
pub mod context;
pub mod dwings;
pub mod entity;
pub mod error;
pub mod events;
pub mod gate;
pub mod lock;
pub mod pull;
pub mod push;
pub mod rules;
pub mod snapshot;
pub mod sync;
pub mod value;
pub mod watermark;

pub use batch_applier::{BatchApplier, ImportRunStats};
pub use changelog::{ChangeLogEntry, ChangeLogStore, OperationKind};
pub use config::{CountryPaths, MapParamTable, ParamTable, ServiceConfig};
pub use context::{CountryHandle, ServiceContext};
pub use dwings::InvoiceCandidate;
pub use entity::{Entity, SchemaCache, TableSchema};
pub use error::{Result, SyncError};
pub use events::{SyncState, SyncStateChanged};
pub use gate::{BackgroundQueue, SyncGate};
pub use lock::{GlobalLockHandle, GlobalLockManager};
pub use pull::{PullEngine, PullOutcome};
pub use push::{PushEngine, PushOutcome};
pub use rules::{ApplyTo, RuleContext, RuleOutcome, Scope, TruthRule};
pub use sync::SyncOrchestrator;
pub use value::{ColumnType, Value};
pub use watermark::SyncWatermark;
