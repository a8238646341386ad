pub mod messages;
pub mod object;
pub mod private;
pub mod public;
pub mod rpc;
pub mod shared;

pub use messages::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse,
    ListRequest, ListResponse, UpdateRequest, UpdateResponse, WatchEvent, WatchRequest,
};
pub use object::Object;
pub use shared::{
    Condition, ConditionStatus, ConditionType, EventKind, Metadata, ResourceState, TypedValue,
};
