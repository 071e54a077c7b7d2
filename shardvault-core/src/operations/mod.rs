pub mod put_object;
pub mod read_object;
pub mod reconcile;
pub mod update_tags;

pub use put_object::{
    DuplicateContent, PutObjectOperation, PutObjectOperationOutcome, PutObjectOperationRequest,
    PutObjectOperationResult, WriteState,
};
pub use read_object::{
    ObjectLookup, ReadObjectOperation, ReadObjectOperationOutcome, ReadObjectOperationRequest,
    ReadObjectOperationResult,
};
pub use reconcile::{ReconcileOperation, ReconcileOperationRequest, ReconcileOperationResult};
pub use update_tags::{
    UpdateTagsOperation, UpdateTagsOperationOutcome, UpdateTagsOperationRequest,
    UpdateTagsOperationResult,
};
