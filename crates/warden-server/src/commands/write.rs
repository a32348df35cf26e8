//! The tuple write command.
//!
//! Enforced before anything reaches the datastore:
//! - the batch is non-empty and within the write limit;
//! - every write validates against the current type system (type and
//!   relation exist, the user side satisfies the direct type
//!   restrictions, referenced conditions are defined);
//! - delete keys are well-formed;
//! - no key appears twice, or in both the writes and the deletes.
//!
//! Duplicate-write and missing-delete failures come back from the
//! datastore as typed errors and map to conflict / not-found.

use std::collections::HashSet;
use std::sync::Arc;

use warden_domain::model::{ObjectRef, TupleKey, TypeSystem, UserRef};
use warden_storage::{DataStore, StoredTuple};

use crate::errors::{ServerError, ServerResult};
use crate::types::{TupleWrite, WriteRequest};

/// Maximum writes plus deletes in one batch.
const MAX_TUPLES_PER_WRITE: usize = 100;

pub struct WriteCommand {
    datastore: Arc<dyn DataStore>,
}

impl WriteCommand {
    pub fn new(datastore: Arc<dyn DataStore>) -> Self {
        Self { datastore }
    }

    pub async fn execute(
        &self,
        typesystem: &TypeSystem,
        request: &WriteRequest,
    ) -> ServerResult<()> {
        if request.writes.is_empty() && request.deletes.is_empty() {
            return Err(ServerError::Validation(
                "a write request must contain writes or deletes".to_string(),
            ));
        }
        if request.writes.len() + request.deletes.len() > MAX_TUPLES_PER_WRITE {
            return Err(ServerError::Validation(format!(
                "a write request may contain at most {} tuples",
                MAX_TUPLES_PER_WRITE
            )));
        }

        let mut seen: HashSet<String> = HashSet::new();
        for write in &request.writes {
            typesystem
                .validate_write_tuple(&write.key, write.condition_name.as_deref())
                .map_err(|e| ServerError::Validation(e.to_string()))?;
            if !seen.insert(write.key.to_string()) {
                return Err(ServerError::Validation(format!(
                    "tuple appears more than once in the write request: {}",
                    write.key
                )));
            }
        }
        for delete in &request.deletes {
            delete
                .validate_format()
                .map_err(|e| ServerError::Validation(e.to_string()))?;
            if !seen.insert(delete.to_string()) {
                return Err(ServerError::Validation(format!(
                    "tuple appears more than once in the write request: {}",
                    delete
                )));
            }
        }

        let writes = request
            .writes
            .iter()
            .map(write_to_stored)
            .collect::<ServerResult<Vec<_>>>()?;
        let deletes = request
            .deletes
            .iter()
            .map(|key| key_to_stored(key, None, None))
            .collect::<ServerResult<Vec<_>>>()?;

        self.datastore
            .write_tuples(&request.store_id, writes, deletes)
            .await?;
        Ok(())
    }
}

fn write_to_stored(write: &TupleWrite) -> ServerResult<StoredTuple> {
    key_to_stored(
        &write.key,
        write.condition_name.clone(),
        write.condition_context.clone(),
    )
}

fn key_to_stored(
    key: &TupleKey,
    condition_name: Option<String>,
    condition_context: Option<std::collections::HashMap<String, serde_json::Value>>,
) -> ServerResult<StoredTuple> {
    let object =
        ObjectRef::parse(&key.object).map_err(|e| ServerError::Validation(e.to_string()))?;
    let user = UserRef::parse(&key.user).map_err(|e| ServerError::Validation(e.to_string()))?;

    let (user_type, user_id, user_relation) = match user {
        UserRef::Object { user_type, user_id } => (user_type, user_id, None),
        UserRef::Wildcard { user_type } => (user_type, "*".to_string(), None),
        UserRef::Userset {
            user_type,
            user_id,
            relation,
        } => (user_type, user_id, Some(relation)),
    };

    Ok(StoredTuple {
        object_type: object.object_type,
        object_id: object.object_id,
        relation: key.relation.clone(),
        user_type,
        user_id,
        user_relation,
        condition_name,
        condition_context,
    })
}
