//! The records service: CRUD plus a streaming list, over an injected
//! [`RecordStore`] capability.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use quartet_core::{ErrorCode, Frame, RpcError, RpcSession, codec};

use crate::call::{self, Inbound};
use crate::pacing::Pacing;
use crate::router::{DispatchFuture, ServiceDispatch, forward_stream, response_frame};
use crate::store::{Record, RecordFields, RecordStore, StoreError};

/// Method ids owned by the records service.
pub mod method {
    pub const CREATE_RECORD: u32 = 0x0301;
    pub const READ_RECORD: u32 = 0x0302;
    pub const UPDATE_RECORD: u32 = 0x0303;
    pub const DELETE_RECORD: u32 = 0x0304;
    pub const LIST_RECORDS: u32 = 0x0305;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRecordRequest {
    pub author_id: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResponse {
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRecordRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecordRequest {
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRecordRequest {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRecordResponse {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRecordsRequest {}

/// Reject ids that are not 24 hex characters before touching the store.
fn validate_id(id: &str) -> Result<(), RpcError> {
    let well_formed = id.len() == 24 && id.bytes().all(|b| b.is_ascii_hexdigit());
    if well_formed {
        Ok(())
    } else {
        Err(RpcError::Status {
            code: ErrorCode::InvalidArgument,
            message: format!("cannot parse record id {id:?}"),
        })
    }
}

fn store_error(error: StoreError) -> RpcError {
    match error {
        StoreError::NotFound(id) => RpcError::Status {
            code: ErrorCode::NotFound,
            message: format!("no record for id {id}"),
        },
        StoreError::Backend(message) => RpcError::Status {
            code: ErrorCode::Internal,
            message,
        },
    }
}

/// Wire-level server for the records service.
#[derive(Clone)]
pub struct RecordsServer<S> {
    store: Arc<S>,
    pacing: Pacing,
}

impl<S: RecordStore> RecordsServer<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            pacing: Pacing::None,
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }
}

impl<S: RecordStore> ServiceDispatch for RecordsServer<S> {
    fn accepts(&self, method_id: u32) -> bool {
        (0x0300..0x0400).contains(&method_id)
    }

    fn dispatch(&self, session: &Arc<RpcSession>, frame: Frame) -> DispatchFuture {
        let channel_id = frame.desc.channel_id;
        let store = self.store.clone();
        let session = session.clone();

        match frame.desc.method_id {
            method::CREATE_RECORD => Box::pin(async move {
                let request: CreateRecordRequest = codec::decode(frame.payload_bytes())?;
                let fields = RecordFields {
                    author_id: request.author_id.clone(),
                    title: request.title.clone(),
                    content: request.content.clone(),
                };
                let id = store.insert(fields).await.map_err(store_error)?;
                tracing::info!(id, "record created");
                response_frame(&RecordResponse {
                    record: Record {
                        id,
                        author_id: request.author_id,
                        title: request.title,
                        content: request.content,
                    },
                })
            }),
            method::READ_RECORD => Box::pin(async move {
                let request: ReadRecordRequest = codec::decode(frame.payload_bytes())?;
                validate_id(&request.id)?;
                let record = store.find_one(&request.id).await.map_err(store_error)?;
                response_frame(&RecordResponse { record })
            }),
            method::UPDATE_RECORD => Box::pin(async move {
                let request: UpdateRecordRequest = codec::decode(frame.payload_bytes())?;
                let record = request.record;
                validate_id(&record.id)?;
                let fields = RecordFields {
                    author_id: record.author_id.clone(),
                    title: record.title.clone(),
                    content: record.content.clone(),
                };
                store.replace(&record.id, fields).await.map_err(store_error)?;
                tracing::info!(id = record.id, "record updated");
                response_frame(&RecordResponse { record })
            }),
            method::DELETE_RECORD => Box::pin(async move {
                let request: DeleteRecordRequest = codec::decode(frame.payload_bytes())?;
                validate_id(&request.id)?;
                store.delete(&request.id).await.map_err(store_error)?;
                tracing::info!(id = request.id, "record deleted");
                response_frame(&DeleteRecordResponse { id: request.id })
            }),
            method::LIST_RECORDS => {
                let pacing = self.pacing;
                Box::pin(async move {
                    let _request: ListRecordsRequest = codec::decode(frame.payload_bytes())?;
                    let stream = store.scan_all().map(|item| item.map_err(store_error));
                    forward_stream(&session, channel_id, stream, pacing).await?;
                    Ok(None)
                })
            }
            other => Box::pin(async move {
                Err(RpcError::Status {
                    code: ErrorCode::Unimplemented,
                    message: format!("unknown records method {other:#x}"),
                })
            }),
        }
    }
}

/// Typed client for the records service.
#[derive(Clone)]
pub struct RecordsClient {
    session: Arc<RpcSession>,
}

impl RecordsClient {
    pub fn new(session: Arc<RpcSession>) -> Self {
        Self { session }
    }

    pub async fn create(
        &self,
        author_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Record, RpcError> {
        let request = CreateRecordRequest {
            author_id: author_id.into(),
            title: title.into(),
            content: content.into(),
        };
        let response: RecordResponse =
            call::unary(&self.session, method::CREATE_RECORD, &request, None).await?;
        Ok(response.record)
    }

    pub async fn read(&self, id: impl Into<String>) -> Result<Record, RpcError> {
        let request = ReadRecordRequest { id: id.into() };
        let response: RecordResponse =
            call::unary(&self.session, method::READ_RECORD, &request, None).await?;
        Ok(response.record)
    }

    /// Replace a record wholesale. The id decides which record is replaced.
    pub async fn update(&self, record: Record) -> Result<Record, RpcError> {
        let request = UpdateRecordRequest { record };
        let response: RecordResponse =
            call::unary(&self.session, method::UPDATE_RECORD, &request, None).await?;
        Ok(response.record)
    }

    pub async fn delete(&self, id: impl Into<String>) -> Result<(), RpcError> {
        let request = DeleteRecordRequest { id: id.into() };
        let _response: DeleteRecordResponse =
            call::unary(&self.session, method::DELETE_RECORD, &request, None).await?;
        Ok(())
    }

    /// Stream every record the store holds.
    pub async fn list(&self) -> Result<Inbound<Record>, RpcError> {
        call::server_streaming(&self.session, method::LIST_RECORDS, &ListRecordsRequest {}, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_ids_pass_validation() {
        assert!(validate_id("0123456789abcdef01234567").is_ok());
        assert!(validate_id("ABCDEF0123456789abcdef01").is_ok());
    }

    #[test]
    fn malformed_ids_are_invalid_argument() {
        for id in ["", "short", "0123456789abcdef0123456", "0123456789abcdef012345678",
            "0123456789abcdef0123456z"]
        {
            match validate_id(id).unwrap_err() {
                RpcError::Status { code, .. } => assert_eq!(code, ErrorCode::InvalidArgument),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn store_errors_map_to_wire_codes() {
        match store_error(StoreError::NotFound("feed".into())) {
            RpcError::Status { code, .. } => assert_eq!(code, ErrorCode::NotFound),
            other => panic!("unexpected error: {other}"),
        }
        match store_error(StoreError::Backend("disk on fire".into())) {
            RpcError::Status { code, .. } => assert_eq!(code, ErrorCode::Internal),
            other => panic!("unexpected error: {other}"),
        }
    }
}
