//! Message dispatcher: fans one decoded envelope out to a typed handler.
//!
//! The handler trait is closed-world: every request and response kind has a
//! method, and every default body answers "unexpected" — a concrete
//! implementation overrides only the handlers relevant to its role. The
//! client connection overrides the response methods; requests arriving at a
//! client fall through to the defaults and surface as protocol violations.

use crate::error::LdapError;
use crate::protocol::*;
use async_trait::async_trait;

type Result<T> = std::result::Result<T, LdapError>;

fn unexpected_request(message_id: i32, kind: &'static str) -> LdapError {
    LdapError::UnexpectedRequest { message_id, kind }
}

fn unexpected_response(message_id: i32, kind: &'static str) -> LdapError {
    LdapError::UnexpectedResponse { message_id, kind }
}

/// Per-kind handler capability. All methods take `(message_id, message)`;
/// an `Err` return is treated by the reader as fatal and routed to
/// [`MessageHandler::handle_exception`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_bind_request(&self, message_id: i32, _req: BindRequest) -> Result<()> {
        Err(unexpected_request(message_id, "bind"))
    }

    async fn handle_unbind_request(&self, message_id: i32) -> Result<()> {
        Err(unexpected_request(message_id, "unbind"))
    }

    async fn handle_search_request(&self, message_id: i32, _req: SearchRequest) -> Result<()> {
        Err(unexpected_request(message_id, "search"))
    }

    async fn handle_modify_request(&self, message_id: i32, _req: ModifyRequest) -> Result<()> {
        Err(unexpected_request(message_id, "modify"))
    }

    async fn handle_add_request(&self, message_id: i32, _req: AddRequest) -> Result<()> {
        Err(unexpected_request(message_id, "add"))
    }

    async fn handle_del_request(&self, message_id: i32, _req: DelRequest) -> Result<()> {
        Err(unexpected_request(message_id, "delete"))
    }

    async fn handle_modify_dn_request(&self, message_id: i32, _req: ModifyDnRequest) -> Result<()> {
        Err(unexpected_request(message_id, "modify dn"))
    }

    async fn handle_compare_request(&self, message_id: i32, _req: CompareRequest) -> Result<()> {
        Err(unexpected_request(message_id, "compare"))
    }

    async fn handle_abandon_request(&self, message_id: i32, _target: i32) -> Result<()> {
        Err(unexpected_request(message_id, "abandon"))
    }

    async fn handle_extended_request(&self, message_id: i32, _req: ExtendedRequest) -> Result<()> {
        Err(unexpected_request(message_id, "extended"))
    }

    async fn handle_bind_response(&self, message_id: i32, _resp: BindResponse) -> Result<()> {
        Err(unexpected_response(message_id, "bind"))
    }

    async fn handle_search_result_entry(
        &self,
        message_id: i32,
        _entry: SearchResultEntry,
    ) -> Result<()> {
        Err(unexpected_response(message_id, "search entry"))
    }

    async fn handle_search_result_reference(
        &self,
        message_id: i32,
        _reference: SearchResultReference,
    ) -> Result<()> {
        Err(unexpected_response(message_id, "search reference"))
    }

    async fn handle_search_result_done(&self, message_id: i32, _result: LdapResult) -> Result<()> {
        Err(unexpected_response(message_id, "search done"))
    }

    async fn handle_modify_response(&self, message_id: i32, _result: LdapResult) -> Result<()> {
        Err(unexpected_response(message_id, "modify"))
    }

    async fn handle_add_response(&self, message_id: i32, _result: LdapResult) -> Result<()> {
        Err(unexpected_response(message_id, "add"))
    }

    async fn handle_del_response(&self, message_id: i32, _result: LdapResult) -> Result<()> {
        Err(unexpected_response(message_id, "delete"))
    }

    async fn handle_modify_dn_response(&self, message_id: i32, _result: LdapResult) -> Result<()> {
        Err(unexpected_response(message_id, "modify dn"))
    }

    async fn handle_compare_response(&self, message_id: i32, _result: LdapResult) -> Result<()> {
        Err(unexpected_response(message_id, "compare"))
    }

    async fn handle_extended_response(
        &self,
        message_id: i32,
        _resp: ExtendedResponse,
    ) -> Result<()> {
        Err(unexpected_response(message_id, "extended"))
    }

    async fn handle_intermediate_response(
        &self,
        message_id: i32,
        _resp: IntermediateResponse,
    ) -> Result<()> {
        Err(unexpected_response(message_id, "intermediate"))
    }

    /// Catch-all for the codec's opaque fallback: a structurally valid
    /// element whose tag is outside the known set. Carries the raw payload
    /// for diagnostics. Receiving one does not by itself close the
    /// connection; the concrete handler decides by returning `Err`.
    async fn handle_unrecognized(&self, _message_id: i32, tag: u8, raw: Vec<u8>) -> Result<()> {
        Err(LdapError::UnsupportedMessage { tag, raw })
    }

    /// Invoked by the reader on any I/O or decode failure. Must trigger
    /// connection teardown.
    async fn handle_exception(&self, error: LdapError);
}

/// Route one parsed envelope to the matching handler method.
pub async fn dispatch(handler: &dyn MessageHandler, msg: LdapMessage) -> Result<()> {
    let id = msg.message_id;
    match msg.op {
        ProtocolOp::BindRequest(req) => handler.handle_bind_request(id, req).await,
        ProtocolOp::UnbindRequest => handler.handle_unbind_request(id).await,
        ProtocolOp::SearchRequest(req) => handler.handle_search_request(id, req).await,
        ProtocolOp::ModifyRequest(req) => handler.handle_modify_request(id, req).await,
        ProtocolOp::AddRequest(req) => handler.handle_add_request(id, req).await,
        ProtocolOp::DelRequest(req) => handler.handle_del_request(id, req).await,
        ProtocolOp::ModifyDnRequest(req) => handler.handle_modify_dn_request(id, req).await,
        ProtocolOp::CompareRequest(req) => handler.handle_compare_request(id, req).await,
        ProtocolOp::AbandonRequest(target) => handler.handle_abandon_request(id, target).await,
        ProtocolOp::ExtendedRequest(req) => handler.handle_extended_request(id, req).await,
        ProtocolOp::BindResponse(resp) => handler.handle_bind_response(id, resp).await,
        ProtocolOp::SearchResultEntry(entry) => {
            handler.handle_search_result_entry(id, entry).await
        }
        ProtocolOp::SearchResultReference(reference) => {
            handler.handle_search_result_reference(id, reference).await
        }
        ProtocolOp::SearchResultDone(result) => handler.handle_search_result_done(id, result).await,
        ProtocolOp::ModifyResponse(result) => handler.handle_modify_response(id, result).await,
        ProtocolOp::AddResponse(result) => handler.handle_add_response(id, result).await,
        ProtocolOp::DelResponse(result) => handler.handle_del_response(id, result).await,
        ProtocolOp::ModifyDnResponse(result) => {
            handler.handle_modify_dn_response(id, result).await
        }
        ProtocolOp::CompareResponse(result) => handler.handle_compare_response(id, result).await,
        ProtocolOp::ExtendedResponse(resp) => handler.handle_extended_response(id, resp).await,
        ProtocolOp::IntermediateResponse(resp) => {
            handler.handle_intermediate_response(id, resp).await
        }
        ProtocolOp::Unknown { tag, raw } => handler.handle_unrecognized(id, tag, raw).await,
    }
}
