//! Translators for the single request / single response operations, plus abandon.

use crate::config::GatewayConfig;
use crate::connection::WireConnection;
use crate::error::{GatewayError, Result};
use crate::ldap_protocol::{
    AddRequest, Attribute, CompareRequest, Control, DelRequest, ExtendedRequest, LdapResponse, ModifyChange,
    ModifyDNRequest, ModifyOperation, ModifyRequest, ProtocolOp, START_TLS_OID,
};
use crate::model::{
    AbandonRequestSpec, AddRequestSpec, CompareRequestSpec, DelRequestSpec, ExtendedRequestSpec, ExtendedResponse,
    LdapResult, ModifyDnRequestSpec, ModifyRequestSpec, OperationResponse, RequestHeader, ResponseKind,
};
use crate::value::{AttrValue, UriResolver, required_binary, to_binary, to_binary_all};
use tracing::{debug, warn};

/// Everything a translator needs while one batch runs.
pub struct OperationContext<'a> {
    pub conn: &'a mut WireConnection,
    /// Controls attached to every operation of the batch (proxied authorization).
    pub shared_controls: &'a [Control],
    pub config: &'a GatewayConfig,
    pub resolver: &'a dyn UriResolver,
}

impl OperationContext<'_> {
    /// Batch-wide controls followed by the request's own.
    pub fn controls(&self, header: &RequestHeader) -> Result<Vec<Control>> {
        let mut controls = self.shared_controls.to_vec();
        for spec in &header.controls {
            controls.push(Control {
                ctype: spec.oid.clone(),
                critical: spec.criticality,
                value: to_binary(spec.value.as_ref(), self.resolver)?,
            });
        }
        Ok(controls)
    }

    async fn single_result(&mut self, op: ProtocolOp, header: &RequestHeader, kind: ResponseKind) -> Result<OperationResponse> {
        let controls = self.controls(header)?;
        let reply = self.conn.request(op, controls).await?;
        let wire = expect_result(reply, kind)?;
        debug!("{:?} finished with result code {}", kind, wire.result_code);
        Ok(OperationResponse::LdapResult(LdapResult::from_wire(
            kind,
            &wire,
            header.request_id.clone(),
        )))
    }
}

fn expect_result(reply: ProtocolOp, kind: ResponseKind) -> Result<LdapResponse> {
    match (kind, reply) {
        (ResponseKind::Add, ProtocolOp::AddResponse(r))
        | (ResponseKind::Delete, ProtocolOp::DelResponse(r))
        | (ResponseKind::Modify, ProtocolOp::ModifyResponse(r))
        | (ResponseKind::ModifyDn, ProtocolOp::ModifyDNResponse(r))
        | (ResponseKind::Compare, ProtocolOp::CompareResponse(r)) => Ok(r),
        (kind, other) => Err(GatewayError::Internal(format!(
            "unexpected {} in reply to {:?}",
            other.name(),
            kind
        ))),
    }
}

pub async fn add(ctx: &mut OperationContext<'_>, req: &AddRequestSpec) -> Result<OperationResponse> {
    debug!("Handling ADD request: dn={}", req.dn);
    let attributes = req
        .attributes
        .iter()
        .map(|attr| {
            Ok(Attribute {
                attr_type: attr.name.clone(),
                attr_values: to_binary_all(&attr.values, ctx.resolver)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let op = ProtocolOp::AddRequest(AddRequest {
        entry: req.dn.clone(),
        attributes,
    });
    ctx.single_result(op, &req.header, ResponseKind::Add).await
}

pub async fn delete(ctx: &mut OperationContext<'_>, req: &DelRequestSpec) -> Result<OperationResponse> {
    debug!("Handling DELETE request: dn={}", req.dn);
    let op = ProtocolOp::DelRequest(DelRequest { entry: req.dn.clone() });
    ctx.single_result(op, &req.header, ResponseKind::Delete).await
}

fn modify_operation(name: &str, dn: &str) -> ModifyOperation {
    match name.to_ascii_lowercase().as_str() {
        "add" => ModifyOperation::Add,
        "delete" => ModifyOperation::Delete,
        "replace" => ModifyOperation::Replace,
        _ => {
            warn!("Unknown modification operation {:?} on {}, using add", name, dn);
            ModifyOperation::Add
        }
    }
}

pub async fn modify(ctx: &mut OperationContext<'_>, req: &ModifyRequestSpec) -> Result<OperationResponse> {
    debug!("Handling MODIFY request: dn={}, {} change(s)", req.dn, req.modifications.len());
    let changes = req
        .modifications
        .iter()
        .map(|m| {
            Ok(ModifyChange {
                operation: modify_operation(&m.operation, &req.dn),
                modification: Attribute {
                    attr_type: m.name.clone(),
                    attr_values: to_binary_all(&m.values, ctx.resolver)?,
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let op = ProtocolOp::ModifyRequest(ModifyRequest {
        object: req.dn.clone(),
        changes,
    });
    ctx.single_result(op, &req.header, ResponseKind::Modify).await
}

pub async fn modify_dn(ctx: &mut OperationContext<'_>, req: &ModifyDnRequestSpec) -> Result<OperationResponse> {
    debug!("Handling MODIFYDN request: dn={}, newrdn={}", req.dn, req.newrdn);
    let op = ProtocolOp::ModifyDNRequest(ModifyDNRequest {
        entry: req.dn.clone(),
        newrdn: req.newrdn.clone(),
        delete_old_rdn: req.deleteoldrdn.unwrap_or(true),
        new_superior: req.new_superior.clone(),
    });
    ctx.single_result(op, &req.header, ResponseKind::ModifyDn).await
}

pub async fn compare(ctx: &mut OperationContext<'_>, req: &CompareRequestSpec) -> Result<OperationResponse> {
    debug!("Handling COMPARE request: dn={}, attr={}", req.dn, req.assertion.name);
    let op = ProtocolOp::CompareRequest(CompareRequest {
        entry: req.dn.clone(),
        attr: req.assertion.name.clone(),
        assertion_value: required_binary(req.assertion.value.as_ref(), &req.assertion.name, ctx.resolver)?,
    });
    ctx.single_result(op, &req.header, ResponseKind::Compare).await
}

pub async fn extended(ctx: &mut OperationContext<'_>, req: &ExtendedRequestSpec) -> Result<OperationResponse> {
    debug!("Handling EXTENDED request: oid={}", req.request_name);
    if req.request_name == START_TLS_OID {
        return Err(GatewayError::NotAttempted(
            "StartTLS is negotiated per connection (ldap.security), not per request".to_string(),
        ));
    }
    let op = ProtocolOp::ExtendedRequest(ExtendedRequest {
        request_name: req.request_name.clone(),
        request_value: to_binary(req.request_value.as_ref(), ctx.resolver)?,
    });
    let controls = ctx.controls(&req.header)?;
    let reply = match ctx.conn.request(op, controls).await? {
        ProtocolOp::ExtendedResponse(r) => r,
        other => {
            return Err(GatewayError::Internal(format!(
                "unexpected {} in reply to extended request",
                other.name()
            )));
        }
    };
    let oid = reply.response_name.as_deref().unwrap_or(&req.request_name);
    let text = ctx.config.extended.is_string_valued(oid);
    let response = reply.response_value.map(|bytes| {
        if text {
            AttrValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            AttrValue::Binary { bytes }
        }
    });
    Ok(OperationResponse::ExtendedResponse(ExtendedResponse {
        result: LdapResult::from_wire(ResponseKind::Extended, &reply.result, req.header.request_id.clone()),
        response_name: reply.response_name,
        response,
    }))
}

/// Fire-and-forget; the server does not answer an abandon.
pub async fn abandon(ctx: &mut OperationContext<'_>, req: &AbandonRequestSpec) -> Result<()> {
    let message_id = req
        .abandon_id
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| GatewayError::NotAttempted(format!("abandonID {:?} is not a message id", req.abandon_id)))?;
    debug!("Handling ABANDON request: message_id={}", message_id);
    let controls = ctx.controls(&req.header)?;
    ctx.conn.send(ProtocolOp::AbandonRequest(message_id), controls).await?;
    Ok(())
}
