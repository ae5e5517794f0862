//! Batch execution: one connection, one bind, requests in order, close on every path.

use crate::config::GatewayConfig;
use crate::connection::WireConnection;
use crate::error::{GatewayError, Result};
use crate::filter::FilterNode;
use crate::ldap_protocol::{BindAuthentication, Control};
use crate::model::{
    BatchRequest, BatchResponse, LdapResult, OnError, OperationRequest, OperationResponse, RequestHeader,
    ResponseKind, SearchRequestSpec,
};
use crate::operations::{self, OperationContext};
use crate::result_code;
use crate::search;
use crate::value::{FileUriResolver, UriResolver};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Credentials extracted by the front end (e.g. HTTP Basic).
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: Some(password.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BindIdentity {
    Anonymous,
    Simple { dn: String, password: String },
    SaslPlain { authcid: String, password: String },
}

impl BindIdentity {
    fn principal(&self) -> Option<&str> {
        match self {
            BindIdentity::Anonymous => None,
            BindIdentity::Simple { dn, .. } => Some(dn),
            BindIdentity::SaslPlain { authcid, .. } => Some(authcid),
        }
    }
}

/// Proxied authorization ids are "dn:<dn>" or "u:<user>"; bare values are taken as DNs.
pub fn normalize_authz_id(principal: &str) -> String {
    if principal.starts_with("dn:") || principal.starts_with("u:") {
        principal.to_string()
    } else {
        format!("dn:{}", principal)
    }
}

fn sasl_plain(authzid: &str, authcid: &str, password: &str) -> Vec<u8> {
    let mut creds = Vec::with_capacity(authzid.len() + authcid.len() + password.len() + 2);
    creds.extend_from_slice(authzid.as_bytes());
    creds.push(0);
    creds.extend_from_slice(authcid.as_bytes());
    creds.push(0);
    creds.extend_from_slice(password.as_bytes());
    creds
}

fn require_password(principal: &str, password: Option<String>) -> Result<String> {
    match password {
        Some(p) if !p.is_empty() => Ok(p),
        _ => Err(GatewayError::AuthenticationFailed(format!("no password for {}", principal))),
    }
}

/// The batch runAs, else the principal of a leading authRequest.
fn run_as_principal(batch: &BatchRequest) -> Option<&str> {
    let leading_auth = match batch.requests.first() {
        Some(OperationRequest::Auth(auth)) => Some(auth.principal.as_str()),
        _ => None,
    };
    match (batch.run_as.as_deref(), leading_auth) {
        (Some(run_as), Some(principal)) => {
            if !run_as.eq_ignore_ascii_case(principal) {
                warn!("Batch runAs {} overrides authRequest principal {}", run_as, principal);
            }
            Some(run_as)
        }
        (Some(run_as), None) => Some(run_as),
        (None, principal) => principal,
    }
}

pub struct BatchDispatcher {
    config: Arc<GatewayConfig>,
    resolver: Arc<dyn UriResolver>,
}

impl BatchDispatcher {
    pub fn new(config: Arc<GatewayConfig>, resolver: Arc<dyn UriResolver>) -> Self {
        Self { config, resolver }
    }

    /// Dispatcher resolving `file:` URIs from the local filesystem.
    pub fn with_file_resolver(config: Arc<GatewayConfig>) -> Self {
        Self::new(config, Arc::new(FileUriResolver))
    }

    /// Run a batch. Never fails: problems become errorResponses in the returned batch.
    pub async fn process(&self, batch: &BatchRequest, credentials: Option<Credentials>) -> BatchResponse {
        let request_id = batch.request_id.clone();
        info!(
            "Processing batch {:?}: {} request(s), onError={:?}",
            request_id,
            batch.requests.len(),
            batch.on_error
        );
        let responses = match self.run(batch, credentials).await {
            Ok(responses) => responses,
            Err(e) => {
                warn!("Batch {:?} not attempted: {}", request_id, e);
                vec![OperationResponse::error(&e, request_id.clone())]
            }
        };
        BatchResponse { request_id, responses }
    }

    fn resolve_identity(&self, credentials: Option<Credentials>) -> Result<BindIdentity> {
        let auth = &self.config.auth;
        if let Some(creds) = credentials {
            let password = require_password(&creds.user, creds.password)?;
            return Ok(if auth.authzid_type_is_id {
                BindIdentity::SaslPlain {
                    authcid: creds.user,
                    password,
                }
            } else {
                BindIdentity::Simple { dn: creds.user, password }
            });
        }
        if let Some(dn) = &auth.default_bind_dn {
            let password = require_password(dn, auth.default_password.clone())?;
            return Ok(BindIdentity::Simple { dn: dn.clone(), password });
        }
        Ok(BindIdentity::Anonymous)
    }

    async fn run(&self, batch: &BatchRequest, credentials: Option<Credentials>) -> Result<Vec<OperationResponse>> {
        let identity = self.resolve_identity(credentials)?;
        let mut conn = WireConnection::connect(&self.config.ldap).await?;
        let result = self.run_on(&mut conn, batch, &identity).await;
        conn.close().await;
        result
    }

    async fn run_on(
        &self,
        conn: &mut WireConnection,
        batch: &BatchRequest,
        identity: &BindIdentity,
    ) -> Result<Vec<OperationResponse>> {
        let shared_controls = self.authenticate(conn, identity, run_as_principal(batch)).await?;
        let mut ctx = OperationContext {
            conn,
            shared_controls: &shared_controls,
            config: &self.config,
            resolver: self.resolver.as_ref(),
        };

        let mut responses = Vec::with_capacity(batch.requests.len());
        for (index, request) in batch.requests.iter().enumerate() {
            let response = if ctx.conn.is_broken() {
                let err = GatewayError::CouldNotConnect(format!("connection to {} was lost", ctx.conn.address()));
                Some(OperationResponse::error(&err, request.request_id()))
            } else {
                match execute(&mut ctx, request, index).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("{} {:?} failed: {}", request.name(), request.request_id(), e);
                        Some(OperationResponse::error(&e, request.request_id()))
                    }
                }
            };
            let Some(response) = response else {
                continue;
            };
            let stop = batch.on_error == OnError::Exit && response.stops_batch();
            responses.push(response);
            if stop {
                info!(
                    "Stopping batch {:?} after {} (onError=exit)",
                    batch.request_id,
                    request.name()
                );
                break;
            }
        }
        Ok(responses)
    }

    /// Bind and establish the run-as identity. Returns the controls every later request carries.
    async fn authenticate(
        &self,
        conn: &mut WireConnection,
        identity: &BindIdentity,
        run_as: Option<&str>,
    ) -> Result<Vec<Control>> {
        let bound_as = identity.principal();
        let proxy_for = run_as.filter(|r| bound_as.map_or(true, |b| !b.eq_ignore_ascii_case(r)));

        match identity {
            BindIdentity::Anonymous => debug!("Using an anonymous session"),
            BindIdentity::Simple { dn, password } => {
                check_bind(conn, dn, BindAuthentication::Simple(password.clone())).await?;
            }
            BindIdentity::SaslPlain { authcid, password } => {
                let authzid = proxy_for.map(normalize_authz_id).unwrap_or_default();
                let credentials = sasl_plain(&authzid, authcid, password);
                check_bind(
                    conn,
                    "",
                    BindAuthentication::Sasl {
                        mechanism: "PLAIN".to_string(),
                        credentials,
                    },
                )
                .await?;
                if let Some(run_as) = proxy_for {
                    debug!("Acting as {} through the SASL authorization id", run_as);
                }
                return Ok(Vec::new());
            }
        }

        let Some(run_as) = proxy_for else {
            return Ok(Vec::new());
        };
        let control = Control::proxied_authorization(&normalize_authz_id(run_as));
        self.check_proxy(conn, &control, run_as).await?;
        Ok(vec![control])
    }

    /// Base search of the root DSE under the proxy control; proves the server accepts it.
    async fn check_proxy(&self, conn: &mut WireConnection, control: &Control, run_as: &str) -> Result<()> {
        let root_dse = SearchRequestSpec {
            header: RequestHeader::default(),
            dn: String::new(),
            scope: Some("baseObject".to_string()),
            deref_aliases: None,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: FilterNode::Present {
                name: "objectClass".to_string(),
            },
            attributes: vec!["1.1".to_string()],
        };
        let mut ctx = OperationContext {
            conn,
            shared_controls: std::slice::from_ref(control),
            config: &self.config,
            resolver: self.resolver.as_ref(),
        };
        let response = search::search(&mut ctx, &root_dse).await?;
        let code = response.result.result_code.code;
        if ctx.conn.is_broken() {
            return Err(GatewayError::CouldNotConnect(format!(
                "connection lost while checking proxied authorization as {}: {}",
                run_as,
                response.result.error_message.unwrap_or_default()
            )));
        }
        if code != result_code::SUCCESS {
            return Err(GatewayError::AuthenticationFailed(format!(
                "proxied authorization as {} refused: code {} {}",
                run_as,
                code,
                response.result.error_message.unwrap_or_default()
            )));
        }
        info!("Acting as {} through proxied authorization", run_as);
        Ok(())
    }
}

async fn check_bind(conn: &mut WireConnection, name: &str, authentication: BindAuthentication) -> Result<()> {
    let response = conn.bind(name, authentication).await?;
    if response.result.result_code != result_code::SUCCESS {
        return Err(GatewayError::AuthenticationFailed(format!(
            "bind as {:?} rejected: code {} {}",
            name, response.result.result_code, response.result.diagnostic_message
        )));
    }
    debug!("Bound to {} as {:?}", conn.address(), name);
    Ok(())
}

async fn execute(
    ctx: &mut OperationContext<'_>,
    request: &OperationRequest,
    index: usize,
) -> Result<Option<OperationResponse>> {
    let response = match request {
        OperationRequest::Search(r) => OperationResponse::SearchResponse(search::search(ctx, r).await?),
        OperationRequest::Add(r) => operations::add(ctx, r).await?,
        OperationRequest::Delete(r) => operations::delete(ctx, r).await?,
        OperationRequest::Modify(r) => operations::modify(ctx, r).await?,
        OperationRequest::ModifyDn(r) => operations::modify_dn(ctx, r).await?,
        OperationRequest::Compare(r) => operations::compare(ctx, r).await?,
        OperationRequest::Extended(r) => operations::extended(ctx, r).await?,
        OperationRequest::Abandon(r) => {
            operations::abandon(ctx, r).await?;
            return Ok(None);
        }
        OperationRequest::Auth(r) if index == 0 => {
            OperationResponse::LdapResult(LdapResult::success(ResponseKind::Auth, r.header.request_id.clone()))
        }
        OperationRequest::Auth(_) => {
            return Err(GatewayError::NotAttempted(
                "authRequest is only accepted as the first request of a batch".to_string(),
            ));
        }
    };
    Ok(Some(response))
}
