//! Batch request and response documents.
//!
//! Requests arrive already parsed (YAML or JSON via serde); responses are serialized back the same way.

use crate::error::{ErrorType, GatewayError};
use crate::filter::FilterNode;
use crate::ldap_protocol::LdapResponse;
use crate::result_code::{self, ResultCode};
use crate::value::{AttrValue, DsmlValue};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(rename = "requestID", default, deserialize_with = "optional_scalar_text")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub on_error: OnError,
    /// Identity to act as; if absent, a leading authRequest may supply one.
    pub run_as: Option<String>,
    #[serde(default)]
    pub requests: Vec<OperationRequest>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnError {
    Continue,
    #[default]
    Exit,
}

/// Per-request control.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlSpec {
    #[serde(rename = "type")]
    pub oid: String,
    #[serde(default)]
    pub criticality: bool,
    pub value: Option<DsmlValue>,
}

/// Fields every DSML request element carries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestHeader {
    #[serde(rename = "requestID", default, deserialize_with = "optional_scalar_text")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub controls: Vec<ControlSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op")]
pub enum OperationRequest {
    #[serde(rename = "searchRequest")]
    Search(SearchRequestSpec),
    #[serde(rename = "addRequest")]
    Add(AddRequestSpec),
    #[serde(rename = "delRequest")]
    Delete(DelRequestSpec),
    #[serde(rename = "modifyRequest")]
    Modify(ModifyRequestSpec),
    #[serde(rename = "modDNRequest")]
    ModifyDn(ModifyDnRequestSpec),
    #[serde(rename = "compareRequest")]
    Compare(CompareRequestSpec),
    #[serde(rename = "extendedRequest")]
    Extended(ExtendedRequestSpec),
    #[serde(rename = "abandonRequest")]
    Abandon(AbandonRequestSpec),
    #[serde(rename = "authRequest")]
    Auth(AuthRequestSpec),
}

impl OperationRequest {
    pub fn header(&self) -> &RequestHeader {
        match self {
            OperationRequest::Search(r) => &r.header,
            OperationRequest::Add(r) => &r.header,
            OperationRequest::Delete(r) => &r.header,
            OperationRequest::Modify(r) => &r.header,
            OperationRequest::ModifyDn(r) => &r.header,
            OperationRequest::Compare(r) => &r.header,
            OperationRequest::Extended(r) => &r.header,
            OperationRequest::Abandon(r) => &r.header,
            OperationRequest::Auth(r) => &r.header,
        }
    }

    pub fn request_id(&self) -> Option<String> {
        self.header().request_id.clone()
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationRequest::Search(_) => "searchRequest",
            OperationRequest::Add(_) => "addRequest",
            OperationRequest::Delete(_) => "delRequest",
            OperationRequest::Modify(_) => "modifyRequest",
            OperationRequest::ModifyDn(_) => "modDNRequest",
            OperationRequest::Compare(_) => "compareRequest",
            OperationRequest::Extended(_) => "extendedRequest",
            OperationRequest::Abandon(_) => "abandonRequest",
            OperationRequest::Auth(_) => "authRequest",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub dn: String,
    pub scope: Option<String>,
    pub deref_aliases: Option<String>,
    #[serde(default)]
    pub size_limit: i32,
    #[serde(default)]
    pub time_limit: i32,
    #[serde(default)]
    pub types_only: bool,
    pub filter: FilterNode,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Attribute with values, as used by addRequest.
#[derive(Debug, Clone, Deserialize)]
pub struct DsmlAttribute {
    pub name: String,
    #[serde(default)]
    pub values: Vec<DsmlValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub dn: String,
    #[serde(default)]
    pub attributes: Vec<DsmlAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub dn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModificationSpec {
    pub name: String,
    /// add, delete or replace
    pub operation: String,
    #[serde(default)]
    pub values: Vec<DsmlValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModifyRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub dn: String,
    #[serde(default)]
    pub modifications: Vec<ModificationSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyDnRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub dn: String,
    pub newrdn: String,
    pub deleteoldrdn: Option<bool>,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssertionSpec {
    pub name: String,
    pub value: Option<DsmlValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompareRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub dn: String,
    pub assertion: AssertionSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub request_name: String,
    pub request_value: Option<DsmlValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    /// Kept as text; parsed when the request runs.
    #[serde(rename = "abandonID", deserialize_with = "scalar_text")]
    pub abandon_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthRequestSpec {
    #[serde(flatten)]
    pub header: RequestHeader,
    pub principal: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarRepr {
    Text(String),
    Integer(i64),
}

impl From<ScalarRepr> for String {
    fn from(repr: ScalarRepr) -> Self {
        match repr {
            ScalarRepr::Text(s) => s,
            ScalarRepr::Integer(n) => n.to_string(),
        }
    }
}

/// Identifiers may be written unquoted (`requestID: 42`).
fn scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    ScalarRepr::deserialize(deserializer).map(String::from)
}

fn optional_scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<ScalarRepr>::deserialize(deserializer)?.map(String::from))
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    #[serde(rename = "requestID", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub responses: Vec<OperationResponse>,
}

/// DSML element name of an LDAPResult-shaped response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponseKind {
    #[serde(rename = "authResponse")]
    Auth,
    #[serde(rename = "searchResultDone")]
    SearchDone,
    #[serde(rename = "addResponse")]
    Add,
    #[serde(rename = "delResponse")]
    Delete,
    #[serde(rename = "modifyResponse")]
    Modify,
    #[serde(rename = "modDNResponse")]
    ModifyDn,
    #[serde(rename = "compareResponse")]
    Compare,
    #[serde(rename = "extendedResponse")]
    Extended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LdapResult {
    pub operation: ResponseKind,
    #[serde(rename = "requestID", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub result_code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_dn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn from_wire(operation: ResponseKind, response: &LdapResponse, request_id: Option<String>) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            operation,
            request_id,
            result_code: ResultCode::from_code(response.result_code),
            matched_dn: non_empty(&response.matched_dn),
            error_message: non_empty(&response.diagnostic_message),
            referrals: response.referrals.clone(),
        }
    }

    pub fn success(operation: ResponseKind, request_id: Option<String>) -> Self {
        Self::with_code(operation, result_code::SUCCESS, None, request_id)
    }

    pub fn with_code(operation: ResponseKind, code: i32, message: Option<String>, request_id: Option<String>) -> Self {
        Self {
            operation,
            request_id,
            result_code: ResultCode::from_code(code),
            matched_dn: None,
            error_message: message,
            referrals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryAttribute {
    pub name: String,
    pub values: Vec<AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Vec<EntryAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResponse {
    #[serde(rename = "requestID", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub entries: Vec<SearchEntry>,
    pub result: LdapResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedResponse {
    pub result: LdapResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AttrValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub message: String,
    #[serde(rename = "requestID", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn from_error(err: &GatewayError, request_id: Option<String>) -> Self {
        Self {
            error_type: err.error_type(),
            message: err.to_string(),
            request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OperationResponse {
    LdapResult(LdapResult),
    SearchResponse(SearchResponse),
    ExtendedResponse(ExtendedResponse),
    ErrorResponse(ErrorResponse),
}

impl OperationResponse {
    /// Result code carried by the response, if any.
    pub fn result_code(&self) -> Option<i32> {
        match self {
            OperationResponse::LdapResult(r) => Some(r.result_code.code),
            OperationResponse::SearchResponse(r) => Some(r.result.result_code.code),
            OperationResponse::ExtendedResponse(r) => Some(r.result.result_code.code),
            OperationResponse::ErrorResponse(_) => None,
        }
    }

    /// True when onError=exit must stop the batch after this response.
    pub fn stops_batch(&self) -> bool {
        self.result_code().map_or(true, |code| !result_code::is_acceptable(code))
    }

    pub fn error(err: &GatewayError, request_id: Option<String>) -> Self {
        OperationResponse::ErrorResponse(ErrorResponse::from_error(err, request_id))
    }
}

/// Find the batch requestID in a document that failed to parse.
/// Accepts `requestID="42"` (XML), `requestID: 42` (YAML) and `"requestID": "42"` (JSON).
pub fn recover_request_id(raw: &str) -> Option<String> {
    const KEY: &str = "requestID";
    let mut search_from = 0;
    while let Some(pos) = raw[search_from..].find(KEY) {
        let after = search_from + pos + KEY.len();
        if let Some(id) = value_after_key(&raw[after..]) {
            return Some(id);
        }
        search_from = after;
    }
    None
}

fn value_after_key(rest: &str) -> Option<String> {
    let rest = rest.trim_start_matches(['"', '\'']).trim_start();
    let rest = rest.strip_prefix(['=', ':'])?.trim_start();
    let (quote, body) = match rest.chars().next() {
        Some(q @ ('"' | '\'')) => (Some(q), &rest[1..]),
        _ => (None, rest),
    };
    let end = match quote {
        Some(q) => body.find(q)?,
        None => body
            .find(|c: char| c.is_whitespace() || matches!(c, ',' | '}' | '>' | '/'))
            .unwrap_or(body.len()),
    };
    let id = body[..end].trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_request_from_yaml() {
        let yaml = r#"
requestID: batch-1
onError: continue
requests:
  - op: addRequest
    requestID: a1
    dn: cn=alice,dc=example,dc=com
    attributes:
      - name: objectClass
        values: [top, person]
      - name: jpegPhoto
        values:
          - base64: /9j/
  - op: delRequest
    dn: cn=bob,dc=example,dc=com
    controls:
      - type: 1.2.840.113556.1.4.805
        criticality: true
  - op: searchRequest
    dn: dc=example,dc=com
    scope: one
    filter:
      type: present
      name: objectClass
  - op: abandonRequest
    requestID: 9
    abandonID: 12
"#;
        let batch: BatchRequest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(batch.request_id.as_deref(), Some("batch-1"));
        assert_eq!(batch.on_error, OnError::Continue);
        assert_eq!(batch.requests.len(), 4);
        match &batch.requests[0] {
            OperationRequest::Add(add) => {
                assert_eq!(add.header.request_id.as_deref(), Some("a1"));
                assert_eq!(add.attributes[0].values.len(), 2);
                assert_eq!(add.attributes[1].values[0], DsmlValue::Binary(vec![0xFF, 0xD8, 0xFF]));
            }
            other => panic!("expected add, got {:?}", other),
        }
        let del = batch.requests[1].header();
        assert_eq!(del.controls.len(), 1);
        assert!(del.controls[0].criticality);
        assert_eq!(batch.requests[2].name(), "searchRequest");
        match &batch.requests[3] {
            OperationRequest::Abandon(a) => {
                assert_eq!(a.abandon_id, "12");
                assert_eq!(a.header.request_id.as_deref(), Some("9"));
            }
            other => panic!("expected abandon, got {:?}", other),
        }
    }

    #[test]
    fn test_on_error_defaults_to_exit() {
        let batch: BatchRequest = serde_yaml::from_str("requests: []").unwrap();
        assert_eq!(batch.on_error, OnError::Exit);
        assert!(batch.request_id.is_none());
    }

    #[test]
    fn test_unknown_op_rejected() {
        let yaml = "requests:\n  - op: frobRequest\n    dn: x\n";
        assert!(serde_yaml::from_str::<BatchRequest>(yaml).is_err());
    }

    #[test]
    fn test_stops_batch() {
        let ok = OperationResponse::LdapResult(LdapResult::success(ResponseKind::Add, None));
        let cmp = OperationResponse::LdapResult(LdapResult::with_code(ResponseKind::Compare, 6, None, None));
        let bad = OperationResponse::LdapResult(LdapResult::with_code(ResponseKind::Add, 19, None, None));
        let err = OperationResponse::error(&GatewayError::NotAttempted("x".into()), None);
        assert!(!ok.stops_batch());
        assert!(!cmp.stops_batch());
        assert!(bad.stops_batch());
        assert!(err.stops_batch());
    }

    #[test]
    fn test_from_wire_drops_empty_strings() {
        let wire = LdapResponse {
            result_code: 32,
            matched_dn: "dc=example,dc=com".to_string(),
            diagnostic_message: String::new(),
            referrals: vec![],
        };
        let r = LdapResult::from_wire(ResponseKind::Delete, &wire, Some("7".to_string()));
        assert_eq!(r.result_code.description, Some("noSuchObject"));
        assert_eq!(r.matched_dn.as_deref(), Some("dc=example,dc=com"));
        assert_eq!(r.error_message, None);
    }

    #[test]
    fn test_response_serialization() {
        let resp = BatchResponse {
            request_id: Some("b1".to_string()),
            responses: vec![
                OperationResponse::LdapResult(LdapResult::success(ResponseKind::Add, Some("a1".to_string()))),
                OperationResponse::error(&GatewayError::MalformedRequest("bad filter".into()), None),
            ],
        };
        let out = serde_yaml::to_string(&resp).unwrap();
        assert!(out.contains("requestID: b1"));
        assert!(out.contains("kind: ldapResult"));
        assert!(out.contains("operation: addResponse"));
        assert!(out.contains("description: success"));
        assert!(out.contains("kind: errorResponse"));
        assert!(out.contains("type: malformedRequest"));
    }

    #[test]
    fn test_recover_request_id() {
        assert_eq!(recover_request_id(r#"<batchRequest requestID="42" onError="exit"><bogus"#), Some("42".to_string()));
        assert_eq!(recover_request_id("requestID: abc\nrequests: [unclosed"), Some("abc".to_string()));
        assert_eq!(recover_request_id(r#"{"requestID": "x-1", "requests": ["#), Some("x-1".to_string()));
        assert_eq!(recover_request_id("<batchRequest requestID='q'/>"), Some("q".to_string()));
        assert_eq!(recover_request_id("no id here"), None);
        assert_eq!(recover_request_id("requestID requestID=7"), Some("7".to_string()));
        assert_eq!(recover_request_id(r#"requestID="""#), None);
    }
}
