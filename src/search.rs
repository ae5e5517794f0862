//! searchRequest: one request, many entries, one searchResultDone.

use crate::connection::notice_of_disconnection;
use crate::error::{GatewayError, Result};
use crate::filter::translate;
use crate::ldap_protocol::{DerefAliases, ProtocolOp, SearchRequest, SearchResultEntry, SearchScope};
use crate::model::{EntryAttribute, LdapResult, ResponseKind, SearchEntry, SearchRequestSpec, SearchResponse};
use crate::operations::OperationContext;
use crate::result_code;
use crate::value::from_binary;
use tracing::{debug, info, warn};

/// Scope names are matched case-insensitively; anything unknown searches the whole subtree.
pub fn parse_scope(scope: Option<&str>) -> SearchScope {
    let Some(scope) = scope else {
        return SearchScope::WholeSubtree;
    };
    match scope.to_ascii_lowercase().as_str() {
        "baseobject" | "base" => SearchScope::BaseObject,
        "singlelevel" | "one" | "onelevel" => SearchScope::SingleLevel,
        "wholesubtree" | "sub" | "subtree" => SearchScope::WholeSubtree,
        _ => {
            warn!("Unknown search scope {:?}, using wholeSubtree", scope);
            SearchScope::WholeSubtree
        }
    }
}

pub fn parse_deref(deref: Option<&str>) -> DerefAliases {
    let Some(deref) = deref else {
        return DerefAliases::Never;
    };
    match deref.to_ascii_lowercase().as_str() {
        "neverderefaliases" | "never" => DerefAliases::Never,
        "derefinsearching" | "searching" => DerefAliases::InSearching,
        "dereffindingbaseobj" | "finding" => DerefAliases::FindingBaseObj,
        "derefalways" | "always" => DerefAliases::Always,
        _ => {
            warn!("Unknown derefAliases {:?}, using neverDerefAliases", deref);
            DerefAliases::Never
        }
    }
}

fn to_entry(entry: SearchResultEntry, types_only: bool) -> SearchEntry {
    SearchEntry {
        dn: entry.object_name,
        attributes: entry
            .attributes
            .into_iter()
            .map(|attr| EntryAttribute {
                name: attr.attr_type,
                values: if types_only {
                    Vec::new()
                } else {
                    attr.attr_values.iter().map(|v| from_binary(v)).collect()
                },
            })
            .collect(),
    }
}

pub async fn search(ctx: &mut OperationContext<'_>, req: &SearchRequestSpec) -> Result<SearchResponse> {
    if req.size_limit < 0 || req.time_limit < 0 {
        return Err(GatewayError::MalformedRequest(format!(
            "sizeLimit and timeLimit must not be negative (got {} and {})",
            req.size_limit, req.time_limit
        )));
    }
    let filter = translate(&req.filter, ctx.resolver)?;
    let scope = parse_scope(req.scope.as_deref());
    debug!(
        "Handling SEARCH request: base={:?}, scope={:?}, filter={}",
        req.dn,
        scope,
        filter.to_ldap_string()
    );
    let op = ProtocolOp::SearchRequest(SearchRequest {
        base_object: req.dn.clone(),
        scope,
        deref_aliases: parse_deref(req.deref_aliases.as_deref()),
        size_limit: req.size_limit,
        time_limit: req.time_limit,
        types_only: req.types_only,
        filter,
        attributes: req.attributes.clone(),
    });
    let controls = ctx.controls(&req.header)?;
    let message_id = ctx.conn.send(op, controls).await?;

    let request_id = req.header.request_id.clone();
    let mut entries = Vec::new();
    loop {
        let message = match ctx.conn.recv().await {
            Ok(Some(message)) => message,
            Ok(None) => {
                let reason = format!("{} closed the connection during the search", ctx.conn.address());
                return Ok(interrupted(request_id, entries, reason));
            }
            Err(e) if e.is_transport() => {
                ctx.conn.mark_broken();
                return Ok(interrupted(request_id, entries, e.to_string()));
            }
            Err(e) => return Err(e),
        };
        if let Some(notice) = notice_of_disconnection(&message) {
            ctx.conn.mark_broken();
            let reason = format!("{} is disconnecting: {}", ctx.conn.address(), notice.result.diagnostic_message);
            return Ok(interrupted(request_id, entries, reason));
        }
        if message.message_id != message_id {
            debug!("Skipping {} message_id={} during search", message.protocol_op.name(), message.message_id);
            continue;
        }
        match message.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => entries.push(to_entry(entry, req.types_only)),
            ProtocolOp::SearchResultReference(uris) => debug!("Dropping search continuation reference {:?}", uris),
            ProtocolOp::IntermediateResponse(r) => debug!("Ignoring intermediate response {:?}", r.response_name),
            ProtocolOp::SearchResultDone(done) => {
                info!(
                    "SEARCH under {:?} returned {} entries, result code {}",
                    req.dn,
                    entries.len(),
                    done.result_code
                );
                let result = LdapResult::from_wire(ResponseKind::SearchDone, &done, request_id.clone());
                return Ok(SearchResponse { request_id, entries, result });
            }
            other => {
                return Err(GatewayError::Internal(format!("unexpected {} during search", other.name())));
            }
        }
    }
}

/// Entries gathered so far plus a terminal `unavailable` result.
fn interrupted(request_id: Option<String>, entries: Vec<SearchEntry>, reason: String) -> SearchResponse {
    warn!("Search interrupted after {} entries: {}", entries.len(), reason);
    SearchResponse {
        result: LdapResult::with_code(
            ResponseKind::SearchDone,
            result_code::UNAVAILABLE,
            Some(reason),
            request_id.clone(),
        ),
        request_id,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::connection::WireConnection;
    use crate::filter::FilterNode;
    use crate::ldap_protocol::LDAP_TAG_SEARCH_RESULT_DONE;
    use crate::model::RequestHeader;
    use crate::test_support::{self, FakeServer, Reply};
    use crate::value::{AttrValue, FileUriResolver};

    fn present_search(base: &str) -> SearchRequestSpec {
        SearchRequestSpec {
            header: RequestHeader {
                request_id: Some("s1".to_string()),
                controls: Vec::new(),
            },
            dn: base.to_string(),
            scope: Some("one".to_string()),
            deref_aliases: None,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: FilterNode::Present {
                name: "objectClass".to_string(),
            },
            attributes: Vec::new(),
        }
    }

    async fn run(server: &FakeServer, req: &SearchRequestSpec) -> (Result<SearchResponse>, bool) {
        let config: GatewayConfig = server.config();
        let mut conn = WireConnection::connect(&config.ldap).await.unwrap();
        let result = {
            let mut ctx = OperationContext {
                conn: &mut conn,
                shared_controls: &[],
                config: &config,
                resolver: &FileUriResolver,
            };
            search(&mut ctx, req).await
        };
        let broken = conn.is_broken();
        conn.close().await;
        (result, broken)
    }

    #[test]
    fn test_parse_scope() {
        assert_eq!(parse_scope(Some("baseObject")), SearchScope::BaseObject);
        assert_eq!(parse_scope(Some("BASE")), SearchScope::BaseObject);
        assert_eq!(parse_scope(Some("singleLevel")), SearchScope::SingleLevel);
        assert_eq!(parse_scope(Some("one")), SearchScope::SingleLevel);
        assert_eq!(parse_scope(Some("wholeSubtree")), SearchScope::WholeSubtree);
        assert_eq!(parse_scope(Some("children")), SearchScope::WholeSubtree);
        assert_eq!(parse_scope(None), SearchScope::WholeSubtree);
    }

    #[test]
    fn test_parse_deref() {
        assert_eq!(parse_deref(None), DerefAliases::Never);
        assert_eq!(parse_deref(Some("derefAlways")), DerefAliases::Always);
        assert_eq!(parse_deref(Some("derefInSearching")), DerefAliases::InSearching);
        assert_eq!(parse_deref(Some("derefFindingBaseObj")), DerefAliases::FindingBaseObj);
        assert_eq!(parse_deref(Some("sometimes")), DerefAliases::Never);
    }

    #[tokio::test]
    async fn test_search_collects_entries_and_drops_references() {
        let server = FakeServer::start(|req| {
            let id = req.message_id;
            Reply::Send(vec![
                test_support::entry(id, "cn=a,dc=example,dc=com", &[("cn", &[b"a"]), ("photo", &[&[0xFF, 0xD8]])]),
                test_support::reference(id, "ldap://other.example.com/dc=example,dc=com"),
                test_support::entry(id, "cn=b,dc=example,dc=com", &[("cn", &[b"b"])]),
                test_support::result(id, LDAP_TAG_SEARCH_RESULT_DONE, 0, ""),
            ])
        })
        .await;
        let (result, broken) = run(&server, &present_search("dc=example,dc=com")).await;
        let resp = result.unwrap();
        assert!(!broken);
        assert_eq!(resp.request_id.as_deref(), Some("s1"));
        assert_eq!(resp.entries.len(), 2);
        assert_eq!(resp.entries[0].dn, "cn=a,dc=example,dc=com");
        assert_eq!(resp.entries[0].attributes[0].values, vec![AttrValue::Text("a".to_string())]);
        assert_eq!(
            resp.entries[0].attributes[1].values,
            vec![AttrValue::Binary { bytes: vec![0xFF, 0xD8] }]
        );
        assert_eq!(resp.result.result_code.code, 0);
        assert_eq!(resp.result.operation, ResponseKind::SearchDone);
    }

    #[tokio::test]
    async fn test_search_with_no_entries() {
        let server = FakeServer::start(|req| {
            Reply::Send(vec![test_support::result(req.message_id, LDAP_TAG_SEARCH_RESULT_DONE, 32, "no such object")])
        })
        .await;
        let (result, _) = run(&server, &present_search("ou=missing,dc=example,dc=com")).await;
        let resp = result.unwrap();
        assert!(resp.entries.is_empty());
        assert_eq!(resp.result.result_code.code, 32);
        assert_eq!(resp.result.error_message.as_deref(), Some("no such object"));
    }

    #[tokio::test]
    async fn test_search_types_only() {
        let server = FakeServer::start(|req| {
            let id = req.message_id;
            Reply::Send(vec![
                test_support::entry(id, "cn=a", &[("cn", &[b"a"])]),
                test_support::result(id, LDAP_TAG_SEARCH_RESULT_DONE, 0, ""),
            ])
        })
        .await;
        let mut req = present_search("cn=a");
        req.types_only = true;
        let resp = run(&server, &req).await.0.unwrap();
        assert_eq!(resp.entries[0].attributes[0].name, "cn");
        assert!(resp.entries[0].attributes[0].values.is_empty());
    }

    #[tokio::test]
    async fn test_search_interrupted_by_hangup() {
        let server = FakeServer::start(|_| Reply::Hangup).await;
        let (result, broken) = run(&server, &present_search("dc=example,dc=com")).await;
        let resp = result.unwrap();
        assert!(broken);
        assert!(resp.entries.is_empty());
        assert_eq!(resp.result.result_code.code, result_code::UNAVAILABLE);
        assert!(resp.result.error_message.unwrap().contains("closed the connection"));
    }

    #[tokio::test]
    async fn test_search_interrupted_mid_frame_keeps_entries() {
        let server = FakeServer::start(|req| {
            Reply::SendAndHangup(vec![
                test_support::entry(req.message_id, "cn=a", &[("cn", &[b"a"])]),
                vec![0x30, 0x64, 0x02, 0x01],
            ])
        })
        .await;
        let (result, broken) = run(&server, &present_search("dc=example,dc=com")).await;
        let resp = result.unwrap();
        assert!(broken);
        assert_eq!(resp.entries.len(), 1);
        assert_eq!(resp.entries[0].dn, "cn=a");
        assert_eq!(resp.result.result_code.code, result_code::UNAVAILABLE);
        assert!(resp.result.error_message.unwrap().contains("middle of a message"));
        server.wait_closed(1).await;
        assert_eq!(server.tags(), vec![0x63]);
    }

    #[tokio::test]
    async fn test_search_interrupted_by_notice() {
        let server = FakeServer::start(|req| {
            Reply::Send(vec![
                test_support::entry(req.message_id, "cn=a", &[("cn", &[b"a"])]),
                test_support::notice_of_disconnection(),
            ])
        })
        .await;
        let (result, broken) = run(&server, &present_search("dc=example,dc=com")).await;
        let resp = result.unwrap();
        assert!(broken);
        assert_eq!(resp.entries.len(), 1);
        assert_eq!(resp.result.result_code.code, result_code::UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_search_negative_limits_rejected() {
        let server = FakeServer::start(test_support::succeed_all).await;
        let mut req = present_search("dc=example,dc=com");
        req.size_limit = -1;
        assert!(matches!(run(&server, &req).await.0, Err(GatewayError::MalformedRequest(_))));
        let mut req = present_search("dc=example,dc=com");
        req.time_limit = -5;
        assert!(matches!(run(&server, &req).await.0, Err(GatewayError::MalformedRequest(_))));
        server.wait_closed(2).await;
        assert_eq!(server.tags(), vec![0x42, 0x42]);
    }

    #[tokio::test]
    async fn test_search_bad_filter_sends_nothing() {
        let server = FakeServer::start(test_support::succeed_all).await;
        let mut req = present_search("dc=example,dc=com");
        req.filter = FilterNode::And { filters: Vec::new() };
        let (result, _) = run(&server, &req).await;
        assert!(matches!(result, Err(GatewayError::MalformedRequest(_))));
        server.wait_closed(1).await;
        assert_eq!(server.tags(), vec![0x42]);
    }
}
