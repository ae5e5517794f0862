//! LDAP result codes and their DSML names (RFC 4511 Appendix A).

use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;

pub const SUCCESS: i32 = 0;
pub const COMPARE_FALSE: i32 = 5;
pub const COMPARE_TRUE: i32 = 6;
pub const REFERRAL: i32 = 10;
pub const UNAVAILABLE: i32 = 52;

const RESULT_CODES: &[(i32, &str)] = &[
    (0, "success"),
    (1, "operationsError"),
    (2, "protocolError"),
    (3, "timeLimitExceeded"),
    (4, "sizeLimitExceeded"),
    (5, "compareFalse"),
    (6, "compareTrue"),
    (7, "authMethodNotSupported"),
    (8, "strongAuthRequired"),
    (10, "referral"),
    (11, "adminLimitExceeded"),
    (12, "unavailableCriticalExtension"),
    (13, "confidentialityRequired"),
    (14, "saslBindInProgress"),
    (16, "noSuchAttribute"),
    (17, "undefinedAttributeType"),
    (18, "inappropriateMatching"),
    (19, "constraintViolation"),
    (20, "attributeOrValueExists"),
    (21, "invalidAttributeSyntax"),
    (32, "noSuchObject"),
    (33, "aliasProblem"),
    (34, "invalidDNSyntax"),
    (36, "aliasDereferencingProblem"),
    (48, "inappropriateAuthentication"),
    (49, "invalidCredentials"),
    (50, "insufficientAccessRights"),
    (51, "busy"),
    (52, "unavailable"),
    (53, "unwillingToPerform"),
    (54, "loopDetect"),
    (64, "namingViolation"),
    (65, "objectClassViolation"),
    (66, "notAllowedOnNonLeaf"),
    (67, "notAllowedOnRDN"),
    (68, "entryAlreadyExists"),
    (69, "objectClassModsProhibited"),
    (71, "affectsMultipleDSAs"),
    (80, "other"),
];

static REGISTRY: LazyLock<HashMap<i32, &'static str>> =
    LazyLock::new(|| RESULT_CODES.iter().copied().collect());

/// Numeric result code plus its canonical description, if the code is a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResultCode {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'static str>,
}

impl ResultCode {
    pub fn from_code(code: i32) -> Self {
        Self {
            code,
            description: REGISTRY.get(&code).copied(),
        }
    }
}

/// success, compareFalse, compareTrue and referral do not stop a batch.
pub fn is_acceptable(code: i32) -> bool {
    matches!(code, SUCCESS | COMPARE_FALSE | COMPARE_TRUE | REFERRAL)
}
