//! DSML filter tree to LDAP filter compilation.

use crate::error::{GatewayError, Result};
use crate::ldap_protocol::Filter;
use crate::value::{DsmlValue, UriResolver, required_binary, to_binary, to_binary_all};
use serde::Deserialize;

/// Filter element of a DSML search request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FilterNode {
    And {
        #[serde(default)]
        filters: Vec<FilterNode>,
    },
    Or {
        #[serde(default)]
        filters: Vec<FilterNode>,
    },
    Not {
        filter: Box<FilterNode>,
    },
    EqualityMatch {
        name: String,
        value: Option<DsmlValue>,
    },
    Substrings {
        name: String,
        initial: Option<DsmlValue>,
        #[serde(default)]
        any: Vec<DsmlValue>,
        #[serde(rename = "final")]
        final_: Option<DsmlValue>,
    },
    GreaterOrEqual {
        name: String,
        value: Option<DsmlValue>,
    },
    LessOrEqual {
        name: String,
        value: Option<DsmlValue>,
    },
    Present {
        name: String,
    },
    ApproxMatch {
        name: String,
        value: Option<DsmlValue>,
    },
    ExtensibleMatch {
        #[serde(rename = "matchingRule")]
        matching_rule: Option<String>,
        name: Option<String>,
        value: Option<DsmlValue>,
        #[serde(default, rename = "dnAttributes")]
        dn_attributes: bool,
    },
}

pub fn translate(node: &FilterNode, resolver: &dyn UriResolver) -> Result<Filter> {
    let filter = match node {
        FilterNode::And { filters } => Filter::And(translate_children(filters, "and", resolver)?),
        FilterNode::Or { filters } => Filter::Or(translate_children(filters, "or", resolver)?),
        FilterNode::Not { filter } => Filter::Not(Box::new(translate(filter, resolver)?)),
        FilterNode::EqualityMatch { name, value } => Filter::EqualityMatch {
            attr: name.clone(),
            value: operand(value, name, resolver)?,
        },
        FilterNode::GreaterOrEqual { name, value } => Filter::GreaterOrEqual {
            attr: name.clone(),
            value: operand(value, name, resolver)?,
        },
        FilterNode::LessOrEqual { name, value } => Filter::LessOrEqual {
            attr: name.clone(),
            value: operand(value, name, resolver)?,
        },
        FilterNode::ApproxMatch { name, value } => Filter::ApproxMatch {
            attr: name.clone(),
            value: operand(value, name, resolver)?,
        },
        FilterNode::Present { name } => Filter::Present(name.clone()),
        FilterNode::Substrings { name, initial, any, final_ } => {
            if initial.is_none() && any.is_empty() && final_.is_none() {
                return Err(GatewayError::MalformedRequest(format!(
                    "substring filter on {} has no initial, any or final value",
                    name
                )));
            }
            Filter::Substrings {
                attr: name.clone(),
                initial: to_binary(initial.as_ref(), resolver)?,
                any: to_binary_all(any, resolver)?,
                final_: to_binary(final_.as_ref(), resolver)?,
            }
        }
        FilterNode::ExtensibleMatch { matching_rule, name, value, dn_attributes } => {
            if matching_rule.is_none() && name.is_none() {
                return Err(GatewayError::MalformedRequest(
                    "extensible match needs a matching rule or an attribute name".to_string(),
                ));
            }
            Filter::ExtensibleMatch {
                matching_rule: matching_rule.clone(),
                attr: name.clone(),
                value: required_binary(value.as_ref(), "extensibleMatch", resolver)?,
                dn_attributes: *dn_attributes,
            }
        }
    };
    Ok(filter)
}

fn translate_children(children: &[FilterNode], op: &str, resolver: &dyn UriResolver) -> Result<Vec<Filter>> {
    if children.is_empty() {
        return Err(GatewayError::MalformedRequest(format!("{} filter has no children", op)));
    }
    children.iter().map(|child| translate(child, resolver)).collect()
}

fn operand(value: &Option<DsmlValue>, attr: &str, resolver: &dyn UriResolver) -> Result<Vec<u8>> {
    required_binary(value.as_ref(), attr, resolver)
}
