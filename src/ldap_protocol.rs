// LDAP protocol handling with BER encoding/decoding
// Client side of LDAP v3: requests are encoded, responses are decoded

use anyhow::{Context, Result, bail};
use std::fmt;
use std::io::{Cursor, Read};

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

/// RFC 4370 Proxied Authorization v2 control OID
pub const PROXIED_AUTHZ_V2_OID: &str = "2.16.840.1.113730.3.4.18";

/// OID for StartTLS extended operation (RFC 4511).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// Unsolicited notification sent by servers before dropping a connection (RFC 4511 4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

impl Control {
    /// Proxied authorization control; the value is the raw authzId ("dn:..." or "u:...").
    pub fn proxied_authorization(authz_id: &str) -> Self {
        Self {
            ctype: PROXIED_AUTHZ_V2_OID.to_string(),
            critical: true,
            value: Some(authz_id.as_bytes().to_vec()),
        }
    }
}

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Vec<Control>,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResponse),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResponse),
    AddRequest(AddRequest),
    AddResponse(LdapResponse),
    DelRequest(DelRequest),
    DelResponse(LdapResponse),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResponse),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResponse),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    /// Human-readable operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BIND",
            ProtocolOp::BindResponse(_) => "BIND RESPONSE",
            ProtocolOp::UnbindRequest => "UNBIND",
            ProtocolOp::SearchRequest(_) => "SEARCH",
            ProtocolOp::SearchResultEntry(_) => "SEARCH ENTRY",
            ProtocolOp::SearchResultReference(_) => "SEARCH REFERENCE",
            ProtocolOp::SearchResultDone(_) => "SEARCH DONE",
            ProtocolOp::ModifyRequest(_) => "MODIFY",
            ProtocolOp::ModifyResponse(_) => "MODIFY RESPONSE",
            ProtocolOp::AddRequest(_) => "ADD",
            ProtocolOp::AddResponse(_) => "ADD RESPONSE",
            ProtocolOp::DelRequest(_) => "DELETE",
            ProtocolOp::DelResponse(_) => "DELETE RESPONSE",
            ProtocolOp::ModifyDNRequest(_) => "MODIFYDN",
            ProtocolOp::ModifyDNResponse(_) => "MODIFYDN RESPONSE",
            ProtocolOp::CompareRequest(_) => "COMPARE",
            ProtocolOp::CompareResponse(_) => "COMPARE RESPONSE",
            ProtocolOp::AbandonRequest(_) => "ABANDON",
            ProtocolOp::ExtendedRequest(_) => "EXTENDED",
            ProtocolOp::ExtendedResponse(_) => "EXTENDED RESPONSE",
            ProtocolOp::IntermediateResponse(_) => "INTERMEDIATE",
        }
    }
}

/// LDAPResult components shared by every final response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapResponse {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(String),
    Sasl { mechanism: String, credentials: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct BindResponse {
    pub result: LdapResponse,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

/// Search filter (RFC 4511 4.5.1.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch { attr: String, value: Vec<u8> },
    Substrings {
        attr: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_: Option<Vec<u8>>,
    },
    GreaterOrEqual { attr: String, value: Vec<u8> },
    LessOrEqual { attr: String, value: Vec<u8> },
    Present(String),
    ApproxMatch { attr: String, value: Vec<u8> },
    ExtensibleMatch {
        matching_rule: Option<String>,
        attr: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    /// RFC 4515 string form, used for logging.
    pub fn to_ldap_string(&self) -> String {
        self.to_string()
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    for &b in value {
        match b {
            b'*' | b'(' | b')' | b'\\' | 0 => write!(f, "\\{:02x}", b)?,
            0x20..=0x7E => write!(f, "{}", b as char)?,
            _ => write!(f, "\\{:02x}", b)?,
        }
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                let op = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({}", op)?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            Filter::Not(child) => write!(f, "(!{})", child),
            Filter::EqualityMatch { attr, value } => {
                write!(f, "({}=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::Substrings { attr, initial, any, final_ } => {
                write!(f, "({}=", attr)?;
                if let Some(v) = initial {
                    write_escaped(f, v)?;
                }
                write!(f, "*")?;
                for v in any {
                    write_escaped(f, v)?;
                    write!(f, "*")?;
                }
                if let Some(v) = final_ {
                    write_escaped(f, v)?;
                }
                write!(f, ")")
            }
            Filter::GreaterOrEqual { attr, value } => {
                write!(f, "({}>=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::LessOrEqual { attr, value } => {
                write!(f, "({}<=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::ApproxMatch { attr, value } => {
                write!(f, "({}~=", attr)?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
            Filter::ExtensibleMatch { matching_rule, attr, value, dn_attributes } => {
                write!(f, "(")?;
                if let Some(a) = attr {
                    write!(f, "{}", a)?;
                }
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":=")?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExtendedResponse {
    pub result: LdapResponse,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

// BER parsing utilities
pub(crate) struct BerReader<'a> {
    pub(crate) cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub(crate) fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub(crate) fn peek_tag(&self) -> Option<u8> {
        let pos = self.cursor.position() as usize;
        self.cursor.get_ref().get(pos).copied()
    }

    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!("BER truncated: length encoding needs {} bytes, {} remaining", length_bytes, self.remaining());
            }
            let mut length = 0u32;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as u32;
            }
            Ok(length as usize)
        }
    }

    /// Split off the next `len` bytes as an independent reader and skip past them.
    pub(crate) fn sub_reader(&mut self, len: usize) -> Result<BerReader<'a>> {
        if self.remaining() < len {
            bail!("BER truncated: element needs {} bytes, {} remaining", len, self.remaining());
        }
        let start = self.cursor.position() as usize;
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + len) as u64);
        Ok(BerReader::new(&data[start..start + len]))
    }

    /// Read tag + length of a constructed element and return a reader over its content.
    pub(crate) fn read_constructed(&mut self) -> Result<(u8, BerReader<'a>)> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        Ok((tag, self.sub_reader(length)?))
    }

    fn read_integer_value(&mut self, length: usize) -> Result<i32> {
        if length == 0 || length > 4 {
            bail!("Integer has unsupported length: {} bytes", length);
        }
        if self.remaining() < length {
            bail!("BER truncated: integer needs {} bytes, {} remaining", length, self.remaining());
        }
        let mut buf = vec![0u8; length];
        self.cursor.read_exact(&mut buf)?;

        let mut value = 0i32;
        for &byte in &buf {
            value = (value << 8) | (byte as i32);
        }

        // Sign extension for negative numbers
        if length < 4 && (buf[0] & 0x80) != 0 {
            value |= !0 << (length * 8);
        }

        Ok(value)
    }

    pub(crate) fn read_integer(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x02 {
            bail!("Expected INTEGER tag (0x02), got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        self.read_integer_value(length)
    }

    /// Read OCTET STRING TLV. Accepts: 0x04 (universal) or any context-specific tag 0x80..=0xBF.
    pub(crate) fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.read_tag()?;
        let ok = (tag & 0x1F) == 0x04 || (0x80..=0xBF).contains(&tag);
        if !ok {
            bail!("Expected OCTET STRING tag (0x04), got: 0x{:02X}", tag);
        }
        self.read_octet_string_value()
    }

    /// Read only length + value of OCTET STRING (tag already consumed). Use after read_tag() for [0] IMPLICIT etc.
    pub(crate) fn read_octet_string_value(&mut self) -> Result<Vec<u8>> {
        let length = self.read_length()?;
        self.read_raw_bytes(length)
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    pub(crate) fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x10 {
            bail!("Expected SEQUENCE tag, got: 0x{:02X}", tag);
        }
        self.read_length()
    }

    /// ENUMERATED is encoded like an INTEGER; result codes above 127 need more than one octet.
    pub(crate) fn read_enumerated(&mut self) -> Result<i32> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x0A {
            bail!("Expected ENUMERATED tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        self.read_integer_value(length)
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        let tag = self.read_tag()?;
        if (tag & 0x1F) != 0x01 {
            bail!("Expected BOOLEAN tag, got: 0x{:02X}", tag);
        }
        let length = self.read_length()?;
        if length != 1 {
            bail!("Boolean value must be 1 byte, got: {}", length);
        }
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf[0] != 0)
    }

    pub(crate) fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }

    pub(crate) fn read_raw_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.remaining() < n {
            bail!("BER truncated: need {} bytes, {} remaining", n, self.remaining());
        }
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }
}

// BER encoding utilities
#[derive(Default)]
pub struct BerWriter {
    buffer: Vec<u8>,
}

fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        // Short form
        vec![length as u8]
    } else {
        // Long form
        let mut bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        bytes.reverse();
        let mut out = Vec::with_capacity(bytes.len() + 1);
        out.push(0x80 | bytes.len() as u8);
        out.extend_from_slice(&bytes);
        out
    }
}

/// Minimal two's complement big-endian content octets of an INTEGER.
fn integer_content(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    pub fn write_length(&mut self, length: usize) {
        let encoded = encode_length(length);
        self.buffer.extend_from_slice(&encoded);
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tagged_integer(0x02, value); // INTEGER tag
    }

    /// INTEGER content under an arbitrary (e.g. [APPLICATION 16]) tag.
    pub fn write_tagged_integer(&mut self, tag: u8, value: i32) {
        let content = integer_content(value);
        self.write_tag(tag);
        self.write_length(content.len());
        self.buffer.extend_from_slice(&content);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged_octets(0x04, data); // OCTET STRING tag
    }

    /// Primitive element with raw content, e.g. [0] IMPLICIT OCTET STRING.
    pub fn write_tagged_octets(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tagged_boolean(0x01, value); // BOOLEAN tag
    }

    pub fn write_tagged_boolean(&mut self, tag: u8, value: bool) {
        self.write_tag(tag);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_tagged_integer(0x0A, value); // ENUMERATED tag
    }

    /// Open a constructed element; returns the position of its length placeholder.
    /// Call end_constructed(pos) after writing the content.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patch length at pos for content written after the placeholder.
    /// Supports short and long form.
    pub fn end_constructed(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        let encoded = encode_length(content_len);
        self.buffer.splice(pos..pos + 1, encoded);
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30) // SEQUENCE tag
    }

    pub fn end_sequence(&mut self, start_pos: usize) {
        self.end_constructed(start_pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;
/// LDAPResult referral [3]
const LDAP_CONTEXT_REFERRAL: u8 = 0xA3;

// Filter CHOICE tags
const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;
const FILTER_EXTENSIBLE: u8 = 0xA9;

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Returns (message_id, op_tag) for logging when full parse fails.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

/// Total size of the first complete BER element in `buf`, or None if more bytes are needed.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first_byte = buf[1];
    if (first_byte & 0x80) == 0 {
        return Ok(Some(2 + first_byte as usize));
    }
    let length_bytes = (first_byte & 0x7F) as usize;
    if length_bytes == 0 || length_bytes > 4 {
        bail!("Invalid length encoding");
    }
    if buf.len() < 2 + length_bytes {
        return Ok(None);
    }
    let mut length = 0usize;
    for i in 0..length_bytes {
        length = (length << 8) | buf[2 + i] as usize;
    }
    Ok(Some(2 + length_bytes + length))
}

/// Decode one LDAPMessage carrying a response (or unsolicited notification) from the server.
pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let seq_len = outer.read_sequence()?;
    let mut reader = outer.sub_reader(seq_len)?;

    let message_id = reader.read_integer()?;

    let (tag, mut body) = reader.read_constructed()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(&mut body)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => ProtocolOp::SearchResultEntry(parse_search_result_entry(&mut body)?),
        LDAP_TAG_SEARCH_RESULT_REFERENCE => ProtocolOp::SearchResultReference(parse_uris(&mut body)?),
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_ldap_result(&mut body)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_ldap_result(&mut body)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_ldap_result(&mut body)?),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_ldap_result(&mut body)?),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDNResponse(parse_ldap_result(&mut body)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_ldap_result(&mut body)?),
        LDAP_TAG_EXTENDED_RESPONSE => ProtocolOp::ExtendedResponse(parse_extended_response(&mut body)?),
        LDAP_TAG_INTERMEDIATE_RESPONSE => ProtocolOp::IntermediateResponse(parse_intermediate_response(&mut body)?),
        _ => bail!("Unsupported LDAP response tag: 0x{:02X}", tag),
    };

    let controls = if reader.peek_tag() == Some(LDAP_CONTEXT_CONTROLS) {
        let (_, mut ctrl_reader) = reader.read_constructed()?;
        parse_controls(&mut ctrl_reader)?
    } else {
        Vec::new()
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(reader: &mut BerReader) -> Result<Vec<Control>> {
    let mut controls = Vec::new();
    while reader.remaining() > 0 {
        let (_, mut ctrl) = reader.read_constructed()?;
        let ctype = ctrl.read_string()?;
        let critical = if ctrl.peek_tag() == Some(0x01) {
            ctrl.read_boolean()?
        } else {
            false
        };
        let value = if ctrl.remaining() > 0 {
            Some(ctrl.read_octet_string()?)
        } else {
            None
        };
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

/// LDAPResult ::= SEQUENCE { resultCode, matchedDN, diagnosticMessage, referral [3] OPTIONAL }
/// Trailing elements that belong to the enclosing response are left unread.
fn parse_ldap_result(reader: &mut BerReader) -> Result<LdapResponse> {
    let result_code = reader.read_enumerated()?;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    let referrals = if reader.peek_tag() == Some(LDAP_CONTEXT_REFERRAL) {
        let (_, mut refs) = reader.read_constructed()?;
        parse_uris(&mut refs)?
    } else {
        Vec::new()
    };
    Ok(LdapResponse {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn parse_uris(reader: &mut BerReader) -> Result<Vec<String>> {
    let mut uris = Vec::new();
    while reader.remaining() > 0 {
        uris.push(reader.read_string()?);
    }
    Ok(uris)
}

/// serverSaslCreds [7] is left unread; PLAIN is a single-step mechanism.
fn parse_bind_response(reader: &mut BerReader) -> Result<BindResponse> {
    Ok(BindResponse {
        result: parse_ldap_result(reader)?,
    })
}

fn parse_extended_response(reader: &mut BerReader) -> Result<ExtendedResponse> {
    let result = parse_ldap_result(reader)?;
    let mut response_name = None;
    let mut response_value = None;
    while reader.remaining() > 0 {
        let tag = reader.read_tag()?;
        match tag {
            0x8A => {
                let bytes = reader.read_octet_string_value()?;
                response_name = Some(String::from_utf8(bytes).context("Invalid responseName")?);
            }
            0x8B => response_value = Some(reader.read_octet_string_value()?),
            _ => bail!("ExtendedResponse: unexpected tag 0x{:02X}", tag),
        }
    }
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

fn parse_intermediate_response(reader: &mut BerReader) -> Result<IntermediateResponse> {
    let mut response_name = None;
    let mut response_value = None;
    while reader.remaining() > 0 {
        let tag = reader.read_tag()?;
        match tag {
            0x80 => {
                let bytes = reader.read_octet_string_value()?;
                response_name = Some(String::from_utf8_lossy(&bytes).to_string());
            }
            0x81 => response_value = Some(reader.read_octet_string_value()?),
            _ => bail!("IntermediateResponse: unexpected tag 0x{:02X}", tag),
        }
    }
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

fn parse_search_result_entry(reader: &mut BerReader) -> Result<SearchResultEntry> {
    let object_name = reader.read_string()?;
    let (_, mut attrs) = reader.read_constructed()?;
    let mut attributes = Vec::new();
    while attrs.remaining() > 0 {
        attributes.push(parse_attribute(&mut attrs)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

/// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let (_, mut attr) = reader.read_constructed()?;
    let attr_type = attr.read_string()?;

    let (_, mut vals) = attr.read_constructed()?;
    let mut attr_values = Vec::new();
    while vals.remaining() > 0 {
        attr_values.push(vals.read_octet_string()?);
    }

    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::UnbindRequest => {
            writer.write_tag(LDAP_TAG_UNBIND_REQUEST);
            writer.write_length(0);
        }
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req)?,
        ProtocolOp::ModifyRequest(req) => encode_modify_request(&mut writer, req),
        ProtocolOp::AddRequest(req) => encode_add_request(&mut writer, req),
        ProtocolOp::DelRequest(req) => {
            writer.write_tagged_octets(LDAP_TAG_DEL_REQUEST, req.entry.as_bytes());
        }
        ProtocolOp::ModifyDNRequest(req) => encode_modify_dn_request(&mut writer, req),
        ProtocolOp::CompareRequest(req) => encode_compare_request(&mut writer, req),
        ProtocolOp::AbandonRequest(id) => {
            writer.write_tagged_integer(LDAP_TAG_ABANDON_REQUEST, *id);
        }
        ProtocolOp::ExtendedRequest(req) => encode_extended_request(&mut writer, req),
        other => bail!("Cannot encode {} as a client request", other.name()),
    }

    if !message.controls.is_empty() {
        encode_controls(&mut writer, &message.controls);
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

fn encode_controls(writer: &mut BerWriter, controls: &[Control]) {
    let ctrls_start = writer.start_constructed(LDAP_CONTEXT_CONTROLS);
    for control in controls {
        let ctrl_start = writer.start_sequence();
        writer.write_string(&control.ctype);
        if control.critical {
            writer.write_boolean(true);
        }
        if let Some(ref value) = control.value {
            writer.write_octet_string(value);
        }
        writer.end_sequence(ctrl_start);
    }
    writer.end_constructed(ctrls_start);
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) {
    let start = writer.start_constructed(LDAP_TAG_BIND_REQUEST);
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    match &req.authentication {
        BindAuthentication::Simple(password) => {
            writer.write_tagged_octets(0x80, password.as_bytes());
        }
        BindAuthentication::Sasl { mechanism, credentials } => {
            let sasl_start = writer.start_constructed(0xA3);
            writer.write_string(mechanism);
            writer.write_octet_string(credentials);
            writer.end_constructed(sasl_start);
        }
    }
    writer.end_constructed(start);
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) -> Result<()> {
    let start = writer.start_constructed(LDAP_TAG_SEARCH_REQUEST);
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as i32);
    writer.write_enumerated(req.deref_aliases as i32);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    encode_filter(writer, &req.filter)?;
    let attrs_start = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end_sequence(attrs_start);
    writer.end_constructed(start);
    Ok(())
}

fn encode_ava(writer: &mut BerWriter, tag: u8, attr: &str, value: &[u8]) {
    let start = writer.start_constructed(tag);
    writer.write_string(attr);
    writer.write_octet_string(value);
    writer.end_constructed(start);
}

pub fn encode_filter(writer: &mut BerWriter, filter: &Filter) -> Result<()> {
    match filter {
        Filter::And(children) | Filter::Or(children) => {
            let tag = if matches!(filter, Filter::And(_)) { FILTER_AND } else { FILTER_OR };
            let start = writer.start_constructed(tag);
            for child in children {
                encode_filter(writer, child)?;
            }
            writer.end_constructed(start);
        }
        Filter::Not(child) => {
            let start = writer.start_constructed(FILTER_NOT);
            encode_filter(writer, child)?;
            writer.end_constructed(start);
        }
        Filter::EqualityMatch { attr, value } => encode_ava(writer, FILTER_EQUALITY, attr, value),
        Filter::GreaterOrEqual { attr, value } => encode_ava(writer, FILTER_GREATER_OR_EQUAL, attr, value),
        Filter::LessOrEqual { attr, value } => encode_ava(writer, FILTER_LESS_OR_EQUAL, attr, value),
        Filter::ApproxMatch { attr, value } => encode_ava(writer, FILTER_APPROX, attr, value),
        Filter::Substrings { attr, initial, any, final_ } => {
            if initial.is_none() && any.is_empty() && final_.is_none() {
                bail!("Substring filter for {} has no components", attr);
            }
            let start = writer.start_constructed(FILTER_SUBSTRINGS);
            writer.write_string(attr);
            let subs_start = writer.start_sequence();
            if let Some(v) = initial {
                writer.write_tagged_octets(0x80, v);
            }
            for v in any {
                writer.write_tagged_octets(0x81, v);
            }
            if let Some(v) = final_ {
                writer.write_tagged_octets(0x82, v);
            }
            writer.end_sequence(subs_start);
            writer.end_constructed(start);
        }
        Filter::Present(attr) => writer.write_tagged_octets(FILTER_PRESENT, attr.as_bytes()),
        Filter::ExtensibleMatch { matching_rule, attr, value, dn_attributes } => {
            let start = writer.start_constructed(FILTER_EXTENSIBLE);
            if let Some(rule) = matching_rule {
                writer.write_tagged_octets(0x81, rule.as_bytes());
            }
            if let Some(a) = attr {
                writer.write_tagged_octets(0x82, a.as_bytes());
            }
            writer.write_tagged_octets(0x83, value);
            if *dn_attributes {
                writer.write_tagged_boolean(0x84, true);
            }
            writer.end_constructed(start);
        }
    }
    Ok(())
}

fn encode_modify_request(writer: &mut BerWriter, req: &ModifyRequest) {
    let start = writer.start_constructed(LDAP_TAG_MODIFY_REQUEST);
    writer.write_string(&req.object);
    let changes_start = writer.start_sequence();
    for change in &req.changes {
        let change_start = writer.start_sequence();
        writer.write_enumerated(change.operation as i32);
        encode_attribute(writer, &change.modification);
        writer.end_sequence(change_start);
    }
    writer.end_sequence(changes_start);
    writer.end_constructed(start);
}

fn encode_add_request(writer: &mut BerWriter, req: &AddRequest) {
    let start = writer.start_constructed(LDAP_TAG_ADD_REQUEST);
    writer.write_string(&req.entry);
    let attrs_start = writer.start_sequence();
    for attr in &req.attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(attrs_start);
    writer.end_constructed(start);
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn encode_modify_dn_request(writer: &mut BerWriter, req: &ModifyDNRequest) {
    let start = writer.start_constructed(LDAP_TAG_MODIFY_DN_REQUEST);
    writer.write_string(&req.entry);
    writer.write_string(&req.newrdn);
    writer.write_boolean(req.delete_old_rdn);
    if let Some(ref superior) = req.new_superior {
        writer.write_tagged_octets(0x80, superior.as_bytes());
    }
    writer.end_constructed(start);
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn encode_compare_request(writer: &mut BerWriter, req: &CompareRequest) {
    let start = writer.start_constructed(LDAP_TAG_COMPARE_REQUEST);
    writer.write_string(&req.entry);
    let ava_start = writer.start_sequence();
    writer.write_string(&req.attr);
    writer.write_octet_string(&req.assertion_value);
    writer.end_sequence(ava_start);
    writer.end_constructed(start);
}

fn encode_extended_request(writer: &mut BerWriter, req: &ExtendedRequest) {
    let start = writer.start_constructed(LDAP_TAG_EXTENDED_REQUEST);
    writer.write_tagged_octets(0x80, req.request_name.as_bytes());
    if let Some(ref value) = req.request_value {
        writer.write_tagged_octets(0x81, value);
    }
    writer.end_constructed(start);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq_start = writer.start_sequence();
    writer.write_string(&attr.attr_type);

    let vals_start = writer.start_constructed(0x31); // SET OF
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.end_constructed(vals_start);

    writer.end_sequence(seq_start);
}
