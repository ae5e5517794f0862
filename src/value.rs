//! Conversion between values as they appear in batch documents and LDAP attribute values.
//!
//! `to_binary` is pure except for URI values, which are fetched through a [`UriResolver`].

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use tracing::debug;
use url::Url;

const CHUNK_SIZE: usize = 1024;

/// A value supplied by the caller. Bare strings in a document are text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "ValueRepr")]
pub enum DsmlValue {
    Text(String),
    Binary(Vec<u8>),
    Uri(String),
    Element(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ValueRepr {
    Plain(String),
    Text {
        text: String,
    },
    Binary {
        #[serde(with = "base64_bytes")]
        base64: Vec<u8>,
    },
    Uri {
        uri: String,
    },
    Element {
        element: String,
    },
}

impl From<ValueRepr> for DsmlValue {
    fn from(repr: ValueRepr) -> Self {
        match repr {
            ValueRepr::Plain(text) | ValueRepr::Text { text } => DsmlValue::Text(text),
            ValueRepr::Binary { base64 } => DsmlValue::Binary(base64),
            ValueRepr::Uri { uri } => DsmlValue::Uri(uri),
            ValueRepr::Element { element } => DsmlValue::Element(element),
        }
    }
}

impl From<&str> for DsmlValue {
    fn from(text: &str) -> Self {
        DsmlValue::Text(text.to_string())
    }
}

/// A value returned to the caller: text when the bytes are UTF-8, base64 otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    Text(String),
    Binary {
        #[serde(rename = "base64", with = "base64_bytes")]
        bytes: Vec<u8>,
    },
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}

/// Opens the content behind a URI-valued attribute.
pub trait UriResolver: Send + Sync {
    fn open(&self, uri: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Resolves `file:` URIs from the local filesystem; any other scheme is unsupported.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileUriResolver;

impl UriResolver for FileUriResolver {
    fn open(&self, uri: &str) -> io::Result<Box<dyn Read + Send>> {
        let url = Url::parse(uri).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if url.scheme() != "file" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported URI scheme: {}", url.scheme()),
            ));
        }
        let path = url
            .to_file_path()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("not a local file URI: {}", uri)))?;
        debug!("Reading URI value from {:?}", path);
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

/// Bytes for an LDAP request. `None` in, `None` out.
pub fn to_binary(value: Option<&DsmlValue>, resolver: &dyn UriResolver) -> Result<Option<Vec<u8>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let bytes = match value {
        DsmlValue::Text(s) | DsmlValue::Element(s) => s.as_bytes().to_vec(),
        DsmlValue::Binary(b) => b.clone(),
        DsmlValue::Uri(uri) => read_uri(uri, resolver)?,
    };
    Ok(Some(bytes))
}

/// Like [`to_binary`] for an operand that must be present.
pub fn required_binary(value: Option<&DsmlValue>, what: &str, resolver: &dyn UriResolver) -> Result<Vec<u8>> {
    to_binary(value, resolver)?.ok_or_else(|| GatewayError::MalformedRequest(format!("missing value for {}", what)))
}

pub fn to_binary_all(values: &[DsmlValue], resolver: &dyn UriResolver) -> Result<Vec<Vec<u8>>> {
    values
        .iter()
        .map(|v| required_binary(Some(v), "attribute value", resolver))
        .collect()
}

fn read_uri(uri: &str, resolver: &dyn UriResolver) -> Result<Vec<u8>> {
    let unresolvable = |source: io::Error| GatewayError::UnresolvableUri {
        uri: uri.to_string(),
        source,
    };
    let mut reader = resolver.open(uri).map_err(unresolvable)?;
    let mut content = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => content.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(unresolvable(e)),
        }
    }
    Ok(content)
}

/// Best-effort decode of an LDAP value; there is no schema knowledge here.
pub fn from_binary(bytes: &[u8]) -> AttrValue {
    match std::str::from_utf8(bytes) {
        Ok(text) => AttrValue::Text(text.to_string()),
        Err(_) => AttrValue::Binary { bytes: bytes.to_vec() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct MapResolver(HashMap<String, Vec<u8>>);

    impl UriResolver for MapResolver {
        fn open(&self, uri: &str) -> io::Result<Box<dyn Read + Send>> {
            self.0
                .get(uri)
                .map(|v| Box::new(io::Cursor::new(v.clone())) as Box<dyn Read + Send>)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away"))
        }
    }

    struct BrokenResolver;

    impl UriResolver for BrokenResolver {
        fn open(&self, _uri: &str) -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(BrokenReader))
        }
    }

    #[test]
    fn test_text_round_trip() {
        let bytes = to_binary(Some(&DsmlValue::from("hello")), &FileUriResolver).unwrap().unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(from_binary(&bytes), AttrValue::Text("hello".to_string()));
    }

    #[test]
    fn test_non_utf8_stays_bytes() {
        let raw = vec![0xFF, 0xFE, 0x00, 0x80];
        assert_eq!(from_binary(&raw), AttrValue::Binary { bytes: raw.clone() });
        let bytes = to_binary(Some(&DsmlValue::Binary(raw.clone())), &FileUriResolver).unwrap();
        assert_eq!(bytes, Some(raw));
    }

    #[test]
    fn test_none_yields_none() {
        assert_eq!(to_binary(None, &FileUriResolver).unwrap(), None);
        let err = required_binary(None, "assertion", &FileUriResolver).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedRequest(_)));
    }

    #[test]
    fn test_element_text() {
        let v = DsmlValue::Element("<b>x</b>".to_string());
        assert_eq!(to_binary(Some(&v), &FileUriResolver).unwrap().unwrap(), b"<b>x</b>");
    }

    #[test]
    fn test_uri_content_larger_than_chunk() {
        let content: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let resolver = MapResolver(HashMap::from([("mem:photo".to_string(), content.clone())]));
        let v = DsmlValue::Uri("mem:photo".to_string());
        assert_eq!(to_binary(Some(&v), &resolver).unwrap().unwrap(), content);
    }

    #[test]
    fn test_uri_open_failure() {
        let resolver = MapResolver(HashMap::new());
        let err = to_binary(Some(&DsmlValue::Uri("mem:missing".to_string())), &resolver).unwrap_err();
        match err {
            GatewayError::UnresolvableUri { uri, .. } => assert_eq!(uri, "mem:missing"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_uri_read_failure() {
        let err = to_binary(Some(&DsmlValue::Uri("x:y".to_string())), &BrokenResolver).unwrap_err();
        assert!(matches!(err, GatewayError::UnresolvableUri { .. }));
    }

    #[test]
    fn test_file_resolver() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"from disk").unwrap();
        file.flush().unwrap();
        let uri = Url::from_file_path(file.path()).unwrap().to_string();
        let v = DsmlValue::Uri(uri);
        assert_eq!(to_binary(Some(&v), &FileUriResolver).unwrap().unwrap(), b"from disk");
    }

    #[test]
    fn test_file_resolver_rejects_other_schemes() {
        let err = FileUriResolver.open("http://example.com/x").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_value_document_forms() {
        let yaml = r#"
- plain
- text: tagged
- base64: AAEC
- uri: "file:///tmp/x"
- element: "<a/>"
"#;
        let values: Vec<DsmlValue> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            values,
            vec![
                DsmlValue::Text("plain".to_string()),
                DsmlValue::Text("tagged".to_string()),
                DsmlValue::Binary(vec![0, 1, 2]),
                DsmlValue::Uri("file:///tmp/x".to_string()),
                DsmlValue::Element("<a/>".to_string()),
            ]
        );
    }

    #[test]
    fn test_attr_value_serialization() {
        let out = serde_yaml::to_string(&vec![
            AttrValue::Text("abc".to_string()),
            AttrValue::Binary { bytes: vec![0xFF, 0x00] },
        ])
        .unwrap();
        assert!(out.contains("- abc"));
        assert!(out.contains("base64: /wA="));
    }
}
