//! Scripted in-process directory server for connection and batch tests.

use crate::config::GatewayConfig;
use crate::ldap_protocol::{
    BerWriter, LDAP_TAG_ABANDON_REQUEST, LDAP_TAG_EXTENDED_RESPONSE, LDAP_TAG_SEARCH_RESULT_ENTRY, LDAP_TAG_SEARCH_RESULT_REFERENCE,
    LDAP_TAG_UNBIND_REQUEST, NOTICE_OF_DISCONNECTION_OID, frame_length, parse_ldap_message_header,
};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One request frame as seen by the fake server.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub message_id: i32,
    pub tag: u8,
    pub raw: Vec<u8>,
}

impl Request {
    pub fn contains(&self, needle: &[u8]) -> bool {
        self.raw.windows(needle.len()).any(|w| w == needle)
    }
}

pub(crate) enum Reply {
    Send(Vec<Vec<u8>>),
    Nothing,
    Hangup,
    /// Write the frames (possibly truncated ones), then drop the socket.
    SendAndHangup(Vec<Vec<u8>>),
}

type Handler = dyn Fn(&Request) -> Reply + Send + Sync;

pub(crate) struct FakeServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Request>>>,
    closed: Arc<AtomicUsize>,
}

impl FakeServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicUsize::new(0));
        let handler: Arc<Handler> = Arc::new(handler);
        {
            let requests = Arc::clone(&requests);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let requests = Arc::clone(&requests);
                    let closed = Arc::clone(&closed);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        serve(stream, handler, requests).await;
                        closed.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }
        Self { addr, requests, closed }
    }

    pub fn config(&self) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.ldap.host = self.addr.ip().to_string();
        config.ldap.port = Some(self.addr.port());
        config.ldap.network_timeout = Some(2);
        config
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<u8> {
        self.requests().iter().map(|r| r.tag).collect()
    }

    /// Wait until `n` client connections have ended.
    pub async fn wait_closed(&self, n: usize) {
        for _ in 0..200 {
            if self.closed.load(Ordering::SeqCst) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("fake server: {} connection(s) never closed", n);
    }
}

async fn serve(mut stream: TcpStream, handler: Arc<Handler>, requests: Arc<Mutex<Vec<Request>>>) {
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        let total = match frame_length(&buf) {
            Ok(Some(total)) if buf.len() >= total => total,
            Ok(_) => match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    continue;
                }
            },
            Err(_) => return,
        };
        let raw = buf.split_to(total).to_vec();
        let (message_id, tag) = parse_ldap_message_header(&raw).unwrap_or((0, 0));
        let request = Request { message_id, tag, raw };
        requests.lock().unwrap().push(request.clone());
        if tag == LDAP_TAG_UNBIND_REQUEST {
            return;
        }
        match handler(&request) {
            Reply::Send(frames) => {
                for frame in frames {
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                let _ = stream.flush().await;
            }
            Reply::Nothing => {}
            Reply::Hangup => return,
            Reply::SendAndHangup(frames) => {
                for frame in frames {
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
                let _ = stream.flush().await;
                return;
            }
        }
    }
}

fn envelope(message_id: i32, tag: u8, body: impl FnOnce(&mut BerWriter)) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let seq = writer.start_sequence();
    writer.write_integer(message_id);
    let op = writer.start_constructed(tag);
    body(&mut writer);
    writer.end_constructed(op);
    writer.end_sequence(seq);
    writer.into_vec()
}

/// Any LDAPResult-shaped response (bind, add, del, modify, moddn, compare, search done).
pub(crate) fn result(message_id: i32, tag: u8, code: i32, message: &str) -> Vec<u8> {
    envelope(message_id, tag, |w| {
        w.write_enumerated(code);
        w.write_string("");
        w.write_string(message);
    })
}

pub(crate) fn entry(message_id: i32, dn: &str, attrs: &[(&str, &[&[u8]])]) -> Vec<u8> {
    envelope(message_id, LDAP_TAG_SEARCH_RESULT_ENTRY, |w| {
        w.write_string(dn);
        let list = w.start_sequence();
        for (name, values) in attrs {
            let attr = w.start_sequence();
            w.write_string(name);
            let set = w.start_constructed(0x31);
            for value in values.iter() {
                w.write_octet_string(value);
            }
            w.end_constructed(set);
            w.end_sequence(attr);
        }
        w.end_sequence(list);
    })
}

pub(crate) fn reference(message_id: i32, uri: &str) -> Vec<u8> {
    envelope(message_id, LDAP_TAG_SEARCH_RESULT_REFERENCE, |w| w.write_string(uri))
}

pub(crate) fn extended(message_id: i32, code: i32, name: Option<&str>, value: Option<&[u8]>) -> Vec<u8> {
    envelope(message_id, LDAP_TAG_EXTENDED_RESPONSE, |w| {
        w.write_enumerated(code);
        w.write_string("");
        w.write_string("");
        if let Some(name) = name {
            w.write_tagged_octets(0x8A, name.as_bytes());
        }
        if let Some(value) = value {
            w.write_tagged_octets(0x8B, value);
        }
    })
}

pub(crate) fn notice_of_disconnection() -> Vec<u8> {
    envelope(0, LDAP_TAG_EXTENDED_RESPONSE, |w| {
        w.write_enumerated(52);
        w.write_string("");
        w.write_string("server shutting down");
        w.write_tagged_octets(0x8A, NOTICE_OF_DISCONNECTION_OID.as_bytes());
    })
}

/// Response tag matching a request tag.
pub(crate) fn response_tag(request_tag: u8) -> u8 {
    match request_tag {
        0x4A => 0x6B,
        0x63 => 0x65,
        0x77 => 0x78,
        tag => tag + 1,
    }
}

/// Server that answers every request with success. Abandon gets no reply.
pub(crate) fn succeed_all(request: &Request) -> Reply {
    if request.tag == LDAP_TAG_ABANDON_REQUEST {
        return Reply::Nothing;
    }
    Reply::Send(vec![result(request.message_id, response_tag(request.tag), 0, "")])
}
